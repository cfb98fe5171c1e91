//! # Worker Processes
//!
//! A worker is one OS process bound to exactly one event. Its supervisor
//! owns the child handle and the deadline; nothing else kills it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::errors::{SchedulerError, SchedulerResult};
use crate::queue::{EnvVar, PickupSignal};

pub const ENV_RPC_ADDRESS: &str = "AEROFN_RPC_ADDRESS";
pub const ENV_WORKER_ID: &str = "AEROFN_WORKER_ID";
pub const ENV_ENTRYPOINT: &str = "AEROFN_ENTRYPOINT";
pub const ENV_TIMEOUT: &str = "AEROFN_TIMEOUT";

/// Why a worker is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExitReason {
    /// Exited with status zero
    Completed { code: Option<i32> },
    /// Non-zero exit, signal, or killed on shutdown
    Crashed { code: Option<i32> },
    /// Killed at its deadline
    TimedOut,
}

/// Lifecycle of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    Spawned,
    Assigned,
    Executing,
    Exited(ExitReason),
}

/// Everything needed to start one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub worker_id: String,
    pub rpc_address: String,
    pub cwd: String,
    pub entrypoint: String,
    pub env: Vec<EnvVar>,
    pub timeout: Duration,
}

impl WorkerSpec {
    /// Environment of the process: target env first, protocol variables last
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self
            .env
            .iter()
            .map(|var| (var.key.clone(), var.value.clone()))
            .collect();
        vars.push((ENV_RPC_ADDRESS.to_string(), self.rpc_address.clone()));
        vars.push((ENV_WORKER_ID.to_string(), self.worker_id.clone()));
        vars.push((ENV_ENTRYPOINT.to_string(), self.entrypoint.clone()));
        vars.push((ENV_TIMEOUT.to_string(), self.timeout.as_secs().to_string()));
        vars
    }
}

/// Starts worker processes
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, spec: &WorkerSpec) -> SchedulerResult<Child>;
}

/// Spawns `program args...` in the target directory
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, spec: &WorkerSpec) -> SchedulerResult<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .current_dir(&spec.cwd)
            .envs(spec.environment())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SchedulerError::Spawn {
                program: self.program.display().to_string(),
                source,
            })
    }
}

/// Current state of every live worker
#[derive(Debug, Clone, Default)]
pub struct WorkerTable {
    states: Arc<Mutex<HashMap<String, WorkerState>>>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, worker_id: &str, state: WorkerState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(worker_id.to_string(), state);
        }
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerState> {
        self.states.lock().ok()?.get(worker_id).copied()
    }

    pub fn remove(&self, worker_id: &str) -> Option<WorkerState> {
        self.states.lock().ok()?.remove(worker_id)
    }

    pub fn len(&self) -> usize {
        self.states.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Watch a worker until it exits, killing it at the deadline or on shutdown
pub async fn supervise(
    worker_id: &str,
    mut child: Child,
    mut pickup: PickupSignal,
    timeout: Duration,
    table: &WorkerTable,
    mut shutdown: broadcast::Receiver<()>,
) -> ExitReason {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut picked_up = false;

    let reason = loop {
        tokio::select! {
            signal = &mut pickup, if !picked_up => {
                picked_up = true;
                if signal.is_ok() {
                    debug!(worker_id, "Worker picked up its event");
                    table.set(worker_id, WorkerState::Executing);
                }
            }
            status = child.wait() => {
                break match status {
                    Ok(status) if status.success() => ExitReason::Completed { code: status.code() },
                    Ok(status) => ExitReason::Crashed { code: status.code() },
                    Err(e) => {
                        warn!(worker_id, error = %e, "Failed to wait for worker");
                        ExitReason::Crashed { code: None }
                    }
                };
            }
            _ = &mut deadline => {
                warn!(worker_id, timeout_secs = timeout.as_secs(), "Worker timed out, killing");
                if let Err(e) = child.kill().await {
                    warn!(worker_id, error = %e, "Failed to kill worker");
                }
                break ExitReason::TimedOut;
            }
            _ = shutdown.recv() => {
                if let Err(e) = child.kill().await {
                    warn!(worker_id, error = %e, "Failed to kill worker");
                }
                break ExitReason::Crashed { code: None };
            }
        }
    };

    table.set(worker_id, WorkerState::Exited(reason));
    reason
}
