//! # Application
//!
//! Composition root. Builds the queues, scheduler, coordinator, enqueuers,
//! engine and both listeners, then wires their shutdown together.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::TargetChangeEngine;
use crate::enqueuer::{EnqueuerContext, EnqueuerSet, MemoryChangeFeed};
use crate::http_server::{AppState, HttpServer};
use crate::queue::QueueSet;
use crate::replication::{CoordinationStore, Coordinator, InMemoryCoordinationStore};
use crate::rpc::{RpcError, RpcServer};
use crate::scheduler::{ProcessSpawner, Scheduler, SchedulerHandle, WorkerSpawner};

/// Result type for application startup
pub type AppResult<T> = Result<T, AppError>;

/// Startup errors. Each one terminates the process.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Worker RPC listener: {0}")]
    Rpc(#[from] RpcError),

    #[error("Failed to bind HTTP listener {addr}: {source}")]
    HttpBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot determine worker program: {0}")]
    WorkerProgram(#[source] std::io::Error),

    #[error("Change feed: {0}")]
    Feed(String),
}

/// Replaceable parts, for running several replicas in one process
#[derive(Default)]
pub struct AppParts {
    pub store: Option<Arc<dyn CoordinationStore>>,
    pub feed: Option<Arc<MemoryChangeFeed>>,
    pub spawner: Option<Arc<dyn WorkerSpawner>>,
}

/// A running replica
pub struct App {
    pub replica_id: String,
    pub http_addr: SocketAddr,
    pub rpc_addr: SocketAddr,
    pub enqueuers: Arc<EnqueuerSet>,
    pub engine: Arc<TargetChangeEngine>,
    pub scheduler: SchedulerHandle,
    pub feed: Arc<MemoryChangeFeed>,
    shutdown_tx: broadcast::Sender<()>,
    engine_task: JoinHandle<()>,
    services: Vec<(broadcast::Sender<()>, JoinHandle<()>)>,
}

fn worker_program(config: &Config) -> AppResult<PathBuf> {
    match &config.scheduler.worker_program {
        Some(program) => Ok(program.clone()),
        None => std::env::current_exe().map_err(AppError::WorkerProgram),
    }
}

impl App {
    pub async fn start(config: &Config) -> AppResult<Self> {
        Self::start_with(config, AppParts::default()).await
    }

    pub async fn start_with(config: &Config, parts: AppParts) -> AppResult<Self> {
        let replica_id = config
            .replication
            .replica_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (queues, events) = QueueSet::new(config.pop_wait());

        let rpc_server = RpcServer::bind(&config.rpc.address, queues.clone()).await?;
        let rpc_addr = rpc_server.local_addr()?;

        let spawner: Arc<dyn WorkerSpawner> = match parts.spawner {
            Some(spawner) => spawner,
            None => Arc::new(ProcessSpawner::new(
                worker_program(config)?,
                config.scheduler.worker_args.clone(),
            )),
        };
        let mut scheduler_config = config.scheduler_config();
        scheduler_config.rpc_address = rpc_addr.to_string();
        let scheduler = Scheduler::new(scheduler_config, queues.clone(), spawner);
        let scheduler_handle = scheduler.handle();

        let store: Arc<dyn CoordinationStore> = match parts.store {
            Some(store) => store,
            None => Arc::new(InMemoryCoordinationStore::new()),
        };
        let coordinator = Coordinator::new(config.coordinator_config(replica_id.as_str()), store);

        let feed = parts
            .feed
            .unwrap_or_else(|| Arc::new(MemoryChangeFeed::new(config.database.feed_capacity)));
        for collection in &config.database.collections {
            feed.register_collection(collection)
                .map_err(|e| AppError::Feed(e.to_string()))?;
        }

        let context = EnqueuerContext {
            queues: queues.clone(),
            scheduler: scheduler_handle.clone(),
            coordinator: coordinator.clone(),
        };
        let enqueuers = Arc::new(EnqueuerSet::new(context, feed.clone()));

        let state = AppState {
            enqueuers: enqueuers.clone(),
            feed: feed.clone(),
            scheduler: scheduler_handle.clone(),
            replica_id: replica_id.clone(),
        };
        let http_addr_config = config.http.socket_addr();
        let http_server = HttpServer::bind(&config.http, state)
            .await
            .map_err(|source| AppError::HttpBind {
                addr: http_addr_config.clone(),
                source,
            })?;
        let http_addr = http_server
            .local_addr()
            .map_err(|source| AppError::HttpBind {
                addr: http_addr_config,
                source,
            })?;

        let engine = Arc::new(TargetChangeEngine::new(
            config.functions_root.clone(),
            enqueuers.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut services = Vec::new();

        let http_shutdown = http_server.shutdown_handle();
        services.push((
            http_shutdown,
            tokio::spawn(async move {
                if let Err(e) = http_server.run().await {
                    warn!(error = %e, "HTTP server failed");
                }
            }),
        ));

        let scheduler_shutdown = scheduler.shutdown_handle();
        services.push((scheduler_shutdown, tokio::spawn(scheduler.run(events))));

        let rpc_shutdown = rpc_server.shutdown_handle();
        services.push((rpc_shutdown, tokio::spawn(rpc_server.run())));

        let (sweeper_shutdown, _) = broadcast::channel(1);
        services.push((
            sweeper_shutdown.clone(),
            tokio::spawn(coordinator.run_sweeper(sweeper_shutdown.subscribe())),
        ));

        let engine_task = tokio::spawn(
            engine
                .clone()
                .run(config.poll_interval(), shutdown_tx.subscribe()),
        );

        info!(
            replica_id = %replica_id,
            http = %http_addr,
            rpc = %rpc_addr,
            functions_root = %config.functions_root.display(),
            "Replica started"
        );

        Ok(Self {
            replica_id,
            http_addr,
            rpc_addr,
            enqueuers,
            engine,
            scheduler: scheduler_handle,
            feed,
            shutdown_tx,
            engine_task,
            services,
        })
    }

    /// Stop the engine first so every target is unsubscribed, then the
    /// listeners and the scheduler.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.engine_task.await {
            warn!(error = %e, "Engine task failed");
        }

        for (shutdown, task) in self.services {
            let _ = shutdown.send(());
            if let Err(e) = task.await {
                warn!(error = %e, "Service task failed");
            }
        }
        info!(replica_id = %self.replica_id, "Replica stopped");
    }

    /// Run until Ctrl-C
    pub async fn run_until_signal(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
        }
        info!("Shutdown requested");
        self.shutdown().await;
    }
}
