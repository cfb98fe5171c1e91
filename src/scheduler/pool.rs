//! # Worker Pool
//!
//! Turns events into worker processes. At most `max_concurrency` workers
//! run at once and at most one per `(cwd, handler)`; everything else waits
//! in a FIFO backlog.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::errors::{SchedulerError, SchedulerResult};
use super::worker::{supervise, ExitReason, WorkerSpawner, WorkerSpec, WorkerState, WorkerTable};
use crate::queue::{Event, EventReceiver, QueueSet, Target, TargetKey};

/// Pool settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of live workers
    pub max_concurrency: usize,

    /// Address workers use to reach the RPC server
    pub rpc_address: String,

    /// Deadline for targets that do not set one
    pub default_timeout: Duration,

    /// How long shutdown waits for killed workers to be reaped
    pub kill_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            rpc_address: "127.0.0.1:7070".to_string(),
            default_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct RunningWorker {
    key: TargetKey,
    event: Event,
    /// Deadline actually applied, after the default fallback
    timeout: Duration,
}

#[derive(Debug, Default)]
struct PoolState {
    running: HashMap<String, RunningWorker>,
    busy: HashSet<TargetKey>,
    backlog: VecDeque<Event>,
}

impl PoolState {
    /// Index of the oldest backlogged event that may start now
    fn next_ready(&self, max_concurrency: usize) -> Option<usize> {
        if self.running.len() >= max_concurrency {
            return None;
        }
        self.backlog
            .iter()
            .position(|event| !self.busy.contains(&event.target.key()))
    }
}

#[derive(Debug)]
struct WorkerExit {
    worker_id: String,
    reason: ExitReason,
}

/// Cloneable view of the pool used by enqueuers and the HTTP surface
#[derive(Clone)]
pub struct SchedulerHandle {
    state: Arc<Mutex<PoolState>>,
    queues: QueueSet,
    workers: WorkerTable,
}

impl SchedulerHandle {
    /// Drop backlogged events for a target that was unsubscribed
    pub fn release_target(&self, target: &Target) -> usize {
        let dropped: Vec<Event> = match self.state.lock() {
            Ok(mut state) => {
                let (dropped, kept): (Vec<Event>, Vec<Event>) = state
                    .backlog
                    .drain(..)
                    .partition(|event| target.covers(&event.target));
                state.backlog = kept.into();
                dropped
            }
            Err(_) => return 0,
        };

        for event in &dropped {
            self.queues
                .abandon(event, 503, "Function is no longer subscribed");
        }
        if !dropped.is_empty() {
            info!(function = %target, dropped = dropped.len(), "Dropped backlogged events");
        }
        dropped.len()
    }

    pub fn running(&self) -> usize {
        self.state.lock().map(|s| s.running.len()).unwrap_or(0)
    }

    pub fn backlog(&self) -> usize {
        self.state.lock().map(|s| s.backlog.len()).unwrap_or(0)
    }

    pub fn worker_state(&self, worker_id: &str) -> Option<WorkerState> {
        self.workers.get(worker_id)
    }
}

/// Worker pool driven by the event queue
pub struct Scheduler {
    config: SchedulerConfig,
    queues: QueueSet,
    spawner: Arc<dyn WorkerSpawner>,
    state: Arc<Mutex<PoolState>>,
    workers: WorkerTable,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
    exit_rx: mpsc::UnboundedReceiver<WorkerExit>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, queues: QueueSet, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queues,
            spawner,
            state: Arc::new(Mutex::new(PoolState::default())),
            workers: WorkerTable::new(),
            exit_tx,
            exit_rx,
            shutdown_tx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            state: Arc::clone(&self.state),
            queues: self.queues.clone(),
            workers: self.workers.clone(),
        }
    }

    /// Sender that stops the pool and kills live workers
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Consume events until shut down or the queue is closed
    pub async fn run(mut self, mut events: EventReceiver) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(max_concurrency = self.config.max_concurrency, "Scheduler started");

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if let Err(e) = self.submit(event) {
                        error!(error = %e, "Failed to schedule event");
                    }
                }
                Some(exit) = self.exit_rx.recv() => {
                    if let Err(e) = self.on_exit(exit) {
                        error!(error = %e, "Failed to settle worker exit");
                    }
                }
                _ = shutdown_rx.recv() => break,
                else => break,
            }
        }

        self.drain_on_shutdown().await;
        info!("Scheduler stopped");
    }

    fn submit(&self, event: Event) -> SchedulerResult<()> {
        {
            let mut state = self.state.lock().map_err(|_| SchedulerError::poisoned())?;
            let key = event.target.key();
            if state.busy.contains(&key) || state.running.len() >= self.config.max_concurrency {
                debug!(event_id = %event.id, function = %key, "Event backlogged");
                state.backlog.push_back(event);
                return Ok(());
            }
        }
        self.start(event)
    }

    fn start(&self, event: Event) -> SchedulerResult<()> {
        let worker_id = Uuid::new_v4().to_string();
        let timeout = match event.target.context.timeout {
            0 => self.config.default_timeout,
            secs => Duration::from_secs(secs),
        };
        let spec = WorkerSpec {
            worker_id: worker_id.clone(),
            rpc_address: self.config.rpc_address.clone(),
            cwd: event.target.cwd.clone(),
            entrypoint: event.target.handler.clone(),
            env: event.target.context.env.clone(),
            timeout,
        };

        self.queues.events.reserve(&worker_id)?;
        let child = match self.spawner.spawn(&spec) {
            Ok(child) => child,
            Err(e) => {
                error!(event_id = %event.id, function = %event.target, error = %e, "Worker spawn failed");
                self.queues.events.release(&worker_id);
                self.queues.abandon(&event, 502, "Failed to start function worker");
                return Ok(());
            }
        };
        self.workers.set(&worker_id, WorkerState::Spawned);

        {
            let mut state = self.state.lock().map_err(|_| SchedulerError::poisoned())?;
            let key = event.target.key();
            state.busy.insert(key.clone());
            state.running.insert(
                worker_id.clone(),
                RunningWorker {
                    key,
                    event: event.clone(),
                    timeout,
                },
            );
        }

        info!(
            worker_id = %worker_id,
            event_id = %event.id,
            event_type = %event.event_type,
            function = %event.target,
            "Worker spawned"
        );

        let pickup = self.queues.events.assign(&worker_id, event)?;
        self.workers.set(&worker_id, WorkerState::Assigned);

        let table = self.workers.clone();
        let exits = self.exit_tx.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let reason = supervise(&worker_id, child, pickup, timeout, &table, shutdown).await;
            let _ = exits.send(WorkerExit { worker_id, reason });
        });
        Ok(())
    }

    fn on_exit(&self, exit: WorkerExit) -> SchedulerResult<()> {
        let running = {
            let mut state = self.state.lock().map_err(|_| SchedulerError::poisoned())?;
            let running = state.running.remove(&exit.worker_id);
            if let Some(worker) = &running {
                state.busy.remove(&worker.key);
            }
            running
        };
        self.workers.remove(&exit.worker_id);
        self.queues.events.release(&exit.worker_id);

        if let Some(worker) = running {
            let (status, message) = match exit.reason {
                ExitReason::TimedOut => (
                    504,
                    format!("Function timed out after {}s", worker.timeout.as_secs()),
                ),
                ExitReason::Crashed { .. } => (500, "Function worker crashed".to_string()),
                ExitReason::Completed { .. } => {
                    (500, "Function exited without a response".to_string())
                }
            };
            match exit.reason {
                ExitReason::Completed { .. } => {
                    debug!(worker_id = %exit.worker_id, event_id = %worker.event.id, "Worker exited")
                }
                reason => {
                    warn!(worker_id = %exit.worker_id, event_id = %worker.event.id, ?reason, "Worker failed")
                }
            }
            self.queues.abandon(&worker.event, status, &message);
        }

        self.drain_backlog()
    }

    fn drain_backlog(&self) -> SchedulerResult<()> {
        loop {
            let next = {
                let mut state = self.state.lock().map_err(|_| SchedulerError::poisoned())?;
                match state.next_ready(self.config.max_concurrency) {
                    Some(index) => state.backlog.remove(index),
                    None => None,
                }
            };
            match next {
                Some(event) => self.start(event)?,
                None => return Ok(()),
            }
        }
    }

    async fn drain_on_shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        let deadline = tokio::time::Instant::now() + self.config.kill_grace;

        while self.handle().running() > 0 {
            match tokio::time::timeout_at(deadline, self.exit_rx.recv()).await {
                Ok(Some(exit)) => {
                    let _ = self.settle_without_backlog(exit);
                }
                _ => {
                    warn!(remaining = self.handle().running(), "Workers still running at shutdown");
                    break;
                }
            }
        }

        let pending: Vec<Event> = match self.state.lock() {
            Ok(mut state) => state.backlog.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for event in &pending {
            self.queues.abandon(event, 503, "Scheduler is shutting down");
        }
    }

    fn settle_without_backlog(&self, exit: WorkerExit) -> SchedulerResult<()> {
        let mut state = self.state.lock().map_err(|_| SchedulerError::poisoned())?;
        if let Some(worker) = state.running.remove(&exit.worker_id) {
            state.busy.remove(&worker.key);
            drop(state);
            self.queues.events.release(&exit.worker_id);
            self.queues.abandon(&worker.event, 503, "Scheduler is shutting down");
        }
        self.workers.remove(&exit.worker_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::process::Child;

    use crate::queue::{EventType, HttpRequest, ResponseChunk, TargetContext};
    use crate::scheduler::ProcessSpawner;

    struct CountingSpawner {
        inner: ProcessSpawner,
        spawned: AtomicUsize,
    }

    impl WorkerSpawner for CountingSpawner {
        fn spawn(&self, spec: &WorkerSpec) -> SchedulerResult<Child> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            self.inner.spawn(spec)
        }
    }

    fn target(handler: &str, timeout: u64) -> Target {
        Target::new(
            "fn",
            handler,
            std::env::temp_dir().display().to_string(),
            TargetContext {
                env: Vec::new(),
                timeout,
            },
        )
    }

    fn http_request() -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            url: "/fn-execute/slow".into(),
            path: "/slow".into(),
            params: Vec::new(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_same_target_is_serialized() {
        let (queues, events) = QueueSet::new(Duration::from_millis(50));
        let spawner = Arc::new(CountingSpawner {
            inner: ProcessSpawner::new("sh", vec!["-c".into(), "sleep 0.2".into()]),
            spawned: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(SchedulerConfig::default(), queues.clone(), spawner.clone());
        let handle = scheduler.handle();
        let shutdown = scheduler.shutdown_handle();
        tokio::spawn(scheduler.run(events));

        queues.events.enqueue(Event::new(EventType::System, target("a", 5))).unwrap();
        queues.events.enqueue(Event::new(EventType::System, target("a", 5))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handle.running(), 1);
        assert_eq!(handle.backlog(), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
        assert_eq!(handle.running(), 0);
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_spawn_failure_answers_502() {
        let (queues, events) = QueueSet::new(Duration::from_millis(50));
        let spawner = Arc::new(ProcessSpawner::new("/nonexistent/aerofn-worker", Vec::new()));
        let scheduler = Scheduler::new(SchedulerConfig::default(), queues.clone(), spawner);
        let handle = scheduler.handle();
        tokio::spawn(scheduler.run(events));

        let event = Event::new(EventType::Http, target("a", 5));
        let mut response = queues.http.enqueue(&event.id, http_request()).unwrap();
        queues.events.enqueue(event).unwrap();

        match response.recv().await {
            Some(ResponseChunk::Head { status, .. }) => assert_eq!(status, 502),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(handle.running(), 0);
    }

    #[tokio::test]
    async fn test_timeout_message_reports_default_deadline() {
        let (queues, events) = QueueSet::new(Duration::from_millis(50));
        let config = SchedulerConfig {
            default_timeout: Duration::from_secs(1),
            ..SchedulerConfig::default()
        };
        let spawner = Arc::new(ProcessSpawner::new("sh", vec!["-c".into(), "sleep 30".into()]));
        let scheduler = Scheduler::new(config, queues.clone(), spawner);
        let shutdown = scheduler.shutdown_handle();
        tokio::spawn(scheduler.run(events));

        let event = Event::new(EventType::Http, target("slow", 0));
        let mut response = queues.http.enqueue(&event.id, http_request()).unwrap();
        queues.events.enqueue(event).unwrap();

        match tokio::time::timeout(Duration::from_secs(5), response.recv()).await {
            Ok(Some(ResponseChunk::Head { status, .. })) => assert_eq!(status, 504),
            other => panic!("unexpected {:?}", other),
        }
        match response.recv().await {
            Some(ResponseChunk::Data(body)) => {
                let body = String::from_utf8(body).unwrap();
                assert!(body.contains("timed out after 1s"), "{}", body);
            }
            other => panic!("unexpected {:?}", other),
        }
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_release_target_drops_backlog() {
        let (queues, events) = QueueSet::new(Duration::from_millis(50));
        let config = SchedulerConfig {
            max_concurrency: 1,
            ..SchedulerConfig::default()
        };
        let spawner = Arc::new(ProcessSpawner::new("sh", vec!["-c".into(), "sleep 1".into()]));
        let scheduler = Scheduler::new(config, queues.clone(), spawner);
        let handle = scheduler.handle();
        let shutdown = scheduler.shutdown_handle();
        tokio::spawn(scheduler.run(events));

        queues.events.enqueue(Event::new(EventType::System, target("a", 5))).unwrap();
        queues.events.enqueue(Event::new(EventType::System, target("b", 5))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.backlog(), 1);

        assert_eq!(handle.release_target(&target("b", 5)), 1);
        assert_eq!(handle.backlog(), 0);
        let _ = shutdown.send(());
    }
}
