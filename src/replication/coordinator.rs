//! # Ownership Coordinator
//!
//! Every replica sees the same trigger signals. `run_exclusive` lets exactly
//! one of them run the job for a signal; the others adopt the winner's event
//! id so the event has one identity across the deployment.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::errors::{ReplicationError, ReplicationResult};
use super::store::{
    AcquireOutcome, CoordinationStore, InMemoryCoordinationStore, LeaseState, OwnershipRecord,
};
use crate::queue::Event;

const BACKOFF_BASE: Duration = Duration::from_millis(20);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Key every replica derives identically for the same signal
pub fn job_key(kind: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest: String = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect();
    format!("{}:{}", kind, digest)
}

/// Instant after which a waiter may take over `record`'s lease, if it has
/// not expired yet
fn takeover_deadline(record: &OwnershipRecord) -> Option<tokio::time::Instant> {
    let remaining = (record.expires_at - Utc::now()).to_std().ok()?;
    Some(tokio::time::Instant::now() + remaining + BACKOFF_MAX)
}

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identity of this replica
    pub replica_id: String,

    /// Lifetime of a lease that is not renewed
    pub lease_ttl: Duration,

    /// How long to wait on another replica's pending lease.
    /// An unexpired lease is always waited out so it can be taken over.
    pub wait_timeout: Duration,

    /// How long settled records stay visible to late replicas
    pub retention: Duration,
}

impl CoordinatorConfig {
    pub fn new(replica_id: impl Into<String>) -> Self {
        Self {
            replica_id: replica_id.into(),
            lease_ttl: Duration::from_secs(30),
            wait_timeout: Duration::from_secs(10),
            retention: Duration::from_secs(600),
        }
    }
}

/// Outcome of `run_exclusive`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership<T> {
    /// This replica ran the job
    Executed(T),
    /// Another replica owns the job; the local event now carries its id
    Shifted { owner: String, event_id: String },
}

impl<T> Ownership<T> {
    pub fn is_executed(&self) -> bool {
        matches!(self, Ownership::Executed(_))
    }
}

/// Lease-based single-execution guard
#[derive(Clone)]
pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<dyn CoordinationStore>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, store: Arc<dyn CoordinationStore>) -> Self {
        Self { config, store }
    }

    /// Coordinator for a single replica with its own in-memory store
    pub fn standalone(replica_id: impl Into<String>) -> Self {
        Self::new(
            CoordinatorConfig::new(replica_id),
            Arc::new(InMemoryCoordinationStore::new()),
        )
    }

    pub fn replica_id(&self) -> &str {
        &self.config.replica_id
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Run `job` unless another replica already owns `job_key`.
    ///
    /// When ownership is lost, `event` is shifted to the owner's event id
    /// and the job is not run.
    pub async fn run_exclusive<F, Fut, T>(
        &self,
        job_key: &str,
        event: &mut Event,
        job: F,
    ) -> ReplicationResult<Ownership<T>>
    where
        F: FnOnce(Event) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut deadline = tokio::time::Instant::now() + self.config.wait_timeout;
        let mut backoff = BACKOFF_BASE;

        loop {
            let outcome = self.store.acquire(
                job_key,
                &self.config.replica_id,
                &event.id,
                self.config.lease_ttl,
            )?;

            match outcome {
                AcquireOutcome::Acquired { token } => {
                    if !self.store.fence(job_key, token, self.config.lease_ttl)? {
                        let record = self
                            .store
                            .get(job_key)?
                            .ok_or_else(|| ReplicationError::MissingRecord(job_key.to_string()))?;
                        warn!(job_key, token, "Lease superseded before start");
                        return Ok(self.shift(job_key, event, record));
                    }

                    debug!(job_key, token, event_id = %event.id, "Lease acquired");
                    let result = self.run_renewing(job_key, token, job(event.clone())).await?;
                    if !self.store.complete(job_key, token)? {
                        warn!(job_key, token, "Lease lost while running");
                    }
                    return Ok(Ownership::Executed(result));
                }
                AcquireOutcome::Held(record) if record.state == LeaseState::Pending => {
                    // an abandoned pending lease is taken over once it expires
                    if let Some(takeover) = takeover_deadline(&record) {
                        deadline = deadline.max(takeover);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ReplicationError::OwnershipConflict {
                            job_key: job_key.to_string(),
                            owner: record.owner_replica,
                        });
                    }
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..10));
                    tokio::time::sleep(backoff.min(BACKOFF_MAX) + jitter).await;
                    backoff = backoff.saturating_mul(2);
                }
                AcquireOutcome::Held(record) => {
                    return Ok(self.shift(job_key, event, record));
                }
            }
        }
    }

    fn shift<T>(&self, job_key: &str, event: &mut Event, record: OwnershipRecord) -> Ownership<T> {
        info!(
            job_key,
            owner = %record.owner_replica,
            local_event_id = %event.id,
            event_id = %record.event_id,
            "Job owned by another replica"
        );
        event.shift(record.event_id.clone());
        Ownership::Shifted {
            owner: record.owner_replica,
            event_id: record.event_id,
        }
    }

    async fn run_renewing<Fut, T>(&self, job_key: &str, token: u64, job: Fut) -> ReplicationResult<T>
    where
        Fut: Future<Output = T>,
    {
        let period = (self.config.lease_ttl / 3).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(job);

        loop {
            tokio::select! {
                result = &mut job => return Ok(result),
                _ = ticker.tick() => {
                    if !self.store.renew(job_key, token, self.config.lease_ttl)? {
                        warn!(job_key, token, "Lease renewal rejected");
                    }
                }
            }
        }
    }

    /// Drop records older than the retention window
    pub fn sweep(&self) -> ReplicationResult<usize> {
        self.store.sweep(self.config.retention)
    }

    /// Sweep periodically until shut down
    pub async fn run_sweeper(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.retention.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep() {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "Swept ownership records"),
                        Err(e) => warn!(error = %e, "Ownership sweep failed"),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::queue::{EventType, Target};

    fn event() -> Event {
        Event::new(EventType::Schedule, Target::function("fn", "/fn"))
    }

    fn replica(id: &str, store: Arc<dyn CoordinationStore>) -> Coordinator {
        let mut config = CoordinatorConfig::new(id);
        config.lease_ttl = Duration::from_secs(5);
        config.wait_timeout = Duration::from_secs(2);
        Coordinator::new(config, store)
    }

    #[test]
    fn test_job_key_is_stable_and_separated() {
        let a = job_key("schedule", &["/fn", "tick", "60"]);
        assert_eq!(a, job_key("schedule", &["/fn", "tick", "60"]));
        assert_ne!(a, job_key("schedule", &["/fn", "tick6", "0"]));
        assert!(a.starts_with("schedule:"));
    }

    #[tokio::test]
    async fn test_standalone_executes() {
        let coordinator = Coordinator::standalone("solo");
        let mut event = event();
        let outcome = coordinator
            .run_exclusive("job", &mut event, |_| async { 42 })
            .await
            .unwrap();
        assert_eq!(outcome, Ownership::Executed(42));
    }

    #[tokio::test]
    async fn test_second_replica_is_shifted() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
        let a = replica("a", Arc::clone(&store));
        let b = replica("b", Arc::clone(&store));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut first = event();
        let first_id = first.id.clone();
        let counter = Arc::clone(&runs);
        a.run_exclusive("job", &mut first, |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        let mut second = event();
        let counter = Arc::clone(&runs);
        let outcome = b
            .run_exclusive("job", &mut second, |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Ownership::Shifted {
                owner: "a".into(),
                event_id: first_id.clone()
            }
        );
        assert_eq!(second.id, first_id);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiter_is_shifted_once_owner_starts() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
        let b = replica("b", Arc::clone(&store));

        // replica a holds a pending lease and starts shortly after
        let AcquireOutcome::Acquired { token } = store
            .acquire("job", "a", "event-a", Duration::from_secs(5))
            .unwrap()
        else {
            panic!("expected lease");
        };
        let fencer = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fencer.fence("job", token, Duration::from_secs(5)).unwrap();
        });

        let mut local = event();
        let outcome = b
            .run_exclusive("job", &mut local, |_| async { "ran" })
            .await
            .unwrap();
        assert!(!outcome.is_executed());
        assert_eq!(local.id, "event-a");
    }

    #[tokio::test]
    async fn test_abandoned_pending_lease_is_taken_over() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
        // replica a took the lease and stopped before starting the job
        store
            .acquire("job", "a", "event-a", Duration::from_millis(300))
            .unwrap();

        let mut config = CoordinatorConfig::new("b");
        config.wait_timeout = Duration::from_millis(100);
        let b = Coordinator::new(config, Arc::clone(&store));

        let mut local = event();
        let local_id = local.id.clone();
        let outcome = b
            .run_exclusive("job", &mut local, |_| async { "ran" })
            .await
            .unwrap();
        assert_eq!(outcome, Ownership::Executed("ran"));

        let record = store.get("job").unwrap().unwrap();
        assert_eq!(record.owner_replica, "b");
        assert_eq!(record.event_id, local_id);
        assert_eq!(record.fencing_token, 2);
        assert_eq!(record.state, LeaseState::Done);
    }

    /// Store whose key stays pending with a lease already in the past
    struct StuckStore;

    impl CoordinationStore for StuckStore {
        fn acquire(&self, job_key: &str, _: &str, _: &str, _: Duration) -> ReplicationResult<AcquireOutcome> {
            let now = Utc::now();
            Ok(AcquireOutcome::Held(OwnershipRecord {
                job_key: job_key.to_string(),
                owner_replica: "a".into(),
                fencing_token: 1,
                event_id: "event-a".into(),
                state: LeaseState::Pending,
                expires_at: now - chrono::Duration::seconds(5),
                updated_at: now,
            }))
        }

        fn fence(&self, _: &str, _: u64, _: Duration) -> ReplicationResult<bool> {
            Ok(false)
        }

        fn renew(&self, _: &str, _: u64, _: Duration) -> ReplicationResult<bool> {
            Ok(false)
        }

        fn complete(&self, _: &str, _: u64) -> ReplicationResult<bool> {
            Ok(false)
        }

        fn get(&self, _: &str) -> ReplicationResult<Option<OwnershipRecord>> {
            Ok(None)
        }

        fn sweep(&self, _: Duration) -> ReplicationResult<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_pending_conflict_times_out() {
        let mut config = CoordinatorConfig::new("b");
        config.wait_timeout = Duration::from_millis(50);
        let b = Coordinator::new(config, Arc::new(StuckStore));

        let err = b
            .run_exclusive("job", &mut event(), |_| async {})
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::OwnershipConflict { .. }));
    }
}
