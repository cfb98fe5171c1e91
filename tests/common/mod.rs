//! Shared setup for integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use aerofn::enqueuer::{ChangeSource, EnqueuerContext, EnqueuerSet, MemoryChangeFeed};
use aerofn::queue::{EventReceiver, QueueSet, Target, TargetContext};
use aerofn::replication::{CoordinationStore, Coordinator, CoordinatorConfig};
use aerofn::scheduler::{ProcessSpawner, Scheduler, SchedulerConfig, SchedulerHandle};

/// Enqueuers of one replica whose events are handed to the test
pub struct Replica {
    pub queues: QueueSet,
    pub events: EventReceiver,
    pub enqueuers: Arc<EnqueuerSet>,
    pub scheduler: SchedulerHandle,
}

pub fn replica(
    replica_id: &str,
    store: Arc<dyn CoordinationStore>,
    changes: Arc<dyn ChangeSource>,
) -> Replica {
    let (queues, events) = QueueSet::new(Duration::from_millis(200));
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        queues.clone(),
        Arc::new(ProcessSpawner::new("true", Vec::new())),
    );
    let context = EnqueuerContext {
        queues: queues.clone(),
        scheduler: scheduler.handle(),
        coordinator: Coordinator::new(CoordinatorConfig::new(replica_id), store),
    };
    Replica {
        queues,
        events,
        enqueuers: Arc::new(EnqueuerSet::new(context, changes)),
        scheduler: scheduler.handle(),
    }
}

/// A replica with its own store and an empty change feed
pub fn standalone() -> Replica {
    replica(
        "test-replica",
        Arc::new(aerofn::replication::InMemoryCoordinationStore::new()),
        Arc::new(MemoryChangeFeed::default()),
    )
}

pub fn target(cwd: &str, handler: &str, timeout: u64) -> Target {
    Target::new(
        "fn",
        handler,
        cwd,
        TargetContext {
            env: Vec::new(),
            timeout,
        },
    )
}

pub fn write_executable(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// Poll `condition` until it holds or `limit` passes
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
