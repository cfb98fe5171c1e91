//! Shared state handed to every route

use std::sync::Arc;

use crate::enqueuer::{EnqueuerSet, MemoryChangeFeed};
use crate::scheduler::SchedulerHandle;

#[derive(Clone)]
pub struct AppState {
    pub enqueuers: Arc<EnqueuerSet>,
    pub feed: Arc<MemoryChangeFeed>,
    pub scheduler: SchedulerHandle,
    pub replica_id: String,
}
