//! # Queue Set
//!
//! The process-wide queue state. Built once by the composition root and
//! shared by reference with the enqueuers, the scheduler and the RPC server.

use std::sync::Arc;
use std::time::Duration;

use super::database::DatabaseQueue;
use super::event::{Event, EventType};
use super::event_queue::{EventQueue, EventReceiver};
use super::firehose::FirehoseQueue;
use super::http::HttpQueue;
use super::rpc::RpcQueue;
use super::schedule::ScheduleQueue;

/// Event queue plus one typed sub-queue per trigger kind
#[derive(Debug, Clone)]
pub struct QueueSet {
    pub events: EventQueue,
    pub http: Arc<HttpQueue>,
    pub database: Arc<DatabaseQueue>,
    pub schedule: Arc<ScheduleQueue>,
    pub firehose: Arc<FirehoseQueue>,
    pub rpc: Arc<RpcQueue>,
}

impl QueueSet {
    /// Create the queues and the receiver the scheduler consumes
    pub fn new(pop_wait: Duration) -> (Self, EventReceiver) {
        let (events, receiver) = EventQueue::new(pop_wait);
        let set = Self {
            events,
            http: Arc::new(HttpQueue::new()),
            database: Arc::new(DatabaseQueue::new()),
            schedule: Arc::new(ScheduleQueue::new()),
            firehose: Arc::new(FirehoseQueue::new()),
            rpc: Arc::new(RpcQueue::new()),
        };
        (set, receiver)
    }

    /// Settle the typed side of an event whose worker is gone.
    ///
    /// Callers waiting on a response receive `status` / `message`; leftover
    /// payloads of fire-and-forget kinds are dropped.
    pub fn abandon(&self, event: &Event, status: u16, message: &str) {
        match event.event_type {
            EventType::Http => {
                self.http.finalize(&event.id, status, message);
            }
            EventType::Rpc => {
                self.rpc.finalize(&event.id, message);
            }
            EventType::Database => {
                self.database.discard(&event.id);
            }
            EventType::Schedule => {
                self.schedule.discard(&event.id);
            }
            EventType::Firehose => {
                self.firehose.discard(&event.id);
            }
            EventType::System => {}
        }
    }
}
