//! # Schedule Sub-Queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::QueueResult;
use super::keyed::KeyedQueue;

/// Payload of a timer firing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTick {
    /// Cron expression that produced the tick
    pub frequency: String,

    /// IANA timezone the expression is evaluated in
    pub timezone: String,

    /// Occurrence the tick stands for
    pub scheduled_at: DateTime<Utc>,
}

/// Queue of timer firings
#[derive(Debug, Default)]
pub struct ScheduleQueue {
    ticks: KeyedQueue<ScheduleTick>,
}

impl ScheduleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, event_id: &str, tick: ScheduleTick) -> QueueResult<()> {
        self.ticks.enqueue(event_id, tick)
    }

    pub fn pop(&self, event_id: &str) -> QueueResult<ScheduleTick> {
        self.ticks.pop(event_id)
    }

    pub fn discard(&self, event_id: &str) -> bool {
        self.ticks.discard(event_id)
    }

    pub fn size(&self) -> usize {
        self.ticks.size()
    }
}
