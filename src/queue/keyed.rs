//! # Keyed Queue
//!
//! Single-delivery store of trigger payloads keyed by event id. Every typed
//! sub-queue is built on it.

use std::collections::HashMap;
use std::sync::Mutex;

use super::errors::{QueueError, QueueResult};

/// Payload store keyed by event id
#[derive(Debug)]
pub struct KeyedQueue<T> {
    items: Mutex<HashMap<String, T>>,
}

impl<T> Default for KeyedQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> KeyedQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a payload for an event
    pub fn enqueue(&self, event_id: impl Into<String>, item: T) -> QueueResult<()> {
        let mut items = self.items.lock().map_err(|_| QueueError::poisoned())?;
        items.insert(event_id.into(), item);
        Ok(())
    }

    /// Remove and return the payload of an event
    pub fn pop(&self, event_id: &str) -> QueueResult<T> {
        let mut items = self.items.lock().map_err(|_| QueueError::poisoned())?;
        items
            .remove(event_id)
            .ok_or_else(|| QueueError::NotFound(event_id.to_string()))
    }

    /// Drop the payload of an event, if it is still stored
    pub fn discard(&self, event_id: &str) -> bool {
        self.items
            .lock()
            .map(|mut items| items.remove(event_id).is_some())
            .unwrap_or(false)
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.items
            .lock()
            .map(|items| items.contains_key(event_id))
            .unwrap_or(false)
    }

    pub fn size(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}
