//! # Event Queue
//!
//! Enqueuers hand events to the scheduler through [`EventQueue::enqueue`].
//! The scheduler assigns each event to exactly one worker and the worker
//! collects it with [`EventQueue::pop`] over the RPC boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};

use super::errors::{QueueError, QueueResult};
use super::event::Event;

/// Receiving side of [`EventQueue::enqueue`], owned by the scheduler
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Fired once when the worker pops its event
pub type PickupSignal = oneshot::Receiver<()>;

#[derive(Debug)]
struct WorkerSlot {
    event: Option<Event>,
    popped: bool,
    pickup: Option<oneshot::Sender<()>>,
    notify: Arc<Notify>,
}

impl WorkerSlot {
    fn reserved() -> Self {
        Self {
            event: None,
            popped: false,
            pickup: None,
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Debug)]
struct Inner {
    submit: mpsc::UnboundedSender<Event>,
    slots: Mutex<HashMap<String, WorkerSlot>>,
    pop_wait: Duration,
}

/// Pending events routed to workers
#[derive(Debug, Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl EventQueue {
    /// Create a queue and the receiver the scheduler consumes.
    ///
    /// `pop_wait` bounds how long a pop for a reserved but still empty
    /// worker slot waits before failing with `NotFound`.
    pub fn new(pop_wait: Duration) -> (Self, EventReceiver) {
        let (submit, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(Inner {
                submit,
                slots: Mutex::new(HashMap::new()),
                pop_wait,
            }),
        };
        (queue, receiver)
    }

    /// Hand an event to the scheduler. Never blocks.
    pub fn enqueue(&self, event: Event) -> QueueResult<()> {
        self.inner.submit.send(event).map_err(|_| QueueError::Closed)
    }

    /// Reserve a slot for a worker that has not received its event yet
    pub fn reserve(&self, worker_id: &str) -> QueueResult<()> {
        let mut slots = self.inner.slots.lock().map_err(|_| QueueError::poisoned())?;
        slots
            .entry(worker_id.to_string())
            .or_insert_with(WorkerSlot::reserved);
        Ok(())
    }

    /// Route an event to a worker.
    ///
    /// The returned signal fires when the worker pops the event.
    pub fn assign(&self, worker_id: &str, event: Event) -> QueueResult<PickupSignal> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.inner.slots.lock().map_err(|_| QueueError::poisoned())?;
        let slot = slots
            .entry(worker_id.to_string())
            .or_insert_with(WorkerSlot::reserved);
        slot.event = Some(event);
        slot.popped = false;
        slot.pickup = Some(tx);
        slot.notify.notify_one();
        Ok(rx)
    }

    /// Collect the event assigned to a worker
    pub async fn pop(&self, worker_id: &str) -> QueueResult<Event> {
        let deadline = tokio::time::Instant::now() + self.inner.pop_wait;
        loop {
            let notify = match self.try_pop(worker_id)? {
                Ok(event) => return Ok(event),
                Err(notify) => notify,
            };
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return Err(QueueError::NotFound(worker_id.to_string()));
            }
        }
    }

    /// Take the event if present, otherwise hand back the slot's notifier
    fn try_pop(&self, worker_id: &str) -> QueueResult<Result<Event, Arc<Notify>>> {
        let mut slots = self.inner.slots.lock().map_err(|_| QueueError::poisoned())?;
        let slot = slots
            .get_mut(worker_id)
            .ok_or_else(|| QueueError::NotFound(worker_id.to_string()))?;

        if slot.popped {
            return Err(QueueError::NotFound(worker_id.to_string()));
        }

        match slot.event.take() {
            Some(event) => {
                slot.popped = true;
                if let Some(pickup) = slot.pickup.take() {
                    let _ = pickup.send(());
                }
                Ok(Ok(event))
            }
            None => Ok(Err(Arc::clone(&slot.notify))),
        }
    }

    /// Forget a worker slot, returning its event if it was never popped
    pub fn release(&self, worker_id: &str) -> Option<Event> {
        self.inner
            .slots
            .lock()
            .ok()
            .and_then(|mut slots| slots.remove(worker_id))
            .and_then(|slot| slot.event)
    }

    /// Number of events assigned but not yet popped
    pub fn pending(&self) -> usize {
        self.inner
            .slots
            .lock()
            .map(|slots| slots.values().filter(|s| s.event.is_some()).count())
            .unwrap_or(0)
    }
}
