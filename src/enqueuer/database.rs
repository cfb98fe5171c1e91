//! # Database Enqueuer
//!
//! Subscriptions on the same collection share one change stream. The
//! stream opens with the first dependent and closes with the last.
//! Every replica sees every change, so deliveries go through the
//! ownership coordinator keyed by the change id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::errors::{EnqueuerError, EnqueuerResult};
use super::subscription::{Subscription, SubscriptionRegistry, SubscriptionStatus};
use super::{Description, Enqueuer, EnqueuerContext, SubscriptionInfo, TriggerKind, TriggerOptions};
use crate::queue::{ChangeKind, DatabaseChange, Event, EventType, Target};
use crate::replication::{job_key, Ownership};

const DEFAULT_FEED_CAPACITY: usize = 1024;

/// A change as emitted by the document store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    /// Resume id, identical on every replica
    pub id: String,
    pub collection: String,
    pub kind: ChangeKind,
    pub document_key: String,
    #[serde(default)]
    pub previous: Option<Value>,
    #[serde(default)]
    pub current: Option<Value>,
}

impl DocumentChange {
    fn payload(&self) -> DatabaseChange {
        DatabaseChange {
            kind: self.kind,
            collection: self.collection.clone(),
            document_key: self.document_key.clone(),
            previous: self.previous.clone(),
            current: self.current.clone(),
        }
    }
}

/// Source of per-collection change streams
pub trait ChangeSource: Send + Sync {
    /// Collections that can be watched
    fn collections(&self) -> Vec<String>;

    /// Open a change stream on one collection
    fn watch(&self, collection: &str) -> EnqueuerResult<broadcast::Receiver<DocumentChange>>;
}

/// In-process change feed
#[derive(Debug)]
pub struct MemoryChangeFeed {
    channels: RwLock<HashMap<String, broadcast::Sender<DocumentChange>>>,
    capacity: usize,
}

impl Default for MemoryChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl MemoryChangeFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn register_collection(&self, collection: &str) -> EnqueuerResult<()> {
        let mut channels = self.channels.write().map_err(|_| EnqueuerError::poisoned())?;
        channels
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(())
    }

    /// Publish a change; returns the number of open streams that saw it
    pub fn publish(&self, change: DocumentChange) -> EnqueuerResult<usize> {
        self.register_collection(&change.collection)?;
        let channels = self.channels.read().map_err(|_| EnqueuerError::poisoned())?;
        Ok(channels
            .get(&change.collection)
            .and_then(|sender| sender.send(change).ok())
            .unwrap_or(0))
    }
}

impl ChangeSource for MemoryChangeFeed {
    fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .read()
            .map(|channels| channels.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn watch(&self, collection: &str) -> EnqueuerResult<broadcast::Receiver<DocumentChange>> {
        let channels = self.channels.read().map_err(|_| EnqueuerError::poisoned())?;
        channels
            .get(collection)
            .map(|sender| sender.subscribe())
            .ok_or_else(|| {
                EnqueuerError::StreamUnavailable(format!("Collection '{}' does not exist", collection))
            })
    }
}

fn all_kinds() -> Vec<ChangeKind> {
    ChangeKind::all().to_vec()
}

/// Options of a database trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseOptions {
    pub collection: String,

    /// Change kinds to react to
    #[serde(rename = "type", default = "all_kinds")]
    pub kinds: Vec<ChangeKind>,
}

struct SharedStream {
    dependents: usize,
    task: JoinHandle<()>,
}

type Registry = SubscriptionRegistry<DatabaseOptions, bool>;

/// Database trigger enqueuer
pub struct DatabaseEnqueuer {
    context: EnqueuerContext,
    changes: Arc<dyn ChangeSource>,
    registry: Arc<Registry>,
    streams: Mutex<HashMap<String, SharedStream>>,
}

impl DatabaseEnqueuer {
    pub fn new(context: EnqueuerContext, changes: Arc<dyn ChangeSource>) -> Self {
        Self {
            context,
            changes,
            registry: Arc::new(SubscriptionRegistry::new()),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Number of open change streams
    pub fn open_streams(&self) -> usize {
        self.streams.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn attach(&self, collection: &str) -> EnqueuerResult<()> {
        let mut streams = self.streams.lock().map_err(|_| EnqueuerError::poisoned())?;
        if let Some(stream) = streams.get_mut(collection) {
            stream.dependents += 1;
            return Ok(());
        }

        let receiver = self.changes.watch(collection)?;
        let task = tokio::spawn(pump(
            collection.to_string(),
            receiver,
            Arc::clone(&self.registry),
            self.context.clone(),
        ));
        streams.insert(
            collection.to_string(),
            SharedStream {
                dependents: 1,
                task,
            },
        );
        info!(collection, "Change stream opened");
        Ok(())
    }

    fn detach(&self, collection: &str) {
        let Ok(mut streams) = self.streams.lock() else {
            return;
        };
        let close = match streams.get_mut(collection) {
            Some(stream) => {
                stream.dependents = stream.dependents.saturating_sub(1);
                stream.dependents == 0
            }
            None => false,
        };
        if close {
            if let Some(stream) = streams.remove(collection) {
                stream.task.abort();
                info!(collection, "Change stream closed");
            }
        }
    }

    fn release(&self, subscription: Subscription<DatabaseOptions, bool>) {
        if subscription.handle {
            self.detach(&subscription.options.collection);
        }
    }
}

async fn pump(
    collection: String,
    mut receiver: broadcast::Receiver<DocumentChange>,
    registry: Arc<Registry>,
    context: EnqueuerContext,
) {
    loop {
        match receiver.recv().await {
            Ok(change) => deliver(&change, &registry, &context).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(collection = %collection, skipped, "Change stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!(collection = %collection, "Change stream ended");
                let keys = registry
                    .collect(|sub| (sub.options.collection == collection).then(|| sub.target.key()))
                    .unwrap_or_default();
                for key in keys {
                    let _ = registry.close(&key, "Change stream ended");
                }
                break;
            }
        }
    }
}

async fn deliver(change: &DocumentChange, registry: &Registry, context: &EnqueuerContext) {
    let targets = registry
        .collect(|sub| {
            let wanted = sub.handle
                && !sub.status.closed
                && sub.options.collection == change.collection
                && sub.options.kinds.contains(&change.kind);
            wanted.then(|| sub.target.clone())
        })
        .unwrap_or_default();

    for target in targets {
        let key = job_key("database", &[&target.cwd, &target.handler, &change.id]);
        let mut event = Event::new(EventType::Database, target);
        let queues = context.queues.clone();
        let payload = change.payload();

        let outcome = context
            .coordinator
            .run_exclusive(&key, &mut event, |event| async move {
                queues.database.enqueue(&event.id, payload)?;
                queues.events.enqueue(event)
            })
            .await;

        match outcome {
            Ok(Ownership::Executed(Ok(()))) => {
                debug!(event_id = %event.id, change_id = %change.id, "Database event enqueued")
            }
            Ok(Ownership::Executed(Err(e))) => {
                warn!(event_id = %event.id, error = %e, "Failed to enqueue database event")
            }
            Ok(Ownership::Shifted { owner, .. }) => {
                debug!(event_id = %event.id, owner = %owner, "Database event handled elsewhere")
            }
            Err(e) => warn!(job_key = %key, error = %e, "Ownership decision failed"),
        }
    }
}

impl Enqueuer for DatabaseEnqueuer {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Database
    }

    fn description(&self) -> Description {
        Description::new(
            "database",
            "Database",
            "database",
            "Invoke a handler when documents of a collection change.",
        )
    }

    fn options_schema(&self) -> Value {
        let kinds: Vec<&str> = ChangeKind::all().iter().map(|k| k.as_str()).collect();
        json!({
            "type": "object",
            "required": ["collection"],
            "properties": {
                "collection": {
                    "type": "string",
                    "enum": self.changes.collections()
                },
                "type": {
                    "type": "array",
                    "items": { "type": "string", "enum": kinds },
                    "default": kinds
                }
            }
        })
    }

    fn subscribe(&self, target: Target, options: TriggerOptions) -> EnqueuerResult<SubscriptionStatus> {
        let options = match options {
            TriggerOptions::Database(options) => options,
            other => {
                return Err(EnqueuerError::KindMismatch {
                    expected: TriggerKind::Database,
                    found: other.kind(),
                })
            }
        };

        if let Some(status) = self.registry.identical(&target, &options)? {
            return Ok(status);
        }
        if let Some(previous) = self.registry.take(&target.key())? {
            self.release(previous);
        }

        let (status, attached) = match self.attach(&options.collection) {
            Ok(()) => {
                info!(function = %target, collection = %options.collection, "Database trigger subscribed");
                (SubscriptionStatus::open(), true)
            }
            Err(e) => {
                warn!(function = %target, collection = %options.collection, error = %e, "Database trigger failed");
                (SubscriptionStatus::failed(e.to_string()), false)
            }
        };

        self.registry.insert(Subscription {
            target,
            options,
            status: status.clone(),
            handle: attached,
        })?;
        Ok(status)
    }

    fn unsubscribe(&self, target: &Target) -> usize {
        let removed = match self.registry.remove_matching(target) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Database unsubscribe failed");
                return 0;
            }
        };
        let count = removed.len();
        for subscription in removed {
            self.release(subscription);
        }
        if count > 0 {
            self.context.scheduler.release_target(target);
        }
        count
    }

    fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry
            .snapshot()
            .unwrap_or_default()
            .into_iter()
            .map(|(target, options, status)| SubscriptionInfo {
                kind: TriggerKind::Database,
                target,
                options: serde_json::to_value(options).unwrap_or(Value::Null),
                status,
            })
            .collect()
    }
}
