//! # Enqueuers
//!
//! One enqueuer per trigger kind. Each watches its signal source, turns
//! signals into an [`Event`](crate::queue::Event) plus a typed payload and
//! records which targets are subscribed with which options.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::{QueueSet, Target};
use crate::replication::Coordinator;
use crate::scheduler::SchedulerHandle;

pub mod database;
pub mod errors;
pub mod firehose;
pub mod http;
pub mod rpc;
pub mod schedule;
pub mod subscription;
mod tls;

pub use database::{ChangeSource, DatabaseEnqueuer, DatabaseOptions, DocumentChange, MemoryChangeFeed};
pub use errors::{EnqueuerError, EnqueuerResult};
pub use firehose::{FirehoseEnqueuer, FirehoseOptions};
pub use http::{HttpDispatch, HttpEnqueuer, HttpMethod, HttpOptions};
pub use rpc::{RpcEnqueuer, RpcOptions, TlsOptions};
pub use schedule::{ScheduleEnqueuer, ScheduleOptions};
pub use subscription::{Subscription, SubscriptionRegistry, SubscriptionStatus};

/// Closed set of trigger kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Http,
    Database,
    Schedule,
    Firehose,
    Rpc,
}

impl TriggerKind {
    pub fn all() -> [TriggerKind; 5] {
        [
            TriggerKind::Http,
            TriggerKind::Database,
            TriggerKind::Schedule,
            TriggerKind::Firehose,
            TriggerKind::Rpc,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Http => "http",
            TriggerKind::Database => "database",
            TriggerKind::Schedule => "schedule",
            TriggerKind::Firehose => "firehose",
            TriggerKind::Rpc => "rpc",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed options, one variant per trigger kind
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOptions {
    Http(HttpOptions),
    Database(DatabaseOptions),
    Schedule(ScheduleOptions),
    Firehose(FirehoseOptions),
    Rpc(RpcOptions),
}

impl TriggerOptions {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerOptions::Http(_) => TriggerKind::Http,
            TriggerOptions::Database(_) => TriggerKind::Database,
            TriggerOptions::Schedule(_) => TriggerKind::Schedule,
            TriggerOptions::Firehose(_) => TriggerKind::Firehose,
            TriggerOptions::Rpc(_) => TriggerKind::Rpc,
        }
    }

    /// Parse raw options of the given kind
    pub fn from_parts(kind: TriggerKind, options: Value) -> EnqueuerResult<Self> {
        let invalid = |e: serde_json::Error| EnqueuerError::InvalidOptions {
            kind,
            message: e.to_string(),
        };
        Ok(match kind {
            TriggerKind::Http => TriggerOptions::Http(serde_json::from_value(options).map_err(invalid)?),
            TriggerKind::Database => {
                TriggerOptions::Database(serde_json::from_value(options).map_err(invalid)?)
            }
            TriggerKind::Schedule => {
                TriggerOptions::Schedule(serde_json::from_value(options).map_err(invalid)?)
            }
            TriggerKind::Firehose => {
                TriggerOptions::Firehose(serde_json::from_value(options).map_err(invalid)?)
            }
            TriggerKind::Rpc => TriggerOptions::Rpc(serde_json::from_value(options).map_err(invalid)?),
        })
    }

    pub fn to_value(&self) -> Value {
        let value = match self {
            TriggerOptions::Http(o) => serde_json::to_value(o),
            TriggerOptions::Database(o) => serde_json::to_value(o),
            TriggerOptions::Schedule(o) => serde_json::to_value(o),
            TriggerOptions::Firehose(o) => serde_json::to_value(o),
            TriggerOptions::Rpc(o) => serde_json::to_value(o),
        };
        value.unwrap_or(Value::Null)
    }
}

/// Human-facing description of an enqueuer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Description {
    pub name: String,
    pub title: String,
    pub icon: String,
    pub summary: String,
}

impl Description {
    pub fn new(name: &str, title: &str, icon: &str, summary: &str) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            icon: icon.to_string(),
            summary: summary.to_string(),
        }
    }
}

/// A subscription as reported to operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionInfo {
    pub kind: TriggerKind,
    pub target: Target,
    pub options: Value,
    pub status: SubscriptionStatus,
}

/// Common contract of every enqueuer
pub trait Enqueuer: Send + Sync {
    fn kind(&self) -> TriggerKind;

    fn description(&self) -> Description;

    /// JSON schema of the options; built on each call
    fn options_schema(&self) -> Value;

    /// Bind `target` to `options`.
    ///
    /// Resource failures are reported through the returned status; `Err`
    /// only signals options of another kind.
    fn subscribe(&self, target: Target, options: TriggerOptions) -> EnqueuerResult<SubscriptionStatus>;

    /// Remove subscriptions `target` covers; returns how many were removed
    fn unsubscribe(&self, target: &Target) -> usize;

    fn subscriptions(&self) -> Vec<SubscriptionInfo>;
}

/// Receiver of target changes, implemented by [`EnqueuerSet`]
pub trait TargetSubscriber: Send + Sync {
    fn subscribe(&self, target: Target, kind: TriggerKind, options: Value) -> EnqueuerResult<SubscriptionStatus>;

    fn unsubscribe(&self, target: &Target) -> usize;
}

/// Collaborators shared by every enqueuer
#[derive(Clone)]
pub struct EnqueuerContext {
    pub queues: QueueSet,
    pub scheduler: SchedulerHandle,
    pub coordinator: Coordinator,
}

/// The enqueuers of a process, one per kind
pub struct EnqueuerSet {
    pub http: Arc<HttpEnqueuer>,
    pub database: Arc<DatabaseEnqueuer>,
    pub schedule: Arc<ScheduleEnqueuer>,
    pub firehose: Arc<FirehoseEnqueuer>,
    pub rpc: Arc<RpcEnqueuer>,
}

impl EnqueuerSet {
    pub fn new(context: EnqueuerContext, changes: Arc<dyn ChangeSource>) -> Self {
        Self {
            http: Arc::new(HttpEnqueuer::new(context.clone())),
            database: Arc::new(DatabaseEnqueuer::new(context.clone(), changes)),
            schedule: Arc::new(ScheduleEnqueuer::new(context.clone())),
            firehose: Arc::new(FirehoseEnqueuer::new(context.clone())),
            rpc: Arc::new(RpcEnqueuer::new(context)),
        }
    }

    pub fn get(&self, kind: TriggerKind) -> &dyn Enqueuer {
        match kind {
            TriggerKind::Http => self.http.as_ref(),
            TriggerKind::Database => self.database.as_ref(),
            TriggerKind::Schedule => self.schedule.as_ref(),
            TriggerKind::Firehose => self.firehose.as_ref(),
            TriggerKind::Rpc => self.rpc.as_ref(),
        }
    }

    pub fn all(&self) -> Vec<&dyn Enqueuer> {
        TriggerKind::all().into_iter().map(|kind| self.get(kind)).collect()
    }

    /// Every subscription across kinds
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.all()
            .into_iter()
            .flat_map(|enqueuer| enqueuer.subscriptions())
            .collect()
    }
}

impl TargetSubscriber for EnqueuerSet {
    fn subscribe(&self, target: Target, kind: TriggerKind, options: Value) -> EnqueuerResult<SubscriptionStatus> {
        let options = TriggerOptions::from_parts(kind, options)?;
        self.get(kind).subscribe(target, options)
    }

    fn unsubscribe(&self, target: &Target) -> usize {
        self.all()
            .into_iter()
            .map(|enqueuer| enqueuer.unsubscribe(target))
            .sum()
    }
}

/// Descriptions and option schemas of every trigger kind
pub fn catalog(enqueuers: &EnqueuerSet) -> Value {
    let entries: Vec<Value> = enqueuers
        .all()
        .into_iter()
        .map(|enqueuer| {
            serde_json::json!({
                "kind": enqueuer.kind(),
                "description": enqueuer.description(),
                "options": enqueuer.options_schema(),
            })
        })
        .collect();
    Value::Array(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_from_parts() {
        let options =
            TriggerOptions::from_parts(TriggerKind::Firehose, json!({"event": "chat/*"})).unwrap();
        assert_eq!(options.kind(), TriggerKind::Firehose);
        assert_eq!(options.to_value(), json!({"event": "chat/*"}));
    }

    #[test]
    fn test_options_from_parts_rejects_garbage() {
        let err = TriggerOptions::from_parts(TriggerKind::Schedule, json!({"nope": 1})).unwrap_err();
        assert!(matches!(
            err,
            EnqueuerError::InvalidOptions {
                kind: TriggerKind::Schedule,
                ..
            }
        ));
    }

    #[test]
    fn test_trigger_kind_wire_name() {
        assert_eq!(serde_json::to_value(TriggerKind::Rpc).unwrap(), json!("rpc"));
        let kind: TriggerKind = serde_json::from_value(json!("database")).unwrap();
        assert_eq!(kind, TriggerKind::Database);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use super::EnqueuerContext;
    use crate::queue::{EventReceiver, QueueSet};
    use crate::replication::Coordinator;
    use crate::scheduler::{ProcessSpawner, Scheduler, SchedulerConfig};

    /// Context whose event receiver is handed to the test instead of a scheduler
    pub fn context() -> (EnqueuerContext, EventReceiver) {
        let (queues, events) = QueueSet::new(Duration::from_millis(50));
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            queues.clone(),
            Arc::new(ProcessSpawner::new("true", Vec::new())),
        );
        let context = EnqueuerContext {
            queues,
            scheduler: scheduler.handle(),
            coordinator: Coordinator::standalone("test-replica"),
        };
        (context, events)
    }
}
