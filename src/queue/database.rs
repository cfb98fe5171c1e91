//! # Database Sub-Queue

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::QueueResult;
use super::keyed::KeyedQueue;

/// Kind of document change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Replace,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Replace => "REPLACE",
            ChangeKind::Delete => "DELETE",
        }
    }

    pub fn all() -> [ChangeKind; 4] {
        [
            ChangeKind::Insert,
            ChangeKind::Update,
            ChangeKind::Replace,
            ChangeKind::Delete,
        ]
    }
}

/// Payload of a database-triggered event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseChange {
    pub kind: ChangeKind,

    pub collection: String,

    /// Primary key of the changed document
    pub document_key: String,

    /// Document before the change (absent for inserts)
    #[serde(default)]
    pub previous: Option<Value>,

    /// Document after the change (absent for deletes)
    #[serde(default)]
    pub current: Option<Value>,
}

/// Queue of database change payloads
#[derive(Debug, Default)]
pub struct DatabaseQueue {
    changes: KeyedQueue<DatabaseChange>,
}

impl DatabaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, event_id: &str, change: DatabaseChange) -> QueueResult<()> {
        self.changes.enqueue(event_id, change)
    }

    pub fn pop(&self, event_id: &str) -> QueueResult<DatabaseChange> {
        self.changes.pop(event_id)
    }

    pub fn discard(&self, event_id: &str) -> bool {
        self.changes.discard(event_id)
    }

    pub fn size(&self) -> usize {
        self.changes.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_round_trip_through_queue() {
        let queue = DatabaseQueue::new();
        let change = DatabaseChange {
            kind: ChangeKind::Update,
            collection: "users".into(),
            document_key: "u1".into(),
            previous: Some(json!({"name": "old"})),
            current: Some(json!({"name": "new"})),
        };

        queue.enqueue("e1", change.clone()).unwrap();
        assert_eq!(queue.pop("e1").unwrap(), change);
        assert!(queue.pop("e1").is_err());
    }

    #[test]
    fn test_change_kind_wire_format() {
        assert_eq!(serde_json::to_value(ChangeKind::Replace).unwrap(), "REPLACE");
        let kind: ChangeKind = serde_json::from_value(json!("DELETE")).unwrap();
        assert_eq!(kind, ChangeKind::Delete);
    }
}
