//! # Events and Targets
//!
//! An [`Event`] says that a trigger fired; its [`Target`] says which code runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trigger kind that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Http,
    Database,
    Schedule,
    Firehose,
    Rpc,
    System,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Http => "HTTP",
            EventType::Database => "DATABASE",
            EventType::Schedule => "SCHEDULE",
            EventType::Firehose => "FIREHOSE",
            EventType::Rpc => "RPC",
            EventType::System => "SYSTEM",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single environment variable handed to a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Execution context of a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetContext {
    /// Environment variables, ordered by key
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Wall-clock budget of one invocation in seconds
    pub timeout: u64,
}

impl Default for TargetContext {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            timeout: 60,
        }
    }
}

/// Identifies what code to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Function identifier
    pub id: String,

    /// Exported handler name; empty selects every handler of the function
    #[serde(default)]
    pub handler: String,

    /// Working directory of the function
    pub cwd: String,

    /// Execution context
    #[serde(default)]
    pub context: TargetContext,
}

/// Identity of a subscribed target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub cwd: String,
    pub handler: String,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.cwd, self.handler)
    }
}

impl Target {
    /// Create a target for one handler of a function
    pub fn new(
        id: impl Into<String>,
        handler: impl Into<String>,
        cwd: impl Into<String>,
        context: TargetContext,
    ) -> Self {
        Self {
            id: id.into(),
            handler: handler.into(),
            cwd: cwd.into(),
            context,
        }
    }

    /// Create a handler-less target that selects a whole function
    pub fn function(id: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handler: String::new(),
            cwd: cwd.into(),
            context: TargetContext::default(),
        }
    }

    pub fn key(&self) -> TargetKey {
        TargetKey {
            cwd: self.cwd.clone(),
            handler: self.handler.clone(),
        }
    }

    /// Whether this target, used as a selector, covers `other`.
    ///
    /// Without a handler every target of the same `cwd` is covered,
    /// otherwise only the exact `(cwd, handler)` pair.
    pub fn covers(&self, other: &Target) -> bool {
        if self.cwd != other.cwd {
            return false;
        }
        self.handler.is_empty() || self.handler == other.handler
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.handler)
    }
}

/// A trigger occurrence waiting for a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub target: Target,

    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, target: Target) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            target,
            created_at: Utc::now(),
        }
    }

    /// Adopt the identity of the same event as constructed by the owning replica.
    pub fn shift(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(handler: &str) -> Target {
        Target::new("fn1", handler, "/functions/fn1", TargetContext::default())
    }

    #[test]
    fn test_handlerless_target_covers_function() {
        let selector = Target::function("fn1", "/functions/fn1");
        assert!(selector.covers(&target("default")));
        assert!(selector.covers(&target("other")));
    }

    #[test]
    fn test_handler_target_covers_exact_pair() {
        let selector = target("default");
        assert!(selector.covers(&target("default")));
        assert!(!selector.covers(&target("other")));

        let elsewhere = Target::new("fn2", "default", "/functions/fn2", TargetContext::default());
        assert!(!selector.covers(&elsewhere));
    }

    #[test]
    fn test_event_shift() {
        let mut event = Event::new(EventType::Schedule, target("default"));
        let original = event.id.clone();
        event.shift("owner-event");
        assert_ne!(event.id, original);
        assert_eq!(event.id, "owner-event");
    }

    #[test]
    fn test_event_serializes_type_tag() {
        let event = Event::new(EventType::Http, target("default"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "HTTP");
        assert_eq!(json["target"]["handler"], "default");
    }
}
