//! # Function Definitions
//!
//! `root/<id>/function.json` files and their flattening into one
//! [`TriggerSpec`] per active handler trigger.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::errors::{EngineError, EngineResult};
use crate::enqueuer::TriggerKind;

/// Name of the definition file inside a function directory
pub const DEFINITION_FILE: &str = "function.json";

fn default_timeout() -> u64 {
    60
}

fn default_active() -> bool {
    true
}

/// Trigger bound to one handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    #[serde(rename = "type")]
    pub kind: TriggerKind,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub options: Value,
}

/// Contents of a `function.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Seconds one invocation may run
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Handler name to trigger
    #[serde(default)]
    pub triggers: BTreeMap<String, TriggerDefinition>,
}

/// Identity of a trigger spec: function id and handler
pub type SpecKey = (String, String);

/// Everything needed to subscribe one handler
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSpec {
    pub function_id: String,
    pub handler: String,
    pub env: BTreeMap<String, String>,
    pub timeout: u64,
    pub trigger: TriggerDefinition,
}

impl TriggerSpec {
    pub fn key(&self) -> SpecKey {
        (self.function_id.clone(), self.handler.clone())
    }
}

/// Kind of a target change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetChangeKind {
    Added,
    Removed,
    Updated,
}

/// One change of the subscribed trigger set
#[derive(Debug, Clone, PartialEq)]
pub struct TargetChange {
    pub kind: TargetChangeKind,
    pub spec: TriggerSpec,
}

impl TargetChange {
    pub fn added(spec: TriggerSpec) -> Self {
        Self {
            kind: TargetChangeKind::Added,
            spec,
        }
    }

    pub fn removed(spec: TriggerSpec) -> Self {
        Self {
            kind: TargetChangeKind::Removed,
            spec,
        }
    }

    pub fn updated(spec: TriggerSpec) -> Self {
        Self {
            kind: TargetChangeKind::Updated,
            spec,
        }
    }
}

/// Read every definition under `root`, keyed by function id.
///
/// Unreadable or invalid definitions are logged and skipped.
pub fn load_definitions(root: &Path) -> EngineResult<BTreeMap<String, FunctionDefinition>> {
    let entries = fs::read_dir(root).map_err(|source| EngineError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut definitions = BTreeMap::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let Some(id) = dir.file_name().and_then(|name| name.to_str()).map(str::to_string) else {
            continue;
        };
        let path = dir.join(DEFINITION_FILE);
        if !path.exists() {
            continue;
        }
        match read_definition(&path) {
            Ok(definition) => {
                definitions.insert(id, definition);
            }
            Err(e) => warn!(function_id = %id, error = %e, "Skipping function definition"),
        }
    }
    Ok(definitions)
}

fn read_definition(path: &Path) -> EngineResult<FunctionDefinition> {
    let content = fs::read_to_string(path).map_err(|source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|e| EngineError::InvalidDefinition {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Flatten definitions into the active trigger specs
pub fn specs(definitions: &BTreeMap<String, FunctionDefinition>) -> BTreeMap<SpecKey, TriggerSpec> {
    definitions
        .iter()
        .flat_map(|(id, definition)| {
            definition
                .triggers
                .iter()
                .filter(|(_, trigger)| trigger.active)
                .map(move |(handler, trigger)| TriggerSpec {
                    function_id: id.clone(),
                    handler: handler.clone(),
                    env: definition.env.clone(),
                    timeout: definition.timeout,
                    trigger: trigger.clone(),
                })
        })
        .map(|spec| (spec.key(), spec))
        .collect()
}

/// Changes turning `previous` into `current`: removals, then updates, then additions
pub fn diff(
    previous: &BTreeMap<SpecKey, TriggerSpec>,
    current: &BTreeMap<SpecKey, TriggerSpec>,
) -> Vec<TargetChange> {
    let removed = previous
        .iter()
        .filter(|(key, _)| !current.contains_key(*key))
        .map(|(_, spec)| TargetChange::removed(spec.clone()));
    let updated = current
        .iter()
        .filter(|(key, spec)| previous.get(*key).is_some_and(|old| old != *spec))
        .map(|(_, spec)| TargetChange::updated(spec.clone()));
    let added = current
        .iter()
        .filter(|(key, _)| !previous.contains_key(*key))
        .map(|(_, spec)| TargetChange::added(spec.clone()));

    removed.chain(updated).chain(added).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn spec(handler: &str, event: &str) -> TriggerSpec {
        TriggerSpec {
            function_id: "fn".into(),
            handler: handler.into(),
            env: BTreeMap::new(),
            timeout: 60,
            trigger: TriggerDefinition {
                kind: TriggerKind::Firehose,
                active: true,
                options: json!({ "event": event }),
            },
        }
    }

    fn map(specs: Vec<TriggerSpec>) -> BTreeMap<SpecKey, TriggerSpec> {
        specs.into_iter().map(|s| (s.key(), s)).collect()
    }

    #[test]
    fn test_diff_classifies_changes() {
        let previous = map(vec![spec("a", "*"), spec("b", "*")]);
        let current = map(vec![spec("b", "**"), spec("c", "*")]);

        let changes = diff(&previous, &current);
        let kinds: Vec<(TargetChangeKind, String)> = changes
            .iter()
            .map(|c| (c.kind, c.spec.handler.clone()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (TargetChangeKind::Removed, "a".to_string()),
                (TargetChangeKind::Updated, "b".to_string()),
                (TargetChangeKind::Added, "c".to_string()),
            ]
        );
    }

    #[test]
    fn test_replay_yields_added_for_everything() {
        let current = map(vec![spec("a", "*"), spec("b", "*")]);
        let changes = diff(&BTreeMap::new(), &current);
        assert!(changes.iter().all(|c| c.kind == TargetChangeKind::Added));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_load_definitions_skips_invalid() {
        let root = TempDir::new().unwrap();
        let good = root.path().join("good");
        fs::create_dir(&good).unwrap();
        fs::write(
            good.join(DEFINITION_FILE),
            json!({
                "name": "good",
                "env": {"B": "2", "A": "1"},
                "timeout": 5,
                "triggers": {
                    "default": {"type": "http", "options": {"path": "/good"}},
                    "paused": {"type": "schedule", "active": false, "options": {"frequency": "* * * * *"}}
                }
            })
            .to_string(),
        )
        .unwrap();
        let bad = root.path().join("bad");
        fs::create_dir(&bad).unwrap();
        fs::write(bad.join(DEFINITION_FILE), "{ not json").unwrap();

        let definitions = load_definitions(root.path()).unwrap();
        assert_eq!(definitions.len(), 1);

        let specs = specs(&definitions);
        assert_eq!(specs.len(), 1);
        let spec = &specs[&("good".to_string(), "default".to_string())];
        assert_eq!(spec.timeout, 5);
        assert_eq!(spec.trigger.kind, TriggerKind::Http);
    }
}
