//! # Target-Change Engine
//!
//! Applies [`TargetChange`]s to the enqueuers and keeps the set of active
//! trigger specs. The polling loop diffs the definition directory against
//! that set on every tick.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::definition::{self, SpecKey, TargetChange, TargetChangeKind, TriggerSpec};
use super::errors::{EngineError, EngineResult};
use crate::enqueuer::TargetSubscriber;
use crate::queue::{EnvVar, Target, TargetContext};

/// Outcome of one `apply` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: usize,
}

/// Drives subscribe/unsubscribe from function definition changes
pub struct TargetChangeEngine {
    root: PathBuf,
    subscriber: Arc<dyn TargetSubscriber>,
    active: Mutex<BTreeMap<SpecKey, TriggerSpec>>,
}

impl TargetChangeEngine {
    pub fn new(root: impl Into<PathBuf>, subscriber: Arc<dyn TargetSubscriber>) -> Self {
        Self {
            root: root.into(),
            subscriber,
            active: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Target a spec runs as
    pub fn build_target(&self, spec: &TriggerSpec) -> Target {
        let cwd = self.root.join(&spec.function_id);
        let env = spec
            .env
            .iter()
            .map(|(key, value)| EnvVar::new(key.as_str(), value.as_str()))
            .collect();
        Target::new(
            spec.function_id.as_str(),
            spec.handler.as_str(),
            cwd.display().to_string(),
            TargetContext {
                env,
                timeout: spec.timeout,
            },
        )
    }

    /// Number of active trigger specs
    pub fn active(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Apply changes in order. A failing change does not stop the others.
    pub fn apply(&self, changes: Vec<TargetChange>) -> EngineResult<ApplyReport> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| EngineError::Internal("Lock poisoned".into()))?;
        let mut report = ApplyReport::default();

        for change in changes {
            match self.apply_one(&mut active, change) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(error = %e, "Target change failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn apply_one(
        &self,
        active: &mut BTreeMap<SpecKey, TriggerSpec>,
        change: TargetChange,
    ) -> EngineResult<()> {
        let key = change.spec.key();
        let kind = match (change.kind, active.get(&key)) {
            (TargetChangeKind::Added, Some(current)) if *current == change.spec => {
                debug!(function_id = %key.0, handler = %key.1, "Target already active");
                return Ok(());
            }
            (TargetChangeKind::Added, Some(_)) => TargetChangeKind::Updated,
            (kind, _) => kind,
        };

        match kind {
            TargetChangeKind::Removed => {
                let old = active.remove(&key).unwrap_or(change.spec);
                let removed = self.subscriber.unsubscribe(&self.build_target(&old));
                info!(function_id = %key.0, handler = %key.1, removed, "Target removed");
                Ok(())
            }
            TargetChangeKind::Updated => {
                if let Some(old) = active.remove(&key) {
                    self.subscriber.unsubscribe(&self.build_target(&old));
                }
                self.subscribe(active, change.spec)
            }
            TargetChangeKind::Added => self.subscribe(active, change.spec),
        }
    }

    fn subscribe(
        &self,
        active: &mut BTreeMap<SpecKey, TriggerSpec>,
        spec: TriggerSpec,
    ) -> EngineResult<()> {
        let target = self.build_target(&spec);
        let kind = spec.trigger.kind;
        let result = self
            .subscriber
            .subscribe(target, kind, spec.trigger.options.clone());
        let key = spec.key();
        active.insert(key.clone(), spec);

        let status = result?;
        match &status.error_message {
            Some(message) if status.closed => {
                warn!(function_id = %key.0, handler = %key.1, trigger = %kind, error = %message, "Target subscribed closed")
            }
            _ => info!(function_id = %key.0, handler = %key.1, trigger = %kind, "Target subscribed"),
        }
        Ok(())
    }

    /// Read the definition directory and apply the difference
    pub fn sync(&self) -> EngineResult<ApplyReport> {
        let definitions = definition::load_definitions(&self.root)?;
        let current = definition::specs(&definitions);
        let changes = {
            let active = self
                .active
                .lock()
                .map_err(|_| EngineError::Internal("Lock poisoned".into()))?;
            definition::diff(&active, &current)
        };
        if changes.is_empty() {
            return Ok(ApplyReport::default());
        }
        self.apply(changes)
    }

    /// Unsubscribe every active target once
    pub fn shutdown(&self) -> EngineResult<ApplyReport> {
        let specs: Vec<TriggerSpec> = self
            .active
            .lock()
            .map_err(|_| EngineError::Internal("Lock poisoned".into()))?
            .values()
            .cloned()
            .collect();
        self.apply(specs.into_iter().map(TargetChange::removed).collect())
    }

    /// Poll the definition directory until shut down
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        info!(root = %self.root.display(), "Target-change engine started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sync() {
                        Ok(report) if report.applied + report.failed > 0 => {
                            info!(applied = report.applied, failed = report.failed, "Applied target changes");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Failed to read function definitions"),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        match self.shutdown() {
            Ok(report) => info!(removed = report.applied, "Target-change engine stopped"),
            Err(e) => warn!(error = %e, "Failed to release targets"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    use crate::engine::definition::TriggerDefinition;
    use crate::enqueuer::{EnqueuerError, EnqueuerResult, SubscriptionStatus, TriggerKind};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TargetSubscriber for Recorder {
        fn subscribe(&self, target: Target, kind: TriggerKind, options: Value) -> EnqueuerResult<SubscriptionStatus> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("subscribe {} {}", target.handler, options["event"].as_str().unwrap_or("")));
            if options.is_null() {
                return Err(EnqueuerError::InvalidOptions {
                    kind,
                    message: "missing".into(),
                });
            }
            Ok(SubscriptionStatus::open())
        }

        fn unsubscribe(&self, target: &Target) -> usize {
            self.calls
                .lock()
                .unwrap()
                .push(format!("unsubscribe {}", target.handler));
            1
        }
    }

    fn spec(handler: &str, options: Value) -> TriggerSpec {
        TriggerSpec {
            function_id: "fn".into(),
            handler: handler.into(),
            env: [("Z".to_string(), "26".to_string()), ("A".to_string(), "1".to_string())]
                .into_iter()
                .collect(),
            timeout: 10,
            trigger: TriggerDefinition {
                kind: TriggerKind::Firehose,
                active: true,
                options,
            },
        }
    }

    fn engine() -> (TargetChangeEngine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (TargetChangeEngine::new("/functions", recorder.clone()), recorder)
    }

    #[test]
    fn test_build_target() {
        let (engine, _) = engine();
        let target = engine.build_target(&spec("default", json!({})));
        assert_eq!(target.cwd, "/functions/fn");
        assert_eq!(target.context.timeout, 10);
        let keys: Vec<&str> = target.context.env.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "Z"]);
    }

    #[test]
    fn test_updated_unsubscribes_before_subscribing() {
        let (engine, recorder) = engine();
        engine
            .apply(vec![TargetChange::added(spec("h", json!({"event": "old"})))])
            .unwrap();
        engine
            .apply(vec![TargetChange::updated(spec("h", json!({"event": "new"})))])
            .unwrap();

        assert_eq!(
            recorder.calls(),
            vec!["subscribe h old", "unsubscribe h", "subscribe h new"]
        );
    }

    #[test]
    fn test_added_twice_is_idempotent_and_different_added_updates() {
        let (engine, recorder) = engine();
        let first = spec("h", json!({"event": "a"}));
        engine
            .apply(vec![TargetChange::added(first.clone()), TargetChange::added(first)])
            .unwrap();
        engine
            .apply(vec![TargetChange::added(spec("h", json!({"event": "b"})))])
            .unwrap();

        assert_eq!(
            recorder.calls(),
            vec!["subscribe h a", "unsubscribe h", "subscribe h b"]
        );
        assert_eq!(engine.active(), 1);
    }

    #[test]
    fn test_failure_does_not_abort_other_changes() {
        let (engine, recorder) = engine();
        let report = engine
            .apply(vec![
                TargetChange::added(spec("bad", Value::Null)),
                TargetChange::added(spec("good", json!({"event": "*"}))),
                TargetChange::removed(spec("other", json!({}))),
            ])
            .unwrap();

        assert_eq!(report, ApplyReport { applied: 2, failed: 1 });
        assert_eq!(recorder.calls().len(), 3);
    }

    #[test]
    fn test_shutdown_removes_each_target_once() {
        let (engine, recorder) = engine();
        engine
            .apply(vec![
                TargetChange::added(spec("a", json!({"event": "*"}))),
                TargetChange::added(spec("b", json!({"event": "*"}))),
            ])
            .unwrap();

        let report = engine.shutdown().unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(engine.active(), 0);

        let unsubscribes = recorder
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("unsubscribe"))
            .count();
        assert_eq!(unsubscribes, 2);
        assert_eq!(engine.shutdown().unwrap().applied, 0);
    }
}
