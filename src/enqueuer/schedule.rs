//! # Schedule Enqueuer
//!
//! One timer task per subscription. Every replica runs the same timers;
//! each tick goes through the ownership coordinator keyed by target and
//! occurrence so only one replica enqueues it.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::errors::{EnqueuerError, EnqueuerResult};
use super::subscription::{Subscription, SubscriptionRegistry, SubscriptionStatus};
use super::{Description, Enqueuer, EnqueuerContext, SubscriptionInfo, TriggerKind, TriggerOptions};
use crate::queue::{Event, EventType, ScheduleTick, Target};
use crate::replication::{job_key, Ownership};

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Options of a schedule trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOptions {
    /// Cron expression with five or six fields
    pub frequency: String,

    /// IANA timezone the expression is evaluated in
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

/// Parsed schedule
#[derive(Debug)]
pub struct Timer {
    cron: Cron,
    timezone: Tz,
}

impl Timer {
    pub fn parse(options: &ScheduleOptions) -> Result<Self, String> {
        let cron = Cron::new(&options.frequency)
            .with_seconds_optional()
            .parse()
            .map_err(|e| format!("Invalid frequency '{}': {}", options.frequency, e))?;
        let timezone: Tz = options
            .timezone
            .parse()
            .map_err(|_| format!("Unknown timezone '{}'", options.timezone))?;
        Ok(Self { cron, timezone })
    }

    /// First occurrence strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.cron
            .find_next_occurrence(&local, false)
            .ok()
            .map(|next| next.with_timezone(&Utc))
    }
}

/// Schedule trigger enqueuer
pub struct ScheduleEnqueuer {
    context: EnqueuerContext,
    registry: SubscriptionRegistry<ScheduleOptions, Option<JoinHandle<()>>>,
}

impl ScheduleEnqueuer {
    pub fn new(context: EnqueuerContext) -> Self {
        Self {
            context,
            registry: SubscriptionRegistry::new(),
        }
    }

    fn release(&self, subscription: Subscription<ScheduleOptions, Option<JoinHandle<()>>>) {
        if let Some(task) = subscription.handle {
            task.abort();
            debug!(function = %subscription.target, "Timer stopped");
        }
    }
}

async fn run_timer(target: Target, options: ScheduleOptions, timer: Timer, context: EnqueuerContext) {
    let mut cursor = Utc::now();
    loop {
        let Some(next) = timer.next_after(cursor) else {
            warn!(function = %target, frequency = %options.frequency, "Schedule has no further occurrences");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
        cursor = next;

        fire(&target, &options, next, &context).await;
    }
}

async fn fire(target: &Target, options: &ScheduleOptions, at: DateTime<Utc>, context: &EnqueuerContext) {
    let key = job_key(
        "schedule",
        &[&target.cwd, &target.handler, &at.timestamp().to_string()],
    );
    let mut event = Event::new(EventType::Schedule, target.clone());
    let tick = ScheduleTick {
        frequency: options.frequency.clone(),
        timezone: options.timezone.clone(),
        scheduled_at: at,
    };
    let queues = context.queues.clone();

    let outcome = context
        .coordinator
        .run_exclusive(&key, &mut event, |event| async move {
            queues.schedule.enqueue(&event.id, tick)?;
            queues.events.enqueue(event)
        })
        .await;

    match outcome {
        Ok(Ownership::Executed(Ok(()))) => {
            debug!(event_id = %event.id, function = %target, scheduled_at = %at, "Schedule event enqueued")
        }
        Ok(Ownership::Executed(Err(e))) => {
            warn!(event_id = %event.id, error = %e, "Failed to enqueue schedule event")
        }
        Ok(Ownership::Shifted { owner, .. }) => {
            debug!(event_id = %event.id, owner = %owner, "Tick handled by another replica")
        }
        Err(e) => warn!(job_key = %key, error = %e, "Ownership decision failed"),
    }
}

impl Enqueuer for ScheduleEnqueuer {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Schedule
    }

    fn description(&self) -> Description {
        Description::new(
            "schedule",
            "Schedule",
            "alarm",
            "Invoke a handler periodically following a cron expression.",
        )
    }

    fn options_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["frequency"],
            "properties": {
                "frequency": {
                    "type": "string",
                    "description": "Cron expression, optionally with a leading seconds field"
                },
                "timezone": {
                    "type": "string",
                    "default": "UTC",
                    "enum": chrono_tz::TZ_VARIANTS.iter().map(|tz| tz.name()).collect::<Vec<_>>()
                }
            }
        })
    }

    fn subscribe(&self, target: Target, options: TriggerOptions) -> EnqueuerResult<SubscriptionStatus> {
        let options = match options {
            TriggerOptions::Schedule(options) => options,
            other => {
                return Err(EnqueuerError::KindMismatch {
                    expected: TriggerKind::Schedule,
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

        let (status, task) = match Timer::parse(&options) {
            Ok(timer) => {
                info!(function = %target, frequency = %options.frequency, timezone = %options.timezone, "Timer started");
                let task = tokio::spawn(run_timer(
                    target.clone(),
                    options.clone(),
                    timer,
                    self.context.clone(),
                ));
                (SubscriptionStatus::open(), Some(task))
            }
            Err(message) => {
                warn!(function = %target, error = %message, "Timer rejected");
                (SubscriptionStatus::failed(message), None)
            }
        };

        self.registry.insert(Subscription {
            target,
            options,
            status: status.clone(),
            handle: task,
        })?;
        Ok(status)
    }

    fn unsubscribe(&self, target: &Target) -> usize {
        let removed = match self.registry.remove_matching(target) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Schedule unsubscribe failed");
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
                kind: TriggerKind::Schedule,
                target,
                options: serde_json::to_value(options).unwrap_or(Value::Null),
                status,
            })
            .collect()
    }
}
