//! # Firehose Enqueuer
//!
//! Socket messages become events. The websocket route registers each
//! connection here; every message is matched against every subscription.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::errors::{EnqueuerError, EnqueuerResult};
use super::subscription::{Subscription, SubscriptionRegistry, SubscriptionStatus};
use super::{Description, Enqueuer, EnqueuerContext, SubscriptionInfo, TriggerKind, TriggerOptions};
use crate::queue::firehose::{CLOSE_EVENT, CONNECTION_EVENT};
use crate::queue::{
    Event, EventType, FirehoseClient, FirehoseMessage, FirehosePayload, FirehosePool, SocketSender,
    Target,
};

/// Options of a firehose trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirehoseOptions {
    /// Event name, `*` or `**`
    pub event: String,
}

/// Frame sent by a socket client
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientFrame {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// Whether a subscription pattern selects an event name.
///
/// `**` selects everything. `*` selects single-segment names, which
/// includes `connection` and `close`. Anything else is an exact name.
pub fn matches_event(pattern: &str, name: &str) -> bool {
    match pattern {
        "**" => true,
        "*" => !name.contains('/'),
        exact => exact == name,
    }
}

/// Firehose trigger enqueuer
pub struct FirehoseEnqueuer {
    context: EnqueuerContext,
    registry: SubscriptionRegistry<FirehoseOptions, ()>,
}

impl FirehoseEnqueuer {
    pub fn new(context: EnqueuerContext) -> Self {
        Self {
            context,
            registry: SubscriptionRegistry::new(),
        }
    }

    /// Register a socket and emit `connection`; returns the events enqueued
    pub fn connect(&self, client: &FirehoseClient, sender: SocketSender) -> EnqueuerResult<usize> {
        let size = self.context.queues.firehose.add_socket(&client.id, sender)?;
        info!(client_id = %client.id, remote_address = %client.remote_address, pool = size, "Firehose client connected");
        Ok(self.emit(client, size, FirehoseMessage::new(CONNECTION_EVENT, "")))
    }

    /// Handle a text frame from a client
    pub fn receive(&self, client: &FirehoseClient, text: &str) -> EnqueuerResult<usize> {
        let frame: ClientFrame = serde_json::from_str(text).map_err(|e| EnqueuerError::InvalidOptions {
            kind: TriggerKind::Firehose,
            message: format!("Invalid client frame: {}", e),
        })?;
        if frame.name == CONNECTION_EVENT || frame.name == CLOSE_EVENT {
            warn!(client_id = %client.id, name = %frame.name, "Client sent a reserved event name");
            return Ok(0);
        }

        let data = serde_json::to_string(&frame.data).unwrap_or_default();
        let size = self.context.queues.firehose.socket_count();
        Ok(self.emit(client, size, FirehoseMessage::new(frame.name, data)))
    }

    /// Forget a socket and emit `close`; returns the events enqueued
    pub fn disconnect(&self, client: &FirehoseClient) -> usize {
        let size = self.context.queues.firehose.remove_socket(&client.id);
        info!(client_id = %client.id, pool = size, "Firehose client disconnected");
        self.emit(client, size, FirehoseMessage::new(CLOSE_EVENT, ""))
    }

    fn emit(&self, client: &FirehoseClient, size: usize, message: FirehoseMessage) -> usize {
        let targets = self
            .registry
            .collect(|sub| matches_event(&sub.options.event, &message.name).then(|| sub.target.clone()))
            .unwrap_or_default();

        let mut enqueued = 0;
        for target in targets {
            let event = Event::new(EventType::Firehose, target);
            let payload = FirehosePayload {
                client: client.clone(),
                pool: FirehosePool { size },
                message: message.clone(),
            };
            let event_id = event.id.clone();
            let result = self
                .context
                .queues
                .firehose
                .enqueue(&event_id, payload)
                .and_then(|()| self.context.queues.events.enqueue(event));
            match result {
                Ok(()) => {
                    debug!(event_id = %event_id, name = %message.name, "Firehose event enqueued");
                    enqueued += 1;
                }
                Err(e) => {
                    self.context.queues.firehose.discard(&event_id);
                    warn!(event_id = %event_id, error = %e, "Failed to enqueue firehose event");
                }
            }
        }
        enqueued
    }
}

impl Enqueuer for FirehoseEnqueuer {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Firehose
    }

    fn description(&self) -> Description {
        Description::new(
            "firehose",
            "Firehose",
            "podcasts",
            "Invoke a handler for messages sent over the firehose socket.",
        )
    }

    fn options_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["event"],
            "properties": {
                "event": {
                    "type": "string",
                    "description": "Event name; '*' matches single-segment names, '**' matches all",
                    "examples": ["*", "**", CONNECTION_EVENT, CLOSE_EVENT]
                }
            }
        })
    }

    fn subscribe(&self, target: Target, options: TriggerOptions) -> EnqueuerResult<SubscriptionStatus> {
        let options = match options {
            TriggerOptions::Firehose(options) => options,
            other => {
                return Err(EnqueuerError::KindMismatch {
                    expected: TriggerKind::Firehose,
                    found: other.kind(),
                })
            }
        };

        if let Some(status) = self.registry.identical(&target, &options)? {
            return Ok(status);
        }
        self.registry.take(&target.key())?;

        let status = if options.event.is_empty() {
            SubscriptionStatus::failed("Event name must not be empty")
        } else {
            info!(function = %target, event = %options.event, "Firehose trigger subscribed");
            SubscriptionStatus::open()
        };
        self.registry.insert(Subscription {
            target,
            options,
            status: status.clone(),
            handle: (),
        })?;
        Ok(status)
    }

    fn unsubscribe(&self, target: &Target) -> usize {
        let count = match self.registry.remove_matching(target) {
            Ok(removed) => removed.len(),
            Err(e) => {
                warn!(error = %e, "Firehose unsubscribe failed");
                return 0;
            }
        };
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
                kind: TriggerKind::Firehose,
                target,
                options: serde_json::to_value(options).unwrap_or(Value::Null),
                status,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::enqueuer::test_support::context;
    use crate::queue::{Outbound, TargetContext};

    fn target(handler: &str) -> Target {
        Target::new("chat", handler, "/functions/chat", TargetContext::default())
    }

    fn subscribe(enqueuer: &FirehoseEnqueuer, handler: &str, event: &str) {
        enqueuer
            .subscribe(
                target(handler),
                TriggerOptions::Firehose(FirehoseOptions {
                    event: event.to_string(),
                }),
            )
            .unwrap();
    }

    fn client() -> FirehoseClient {
        FirehoseClient {
            id: "client-1".into(),
            remote_address: "127.0.0.1:50000".into(),
        }
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_event("**", "chat/message"));
        assert!(matches_event("**", CONNECTION_EVENT));
        assert!(matches_event("*", CONNECTION_EVENT));
        assert!(matches_event("*", CLOSE_EVENT));
        assert!(matches_event("*", "custom"));
        assert!(!matches_event("*", "chat/message"));
        assert!(matches_event("custom", "custom"));
        assert!(!matches_event("custom", "other"));
        assert!(!matches_event("custom", CONNECTION_EVENT));
    }

    #[tokio::test]
    async fn test_connect_message_close_lifecycle() {
        let (context, mut events) = context();
        let enqueuer = FirehoseEnqueuer::new(context.clone());
        subscribe(&enqueuer, "all", "*");

        let (tx, _rx) = mpsc::unbounded_channel::<Outbound>();
        assert_eq!(enqueuer.connect(&client(), tx).unwrap(), 1);
        assert_eq!(
            enqueuer
                .receive(&client(), r#"{"name":"custom","data":"mydata"}"#)
                .unwrap(),
            1
        );
        assert_eq!(enqueuer.disconnect(&client()), 1);

        let mut names = Vec::new();
        for _ in 0..3 {
            let event = events.recv().await.unwrap();
            let payload = context.queues.firehose.pop(&event.id).unwrap();
            if payload.message.name == "custom" {
                assert_eq!(payload.message.data, "\"mydata\"");
                assert_eq!(payload.pool.size, 1);
            }
            names.push(payload.message.name);
        }
        assert_eq!(names, vec![CONNECTION_EVENT, "custom", CLOSE_EVENT]);
        assert!(events.try_recv().is_err());
        assert_eq!(context.queues.firehose.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_one_event_per_matching_subscription() {
        let (context, mut events) = context();
        let enqueuer = FirehoseEnqueuer::new(context);
        subscribe(&enqueuer, "exact", "custom");
        subscribe(&enqueuer, "star", "*");
        subscribe(&enqueuer, "nested", "chat/message");

        assert_eq!(
            enqueuer.receive(&client(), r#"{"name":"custom","data":{"a":1}}"#).unwrap(),
            2
        );
        assert_eq!(
            enqueuer.receive(&client(), r#"{"name":"chat/message"}"#).unwrap(),
            1
        );
        for _ in 0..3 {
            events.recv().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_star_and_double_star_both_fire() {
        let (context, mut events) = context();
        let enqueuer = FirehoseEnqueuer::new(context.clone());
        subscribe(&enqueuer, "star", "*");
        subscribe(&enqueuer, "all", "**");

        let (tx, _rx) = mpsc::unbounded_channel::<Outbound>();
        assert_eq!(enqueuer.connect(&client(), tx).unwrap(), 2);
        assert_eq!(enqueuer.receive(&client(), r#"{"name":"ping"}"#).unwrap(), 2);
        assert_eq!(enqueuer.disconnect(&client()), 2);

        let mut seen = Vec::new();
        for _ in 0..6 {
            let event = events.recv().await.unwrap();
            let payload = context.queues.firehose.pop(&event.id).unwrap();
            seen.push((payload.message.name, event.target.handler));
        }
        assert!(events.try_recv().is_err());
        seen.sort();
        let mut expected: Vec<(String, String)> = [CONNECTION_EVENT, "ping", CLOSE_EVENT]
            .iter()
            .flat_map(|name| {
                ["all", "star"]
                    .iter()
                    .map(move |handler| (name.to_string(), handler.to_string()))
            })
            .collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_reserved_names_from_clients_are_ignored() {
        let (context, _events) = context();
        let enqueuer = FirehoseEnqueuer::new(context);
        subscribe(&enqueuer, "all", "**");
        assert_eq!(
            enqueuer.receive(&client(), r#"{"name":"close"}"#).unwrap(),
            0
        );
        assert!(enqueuer.receive(&client(), "not json").is_err());
    }
}
