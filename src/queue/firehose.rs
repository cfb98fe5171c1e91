//! # Firehose Sub-Queue
//!
//! Stores socket messages for firehose-triggered events and keeps the
//! table of live sockets workers can talk back to.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::errors::{QueueError, QueueResult};
use super::keyed::KeyedQueue;

/// Name of the synthetic message emitted when a socket connects
pub const CONNECTION_EVENT: &str = "connection";

/// Name of the synthetic message emitted when a socket disconnects
pub const CLOSE_EVENT: &str = "close";

/// Connected socket as seen by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirehoseClient {
    pub id: String,
    pub remote_address: String,
}

/// State of all connected sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirehosePool {
    pub size: usize,
}

/// A named socket message; `data` carries JSON text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirehoseMessage {
    pub name: String,
    #[serde(default)]
    pub data: String,
}

impl FirehoseMessage {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Payload of a firehose-triggered event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirehosePayload {
    pub client: FirehoseClient,
    pub pool: FirehosePool,
    pub message: FirehoseMessage,
}

/// Instruction delivered to a socket task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(FirehoseMessage),
    Close,
}

/// Sending side held for each live socket
pub type SocketSender = mpsc::UnboundedSender<Outbound>;

/// Firehose message queue and live socket table
#[derive(Debug, Default)]
pub struct FirehoseQueue {
    payloads: KeyedQueue<FirehosePayload>,
    sockets: RwLock<HashMap<String, SocketSender>>,
}

impl FirehoseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, event_id: &str, payload: FirehosePayload) -> QueueResult<()> {
        self.payloads.enqueue(event_id, payload)
    }

    pub fn pop(&self, event_id: &str) -> QueueResult<FirehosePayload> {
        self.payloads.pop(event_id)
    }

    pub fn discard(&self, event_id: &str) -> bool {
        self.payloads.discard(event_id)
    }

    pub fn size(&self) -> usize {
        self.payloads.size()
    }

    /// Register a live socket; returns the pool size including it
    pub fn add_socket(&self, client_id: &str, sender: SocketSender) -> QueueResult<usize> {
        let mut sockets = self.sockets.write().map_err(|_| QueueError::poisoned())?;
        sockets.insert(client_id.to_string(), sender);
        Ok(sockets.len())
    }

    /// Forget a socket; returns the remaining pool size
    pub fn remove_socket(&self, client_id: &str) -> usize {
        match self.sockets.write() {
            Ok(mut sockets) => {
                sockets.remove(client_id);
                sockets.len()
            }
            Err(_) => 0,
        }
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Send a message to one socket
    pub fn send(&self, client_id: &str, message: FirehoseMessage) -> QueueResult<()> {
        let sockets = self.sockets.read().map_err(|_| QueueError::poisoned())?;
        let sender = sockets
            .get(client_id)
            .ok_or_else(|| QueueError::NotFound(client_id.to_string()))?;
        sender
            .send(Outbound::Message(message))
            .map_err(|_| QueueError::NotFound(client_id.to_string()))
    }

    /// Send a message to every live socket; returns how many received it
    pub fn send_all(&self, message: FirehoseMessage) -> QueueResult<usize> {
        let sockets = self.sockets.read().map_err(|_| QueueError::poisoned())?;
        Ok(sockets
            .values()
            .filter(|sender| sender.send(Outbound::Message(message.clone())).is_ok())
            .count())
    }

    /// Close a socket and remove it from the live set
    pub fn close(&self, client_id: &str) -> QueueResult<()> {
        let mut sockets = self.sockets.write().map_err(|_| QueueError::poisoned())?;
        let sender = sockets
            .remove(client_id)
            .ok_or_else(|| QueueError::NotFound(client_id.to_string()))?;
        let _ = sender.send(Outbound::Close);
        Ok(())
    }
}
