//! # RPC Sub-Queue
//!
//! Inbound calls of RPC-triggered events and the reply path back to the
//! waiting caller.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::errors::{QueueError, QueueResult};
use super::http::Header;
use super::keyed::KeyedQueue;

/// Inbound call as seen by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCall {
    pub service: String,
    pub method: String,

    #[serde(default)]
    pub metadata: Vec<Header>,

    /// Raw call arguments
    #[serde(default, with = "crate::encoding::base64_bytes")]
    pub payload: Vec<u8>,
}

/// Answer to an inbound call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcReply {
    Ok {
        #[serde(default, with = "crate::encoding::base64_bytes")]
        payload: Vec<u8>,
    },
    Error {
        message: String,
    },
}

/// Waiting side of a call
pub type ReplyReceiver = oneshot::Receiver<RpcReply>;

/// RPC call queue
#[derive(Debug, Default)]
pub struct RpcQueue {
    calls: KeyedQueue<RpcCall>,
    replies: Mutex<HashMap<String, oneshot::Sender<RpcReply>>>,
}

impl RpcQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a call and open its reply path
    pub fn enqueue(&self, event_id: &str, call: RpcCall) -> QueueResult<ReplyReceiver> {
        let (tx, rx) = oneshot::channel();
        {
            let mut replies = self.replies.lock().map_err(|_| QueueError::poisoned())?;
            replies.insert(event_id.to_string(), tx);
        }
        self.calls.enqueue(event_id, call)?;
        Ok(rx)
    }

    pub fn pop(&self, event_id: &str) -> QueueResult<RpcCall> {
        self.calls.pop(event_id)
    }

    /// Deliver the reply of a call
    pub fn respond(&self, event_id: &str, reply: RpcReply) -> QueueResult<()> {
        let sender = {
            let mut replies = self.replies.lock().map_err(|_| QueueError::poisoned())?;
            replies.remove(event_id)
        };
        let sender = sender.ok_or_else(|| QueueError::AlreadyReplied(event_id.to_string()))?;
        let _ = sender.send(reply);
        Ok(())
    }

    /// Answer a call its worker abandoned; returns whether one was pending
    pub fn finalize(&self, event_id: &str, message: &str) -> bool {
        self.calls.discard(event_id);
        let sender = match self.replies.lock() {
            Ok(mut replies) => replies.remove(event_id),
            Err(_) => None,
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(RpcReply::Error {
                    message: message.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub fn size(&self) -> usize {
        self.calls.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> RpcCall {
        RpcCall {
            service: "Greeter".into(),
            method: "SayHello".into(),
            metadata: vec![Header::new("x-trace", "1")],
            payload: b"\x0a\x03bob".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_reply_reaches_caller() {
        let queue = RpcQueue::new();
        let rx = queue.enqueue("e1", call()).unwrap();

        assert_eq!(queue.pop("e1").unwrap(), call());
        queue
            .respond("e1", RpcReply::Ok { payload: b"hi".to_vec() })
            .unwrap();

        assert_eq!(rx.await.unwrap(), RpcReply::Ok { payload: b"hi".to_vec() });
    }

    #[test]
    fn test_double_reply_rejected() {
        let queue = RpcQueue::new();
        let _rx = queue.enqueue("e1", call()).unwrap();
        queue
            .respond("e1", RpcReply::Ok { payload: Vec::new() })
            .unwrap();

        let err = queue
            .respond("e1", RpcReply::Ok { payload: Vec::new() })
            .unwrap_err();
        assert_eq!(err, QueueError::AlreadyReplied("e1".into()));
    }

    #[tokio::test]
    async fn test_finalize_answers_with_error() {
        let queue = RpcQueue::new();
        let rx = queue.enqueue("e1", call()).unwrap();

        assert!(queue.finalize("e1", "worker crashed"));
        assert_eq!(queue.size(), 0);
        assert_eq!(
            rx.await.unwrap(),
            RpcReply::Error {
                message: "worker crashed".into()
            }
        );
    }
}
