//! # HTTP Sub-Queue
//!
//! Holds serialized requests for HTTP-triggered events and the response
//! streams their workers write back to.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::errors::{QueueError, QueueResult};
use super::keyed::KeyedQueue;

/// Name/value pair used for headers, params and query strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Request as seen by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,

    /// Original url including query string
    pub url: String,

    /// Path relative to the trigger mount point
    pub path: String,

    #[serde(default)]
    pub params: Vec<Header>,

    #[serde(default)]
    pub query: Vec<Header>,

    #[serde(default)]
    pub headers: Vec<Header>,

    #[serde(default, with = "crate::encoding::base64_bytes")]
    pub body: Vec<u8>,
}

/// Piece of a streamed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseChunk {
    Head { status: u16, headers: Vec<Header> },
    Data(Vec<u8>),
    End,
}

/// Consuming side of a response stream, owned by the HTTP connection
pub type ResponseReceiver = mpsc::UnboundedReceiver<ResponseChunk>;

#[derive(Debug)]
struct ResponseStream {
    sender: mpsc::UnboundedSender<ResponseChunk>,
    headers_sent: bool,
}

impl ResponseStream {
    fn push(&self, chunk: ResponseChunk) {
        // The client may already be gone; the worker must not notice.
        let _ = self.sender.send(chunk);
    }

    fn ensure_head(&mut self) {
        if !self.headers_sent {
            self.headers_sent = true;
            self.push(ResponseChunk::Head {
                status: 200,
                headers: Vec::new(),
            });
        }
    }
}

/// HTTP request/response queue
#[derive(Debug, Default)]
pub struct HttpQueue {
    requests: KeyedQueue<HttpRequest>,
    responses: Mutex<HashMap<String, ResponseStream>>,
}

impl HttpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a request and open its response stream
    pub fn enqueue(&self, event_id: &str, request: HttpRequest) -> QueueResult<ResponseReceiver> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut responses = self.responses.lock().map_err(|_| QueueError::poisoned())?;
            responses.insert(
                event_id.to_string(),
                ResponseStream {
                    sender,
                    headers_sent: false,
                },
            );
        }
        self.requests.enqueue(event_id, request)?;
        Ok(receiver)
    }

    /// Remove and return the request of an event
    pub fn pop(&self, event_id: &str) -> QueueResult<HttpRequest> {
        self.requests.pop(event_id)
    }

    /// Send status and headers
    pub fn write_head(&self, event_id: &str, status: u16, headers: Vec<Header>) -> QueueResult<()> {
        let mut responses = self.responses.lock().map_err(|_| QueueError::poisoned())?;
        let stream = responses
            .get_mut(event_id)
            .ok_or_else(|| QueueError::NotFound(event_id.to_string()))?;

        if stream.headers_sent {
            return Err(QueueError::HeadersAlreadySent);
        }
        stream.headers_sent = true;
        stream.push(ResponseChunk::Head { status, headers });
        Ok(())
    }

    /// Send a body chunk, implicitly sending a 200 head first
    pub fn write(&self, event_id: &str, data: Vec<u8>) -> QueueResult<()> {
        let mut responses = self.responses.lock().map_err(|_| QueueError::poisoned())?;
        let stream = responses
            .get_mut(event_id)
            .ok_or_else(|| QueueError::NotFound(event_id.to_string()))?;

        stream.ensure_head();
        if !data.is_empty() {
            stream.push(ResponseChunk::Data(data));
        }
        Ok(())
    }

    /// Finish the response with an optional last chunk
    pub fn end(&self, event_id: &str, data: Option<Vec<u8>>) -> QueueResult<()> {
        let mut responses = self.responses.lock().map_err(|_| QueueError::poisoned())?;
        let mut stream = responses
            .remove(event_id)
            .ok_or_else(|| QueueError::NotFound(event_id.to_string()))?;

        stream.ensure_head();
        if let Some(data) = data.filter(|d| !d.is_empty()) {
            stream.push(ResponseChunk::Data(data));
        }
        stream.push(ResponseChunk::End);
        Ok(())
    }

    /// Complete a response its worker abandoned.
    ///
    /// Sends `status` with a JSON error body when no head was written yet,
    /// otherwise just ends the stream. Returns whether a stream was open.
    pub fn finalize(&self, event_id: &str, status: u16, message: &str) -> bool {
        self.requests.discard(event_id);

        let stream = match self.responses.lock() {
            Ok(mut responses) => responses.remove(event_id),
            Err(_) => return false,
        };
        let Some(mut stream) = stream else {
            return false;
        };

        if !stream.headers_sent {
            stream.headers_sent = true;
            stream.push(ResponseChunk::Head {
                status,
                headers: vec![Header::new("content-type", "application/json")],
            });
            let body = serde_json::json!({ "message": message }).to_string();
            stream.push(ResponseChunk::Data(body.into_bytes()));
        }
        stream.push(ResponseChunk::End);
        true
    }

    /// Number of requests not yet popped by a worker
    pub fn size(&self) -> usize {
        self.requests.size()
    }

    /// Number of responses still open
    pub fn open_responses(&self) -> usize {
        self.responses.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            url: path.into(),
            path: path.into(),
            params: Vec::new(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn test_enqueue_and_pop() {
        let queue = HttpQueue::new();
        let _rx = queue.enqueue("2", request("/hello")).unwrap();
        assert_eq!(queue.size(), 1);

        let popped = queue.pop("2").unwrap();
        assert_eq!(popped.path, "/hello");
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_pop_empty_queue() {
        let queue = HttpQueue::new();
        let err = queue.pop("1").unwrap_err();
        assert_eq!(err.to_string(), "Queue has no item with id 1");
    }

    #[test]
    fn test_streamed_response() {
        let queue = HttpQueue::new();
        let mut rx = queue.enqueue("e1", request("/")).unwrap();

        queue
            .write_head("e1", 201, vec![Header::new("x-test", "1")])
            .unwrap();
        queue.write("e1", b"hello ".to_vec()).unwrap();
        queue.end("e1", Some(b"world".to_vec())).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            ResponseChunk::Head {
                status: 201,
                headers: vec![Header::new("x-test", "1")]
            }
        );
        assert_eq!(rx.try_recv().unwrap(), ResponseChunk::Data(b"hello ".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), ResponseChunk::Data(b"world".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), ResponseChunk::End);
        assert_eq!(queue.open_responses(), 0);
    }

    #[test]
    fn test_write_head_twice_is_error() {
        let queue = HttpQueue::new();
        let _rx = queue.enqueue("e1", request("/")).unwrap();

        queue.write_head("e1", 200, Vec::new()).unwrap();
        let err = queue.write_head("e1", 200, Vec::new()).unwrap_err();
        assert_eq!(err, QueueError::HeadersAlreadySent);
    }

    #[test]
    fn test_write_implies_head() {
        let queue = HttpQueue::new();
        let mut rx = queue.enqueue("e1", request("/")).unwrap();

        queue.write("e1", b"x".to_vec()).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            ResponseChunk::Head { status: 200, .. }
        ));
        assert_eq!(
            queue.write_head("e1", 500, Vec::new()),
            Err(QueueError::HeadersAlreadySent)
        );
    }

    #[test]
    fn test_end_unknown_id() {
        let queue = HttpQueue::new();
        assert!(matches!(queue.end("nope", None), Err(QueueError::NotFound(_))));
    }

    #[test]
    fn test_finalize_without_head_sends_error() {
        let queue = HttpQueue::new();
        let mut rx = queue.enqueue("e1", request("/")).unwrap();

        assert!(queue.finalize("e1", 504, "Function timed out"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            ResponseChunk::Head { status: 504, .. }
        ));
        match rx.try_recv().unwrap() {
            ResponseChunk::Data(body) => {
                let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(json["message"], "Function timed out");
            }
            other => panic!("unexpected chunk {:?}", other),
        }
        assert_eq!(rx.try_recv().unwrap(), ResponseChunk::End);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_finalize_after_head_only_ends() {
        let queue = HttpQueue::new();
        let mut rx = queue.enqueue("e1", request("/")).unwrap();
        queue.write_head("e1", 200, Vec::new()).unwrap();

        assert!(queue.finalize("e1", 500, "crashed"));
        assert!(matches!(rx.try_recv().unwrap(), ResponseChunk::Head { status: 200, .. }));
        assert_eq!(rx.try_recv().unwrap(), ResponseChunk::End);
        assert!(!queue.finalize("e1", 500, "crashed"));
    }
}
