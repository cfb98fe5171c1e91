//! # Worker RPC Server
//!
//! Serves the queue set to worker processes. Each connection is handled by
//! its own task; calls on a connection are answered in order.

use std::net::SocketAddr;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::errors::{RpcError, RpcResult};
use super::protocol::{self, RequestFrame, ResponseFrame, RpcRequest, RpcResponse};
use crate::queue::{FirehosePool, QueueError, QueueResult, QueueSet};

/// TCP server exposing the queues to workers
pub struct RpcServer {
    listener: TcpListener,
    queues: QueueSet,
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcServer {
    /// Bind the listener. Failing here is fatal for the process.
    pub async fn bind(addr: &str, queues: QueueSet) -> RpcResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|source| RpcError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            listener,
            queues,
            shutdown_tx,
        })
    }

    /// Address workers connect to
    pub fn local_addr(&self) -> RpcResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle that stops the accept loop
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept connections until shut down
    pub async fn run(self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "Worker RPC server listening");
        }

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let queues = self.queues.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, queues).await {
                                    warn!(%peer_addr, error = %e, "Worker connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Worker RPC server shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_connection(stream: TcpStream, queues: QueueSet) -> RpcResult<()> {
        stream.set_nodelay(true)?;
        let mut transport = protocol::framed(stream);

        while let Some(frame) = protocol::recv_frame::<_, RequestFrame>(&mut transport).await? {
            let response = dispatch(&queues, frame.request).await;
            let reply = ResponseFrame {
                id: frame.id,
                response,
            };
            protocol::send_frame(&mut transport, &reply).await?;
        }

        debug!("Worker disconnected");
        Ok(())
    }
}

/// Execute one call against the queues
pub async fn dispatch(queues: &QueueSet, request: RpcRequest) -> RpcResponse {
    let outcome = match request {
        RpcRequest::Pop { worker_id } => queues.events.pop(&worker_id).await.map(to_value),
        RpcRequest::HttpPop { event_id } => queues.http.pop(&event_id).map(to_value),
        RpcRequest::HttpWriteHead {
            event_id,
            status,
            headers,
        } => queues
            .http
            .write_head(&event_id, status, headers)
            .map(to_value),
        RpcRequest::HttpWrite { event_id, data } => {
            queues.http.write(&event_id, data).map(to_value)
        }
        RpcRequest::HttpEnd { event_id, data } => queues.http.end(&event_id, data).map(to_value),
        RpcRequest::DatabasePop { event_id } => queues.database.pop(&event_id).map(to_value),
        RpcRequest::SchedulePop { event_id } => queues.schedule.pop(&event_id).map(to_value),
        RpcRequest::FirehosePop { event_id } => queues.firehose.pop(&event_id).map(to_value),
        RpcRequest::FirehoseSend { client_id, message } => {
            queues.firehose.send(&client_id, message).map(to_value)
        }
        RpcRequest::FirehoseSendAll { message } => queues
            .firehose
            .send_all(message)
            .map(|size| to_value(FirehosePool { size })),
        RpcRequest::FirehoseClose { client_id } => {
            queues.firehose.close(&client_id).map(to_value)
        }
        RpcRequest::RpcPop { event_id } => queues.rpc.pop(&event_id).map(to_value),
        RpcRequest::RpcRespond { event_id, reply } => {
            queues.rpc.respond(&event_id, reply).map(to_value)
        }
    };
    into_response(outcome)
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn into_response(outcome: QueueResult<Value>) -> RpcResponse {
    match outcome {
        Ok(result) => RpcResponse::Ok { result },
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &QueueError) -> RpcResponse {
    RpcResponse::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::queue::{Event, EventType, HttpRequest, ResponseChunk, Target};

    fn queues() -> QueueSet {
        let (queues, _rx) = QueueSet::new(Duration::from_millis(20));
        queues
    }

    fn request() -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            url: "/fn-execute/users/2".into(),
            path: "/users/2".into(),
            params: Vec::new(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_http_pop_and_end() {
        let queues = queues();
        let mut rx = queues.http.enqueue("e1", request()).unwrap();

        let popped = dispatch(
            &queues,
            RpcRequest::HttpPop {
                event_id: "e1".into(),
            },
        )
        .await;
        let popped: HttpRequest = popped.into_result().unwrap();
        assert_eq!(popped.path, "/users/2");

        let ended = dispatch(
            &queues,
            RpcRequest::HttpEnd {
                event_id: "e1".into(),
                data: Some(b"{\"id\":\"2\"}".to_vec()),
            },
        )
        .await;
        assert!(matches!(ended, RpcResponse::Ok { .. }));
        assert!(matches!(rx.recv().await, Some(ResponseChunk::Head { status: 200, .. })));
    }

    #[tokio::test]
    async fn test_dispatch_missing_item() {
        let queues = queues();
        let response = dispatch(
            &queues,
            RpcRequest::DatabasePop {
                event_id: "missing".into(),
            },
        )
        .await;
        assert_eq!(
            response,
            RpcResponse::Error {
                code: "NOT_FOUND".into(),
                message: "Queue has no item with id missing".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_dispatch_pop_assigned_event() {
        let queues = queues();
        let event = Event::new(EventType::System, Target::function("fn", "/fn"));
        queues.events.reserve("w1").unwrap();
        let _pickup = queues.events.assign("w1", event.clone()).unwrap();

        let response = dispatch(
            &queues,
            RpcRequest::Pop {
                worker_id: "w1".into(),
            },
        )
        .await;
        let popped: Event = response.into_result().unwrap();
        assert_eq!(popped.id, event.id);
    }
}
