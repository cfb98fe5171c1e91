//! # Worker RPC Client
//!
//! Used by worker processes to pull their event and payloads and to write
//! results back.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;

use super::errors::{RpcError, RpcResult};
use super::protocol::{self, FrameTransport, RequestFrame, ResponseFrame, RpcRequest};
use crate::queue::{
    DatabaseChange, Event, FirehoseMessage, FirehosePayload, FirehosePool, Header, HttpRequest,
    RpcCall, RpcReply, ScheduleTick,
};

/// Connection to the scheduler's worker RPC server
pub struct WorkerClient {
    transport: FrameTransport<TcpStream>,
    next_id: u64,
}

impl WorkerClient {
    pub async fn connect(addr: &str) -> RpcResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            transport: protocol::framed(stream),
            next_id: 0,
        })
    }

    /// Send one request and wait for its response
    pub async fn call<T: DeserializeOwned>(&mut self, request: RpcRequest) -> RpcResult<T> {
        self.next_id += 1;
        let id = self.next_id;
        protocol::send_frame(&mut self.transport, &RequestFrame { id, request }).await?;

        let frame: ResponseFrame = protocol::recv_frame(&mut self.transport)
            .await?
            .ok_or(RpcError::ConnectionClosed)?;
        if frame.id != id {
            return Err(RpcError::InvalidFrame(format!(
                "expected response {}, got {}",
                id, frame.id
            )));
        }
        frame.response.into_result()
    }

    pub async fn pop(&mut self, worker_id: &str) -> RpcResult<Event> {
        self.call(RpcRequest::Pop {
            worker_id: worker_id.to_string(),
        })
        .await
    }

    pub async fn http_pop(&mut self, event_id: &str) -> RpcResult<HttpRequest> {
        self.call(RpcRequest::HttpPop {
            event_id: event_id.to_string(),
        })
        .await
    }

    pub async fn http_write_head(
        &mut self,
        event_id: &str,
        status: u16,
        headers: Vec<Header>,
    ) -> RpcResult<()> {
        self.call::<Value>(RpcRequest::HttpWriteHead {
            event_id: event_id.to_string(),
            status,
            headers,
        })
        .await
        .map(drop)
    }

    pub async fn http_write(&mut self, event_id: &str, data: Vec<u8>) -> RpcResult<()> {
        self.call::<Value>(RpcRequest::HttpWrite {
            event_id: event_id.to_string(),
            data,
        })
        .await
        .map(drop)
    }

    pub async fn http_end(&mut self, event_id: &str, data: Option<Vec<u8>>) -> RpcResult<()> {
        self.call::<Value>(RpcRequest::HttpEnd {
            event_id: event_id.to_string(),
            data,
        })
        .await
        .map(drop)
    }

    pub async fn database_pop(&mut self, event_id: &str) -> RpcResult<DatabaseChange> {
        self.call(RpcRequest::DatabasePop {
            event_id: event_id.to_string(),
        })
        .await
    }

    pub async fn schedule_pop(&mut self, event_id: &str) -> RpcResult<ScheduleTick> {
        self.call(RpcRequest::SchedulePop {
            event_id: event_id.to_string(),
        })
        .await
    }

    pub async fn firehose_pop(&mut self, event_id: &str) -> RpcResult<FirehosePayload> {
        self.call(RpcRequest::FirehosePop {
            event_id: event_id.to_string(),
        })
        .await
    }

    pub async fn firehose_send(
        &mut self,
        client_id: &str,
        message: FirehoseMessage,
    ) -> RpcResult<()> {
        self.call::<Value>(RpcRequest::FirehoseSend {
            client_id: client_id.to_string(),
            message,
        })
        .await
        .map(drop)
    }

    /// Broadcast to every socket; returns the number reached
    pub async fn firehose_send_all(&mut self, message: FirehoseMessage) -> RpcResult<usize> {
        let pool: FirehosePool = self.call(RpcRequest::FirehoseSendAll { message }).await?;
        Ok(pool.size)
    }

    pub async fn firehose_close(&mut self, client_id: &str) -> RpcResult<()> {
        self.call::<Value>(RpcRequest::FirehoseClose {
            client_id: client_id.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn rpc_pop(&mut self, event_id: &str) -> RpcResult<RpcCall> {
        self.call(RpcRequest::RpcPop {
            event_id: event_id.to_string(),
        })
        .await
    }

    pub async fn rpc_respond(&mut self, event_id: &str, reply: RpcReply) -> RpcResult<()> {
        self.call::<Value>(RpcRequest::RpcRespond {
            event_id: event_id.to_string(),
            reply,
        })
        .await
        .map(drop)
    }
}
