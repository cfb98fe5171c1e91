//! # Worker Protocol Messages
//!
//! Length-delimited frames, each carrying one JSON document. Requests are
//! answered in order on the same connection; `id` correlates the pair.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::errors::{RpcError, RpcResult};
use crate::queue::{FirehoseMessage, Header, RpcReply};

/// Upper bound of one frame
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Worker protocol call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Collect the event assigned to a worker
    Pop { worker_id: String },

    HttpPop { event_id: String },
    HttpWriteHead {
        event_id: String,
        status: u16,
        #[serde(default)]
        headers: Vec<Header>,
    },
    HttpWrite {
        event_id: String,
        #[serde(with = "crate::encoding::base64_bytes")]
        data: Vec<u8>,
    },
    HttpEnd {
        event_id: String,
        #[serde(default, with = "crate::encoding::base64_bytes_opt")]
        data: Option<Vec<u8>>,
    },

    DatabasePop { event_id: String },

    SchedulePop { event_id: String },

    FirehosePop { event_id: String },
    FirehoseSend {
        client_id: String,
        message: FirehoseMessage,
    },
    FirehoseSendAll { message: FirehoseMessage },
    FirehoseClose { client_id: String },

    RpcPop { event_id: String },
    RpcRespond { event_id: String, reply: RpcReply },
}

/// Framed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: RpcRequest,
}

/// Outcome of a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcResponse {
    Ok {
        #[serde(default)]
        result: Value,
    },
    Error {
        code: String,
        message: String,
    },
}

impl RpcResponse {
    pub fn ok<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(result) => RpcResponse::Ok { result },
            Err(e) => RpcResponse::Error {
                code: "INTERNAL".into(),
                message: format!("Failed to encode result: {}", e),
            },
        }
    }

    /// Decode the result into the type the caller expects
    pub fn into_result<T: DeserializeOwned>(self) -> RpcResult<T> {
        match self {
            RpcResponse::Ok { result } => Ok(serde_json::from_value(result)?),
            RpcResponse::Error { code, message } => Err(RpcError::Remote { code, message }),
        }
    }
}

/// Framed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub response: RpcResponse,
}

/// Transport wrapped in the protocol's length-delimited framing
pub type FrameTransport<T> = Framed<T, LengthDelimitedCodec>;

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> FrameTransport<T> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(io, codec)
}

/// Write one JSON document as a frame
pub async fn send_frame<T, M>(transport: &mut FrameTransport<T>, message: &M) -> RpcResult<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    transport.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Read the next frame; `None` when the peer closed the connection
pub async fn recv_frame<T, M>(transport: &mut FrameTransport<T>) -> RpcResult<Option<M>>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    match transport.next().await {
        Some(Ok(bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Some(Err(e)) => Err(RpcError::Io(e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let frame = RequestFrame {
            id: 7,
            request: RpcRequest::Pop {
                worker_id: "w1".into(),
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            json!({"id": 7, "request": {"method": "pop", "params": {"worker_id": "w1"}}})
        );
    }

    #[test]
    fn test_http_end_without_data() {
        let json = json!({"method": "http_end", "params": {"event_id": "e1"}});
        let request: RpcRequest = serde_json::from_value(json).unwrap();
        assert_eq!(
            request,
            RpcRequest::HttpEnd {
                event_id: "e1".into(),
                data: None
            }
        );
    }

    #[test]
    fn test_error_response_into_result() {
        let response = RpcResponse::Error {
            code: "NOT_FOUND".into(),
            message: "Queue has no item with id 1".into(),
        };
        let err = response.into_result::<Value>().unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = framed(client);
        let mut server = framed(server);

        let frame = RequestFrame {
            id: 1,
            request: RpcRequest::FirehoseClose {
                client_id: "c1".into(),
            },
        };
        send_frame(&mut client, &frame).await.unwrap();
        let received: RequestFrame = recv_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received, frame);

        drop(client);
        let closed: Option<RequestFrame> = recv_frame(&mut server).await.unwrap();
        assert!(closed.is_none());
    }
}
