//! # Firehose WebSocket
//!
//! One socket per client. Text frames become firehose events; the
//! outbound channel carries messages and close requests from workers.

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::state::AppState;
use crate::queue::{FirehoseClient, Outbound};

pub const FIREHOSE_PATH: &str = "/firehose";

pub fn firehose_routes() -> Router<AppState> {
    Router::new().route(FIREHOSE_PATH, get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> impl IntoResponse {
    let client = FirehoseClient {
        id: Uuid::new_v4().to_string(),
        remote_address: connect_info
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_default(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, client))
}

async fn handle_socket(socket: WebSocket, state: AppState, client: FirehoseClient) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let firehose = state.enqueuers.firehose.clone();

    if let Err(e) = firehose.connect(&client, outbound_tx) {
        warn!(client_id = %client.id, error = %e, "Failed to register firehose client");
        return;
    }

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Message(message) => {
                    let Ok(text) = serde_json::to_string(&message) else {
                        continue;
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = firehose.receive(&client, &text) {
                        debug!(client_id = %client.id, error = %e, "Ignoring client frame");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(client_id = %client.id, error = %e, "Firehose socket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = &mut writer => break,
        }
    }

    writer.abort();
    firehose.disconnect(&client);
}
