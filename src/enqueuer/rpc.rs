//! # RPC Enqueuer
//!
//! Each subscription runs its own framed server (optionally TLS) exposing
//! one `service/method`. Calls are answered from the RPC sub-queue.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::Poll;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::errors::{EnqueuerError, EnqueuerResult};
use super::subscription::{Subscription, SubscriptionRegistry, SubscriptionStatus};
use super::tls;
use super::{Description, Enqueuer, EnqueuerContext, SubscriptionInfo, TriggerKind, TriggerOptions};
use crate::queue::{Event, EventType, QueueSet, RpcCall, RpcReply, Target};
use crate::rpc::protocol;
use crate::rpc::RpcResult;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// PEM files of a TLS-enabled trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    pub cert: String,
    pub key: String,
}

/// Options of an RPC trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcOptions {
    pub service: String,
    pub method: String,

    #[serde(default = "default_host")]
    pub host: String,

    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
}

/// Listening socket shared by a handle and its accept loop
type ListenerSlot = Arc<Mutex<Option<TcpListener>>>;

/// Running server of one subscription
#[derive(Debug)]
pub struct RpcServerHandle {
    listener: ListenerSlot,
    stop: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl RpcServerHandle {
    /// Close the socket and stop every connection before returning.
    ///
    /// The port is free again once this returns, so a replacement
    /// subscription can bind it immediately.
    fn close(self) {
        self.stop.cancel();
        drop(
            self.listener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.task.abort();
    }
}

/// RPC trigger enqueuer
pub struct RpcEnqueuer {
    context: EnqueuerContext,
    registry: SubscriptionRegistry<RpcOptions, Option<RpcServerHandle>>,
}

impl RpcEnqueuer {
    pub fn new(context: EnqueuerContext) -> Self {
        Self {
            context,
            registry: SubscriptionRegistry::new(),
        }
    }

    /// Address the server of a subscribed target listens on
    pub fn local_addr(&self, target: &Target) -> Option<SocketAddr> {
        let key = target.key();
        self.registry
            .find_map(|sub| {
                (sub.target.key() == key)
                    .then(|| sub.handle.as_ref().map(|h| h.local_addr))
                    .flatten()
            })
            .ok()
            .flatten()
    }

    fn open(&self, target: &Target, options: &RpcOptions) -> Result<RpcServerHandle, String> {
        let acceptor = options.tls.as_ref().map(tls::load_acceptor).transpose()?;

        let listener = std::net::TcpListener::bind((options.host.as_str(), options.port))
            .map_err(|e| format!("Failed to bind {}:{}: {}", options.host, options.port, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| format!("Failed to configure listener: {}", e))?;
        let listener = TcpListener::from_std(listener)
            .map_err(|e| format!("Failed to register listener: {}", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to read listener address: {}", e))?;

        let listener: ListenerSlot = Arc::new(Mutex::new(Some(listener)));
        let stop = CancellationToken::new();
        let task = tokio::spawn(serve(
            Arc::clone(&listener),
            stop.clone(),
            acceptor,
            target.clone(),
            options.clone(),
            self.context.queues.clone(),
        ));
        Ok(RpcServerHandle {
            listener,
            stop,
            task,
            local_addr,
        })
    }

    fn release(&self, subscription: Subscription<RpcOptions, Option<RpcServerHandle>>) {
        if let Some(server) = subscription.handle {
            let addr = server.local_addr;
            server.close();
            info!(function = %subscription.target, %addr, "RPC trigger server stopped");
        }
    }
}

/// Next connection, or `None` once the listener was closed
async fn accept(listener: &ListenerSlot) -> Option<io::Result<(TcpStream, SocketAddr)>> {
    std::future::poll_fn(|cx| {
        let slot = listener.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(listener) => listener.poll_accept(cx).map(Some),
            None => Poll::Ready(None),
        }
    })
    .await
}

async fn serve(
    listener: ListenerSlot,
    stop: CancellationToken,
    acceptor: Option<TlsAcceptor>,
    target: Target,
    options: RpcOptions,
    queues: QueueSet,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            accepted = accept(&listener) => accepted,
        };
        let (stream, peer_addr) = match accepted {
            Some(Ok(accepted)) => accepted,
            Some(Err(e)) => {
                warn!(error = %e, "RPC trigger accept failed");
                continue;
            }
            None => break,
        };

        let stop = stop.clone();
        let acceptor = acceptor.clone();
        let target = target.clone();
        let options = options.clone();
        let queues = queues.clone();
        tokio::spawn(async move {
            let connection = async {
                match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => answer_calls(stream, &target, &options, &queues, &stop).await,
                        Err(e) => {
                            warn!(%peer_addr, error = %e, "TLS handshake failed");
                            Ok(())
                        }
                    },
                    None => answer_calls(stream, &target, &options, &queues, &stop).await,
                }
            };
            let result = tokio::select! {
                biased;
                _ = stop.cancelled() => Ok(()),
                result = connection => result,
            };
            if let Err(e) = result {
                debug!(%peer_addr, error = %e, "RPC trigger connection closed");
            }
        });
    }
}

async fn answer_calls<S>(
    stream: S,
    target: &Target,
    options: &RpcOptions,
    queues: &QueueSet,
    stop: &CancellationToken,
) -> RpcResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut transport = protocol::framed(stream);

    while let Some(call) = protocol::recv_frame::<_, RpcCall>(&mut transport).await? {
        let reply = if call.service != options.service || call.method != options.method {
            RpcReply::Error {
                message: format!("Unimplemented method {}/{}", call.service, call.method),
            }
        } else if stop.is_cancelled() {
            return Ok(());
        } else {
            invoke(call, target, queues).await
        };
        protocol::send_frame(&mut transport, &reply).await?;
    }
    Ok(())
}

async fn invoke(call: RpcCall, target: &Target, queues: &QueueSet) -> RpcReply {
    let event = Event::new(EventType::Rpc, target.clone());
    let event_id = event.id.clone();

    let reply = match queues.rpc.enqueue(&event_id, call) {
        Ok(reply) => reply,
        Err(e) => {
            return RpcReply::Error {
                message: e.to_string(),
            }
        }
    };
    if let Err(e) = queues.events.enqueue(event) {
        queues.rpc.finalize(&event_id, &e.to_string());
    }
    debug!(event_id = %event_id, function = %target, "RPC event enqueued");

    reply.await.unwrap_or_else(|_| RpcReply::Error {
        message: "Call was dropped".to_string(),
    })
}

impl Enqueuer for RpcEnqueuer {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Rpc
    }

    fn description(&self) -> Description {
        Description::new(
            "rpc",
            "RPC",
            "settings_ethernet",
            "Invoke a handler for calls to a service method on a dedicated port.",
        )
    }

    fn options_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["service", "method", "port"],
            "properties": {
                "service": { "type": "string" },
                "method": { "type": "string" },
                "host": { "type": "string", "default": "0.0.0.0" },
                "port": { "type": "integer", "minimum": 0, "maximum": 65535 },
                "tls": {
                    "type": "object",
                    "required": ["cert", "key"],
                    "properties": {
                        "cert": { "type": "string", "description": "PEM certificate chain path" },
                        "key": { "type": "string", "description": "PEM private key path" }
                    }
                }
            }
        })
    }

    fn subscribe(&self, target: Target, options: TriggerOptions) -> EnqueuerResult<SubscriptionStatus> {
        let options = match options {
            TriggerOptions::Rpc(options) => options,
            other => {
                return Err(EnqueuerError::KindMismatch {
                    expected: TriggerKind::Rpc,
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

        let (status, server) = match self.open(&target, &options) {
            Ok(server) => {
                info!(
                    function = %target,
                    service = %options.service,
                    method = %options.method,
                    addr = %server.local_addr,
                    tls = options.tls.is_some(),
                    "RPC trigger server started"
                );
                (SubscriptionStatus::open(), Some(server))
            }
            Err(message) => {
                warn!(function = %target, error = %message, "RPC trigger failed");
                (SubscriptionStatus::failed(message), None)
            }
        };

        self.registry.insert(Subscription {
            target,
            options,
            status: status.clone(),
            handle: server,
        })?;
        Ok(status)
    }

    fn unsubscribe(&self, target: &Target) -> usize {
        let removed = match self.registry.remove_matching(target) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "RPC unsubscribe failed");
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
                kind: TriggerKind::Rpc,
                target,
                options: serde_json::to_value(options).unwrap_or(Value::Null),
                status,
            })
            .collect()
    }
}
