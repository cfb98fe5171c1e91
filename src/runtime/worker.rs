//! # Built-in Worker
//!
//! Process body for `aerofn worker`: claim the assigned event, fetch its
//! payload, run the handler executable, then answer through the scheduler.

use std::path::PathBuf;

use serde_json::{json, Value};
use tracing::{info, warn};

use super::errors::{RuntimeError, RuntimeResult};
use super::handler::{self, FirehoseCommand, HandlerOutput};
use crate::queue::{Event, EventType, Header, RpcReply};
use crate::rpc::WorkerClient;
use crate::scheduler::{ENV_ENTRYPOINT, ENV_RPC_ADDRESS, ENV_TIMEOUT, ENV_WORKER_ID};

/// Protocol variables a worker is started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub rpc_address: String,
    pub worker_id: String,
    pub entrypoint: String,
    pub timeout: u64,
}

impl WorkerEnv {
    pub fn from_env() -> RuntimeResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RuntimeResult<Self> {
        let get = |name: &'static str| lookup(name).ok_or(RuntimeError::MissingEnv(name));
        let timeout = get(ENV_TIMEOUT)?;
        Ok(Self {
            rpc_address: get(ENV_RPC_ADDRESS)?,
            worker_id: get(ENV_WORKER_ID)?,
            entrypoint: get(ENV_ENTRYPOINT)?,
            timeout: timeout.parse().map_err(|_| RuntimeError::InvalidEnv {
                name: ENV_TIMEOUT,
                value: timeout.clone(),
            })?,
        })
    }
}

/// Run one event to completion and return the process exit code
pub async fn run_worker(env: WorkerEnv) -> RuntimeResult<i32> {
    let mut client = WorkerClient::connect(&env.rpc_address).await?;
    let event = client.pop(&env.worker_id).await?;
    info!(
        worker_id = %env.worker_id,
        event_id = %event.id,
        event_type = %event.event_type,
        function = %event.target,
        "Picked up event"
    );

    let input = fetch_payload(&mut client, &event).await?;
    let cwd = PathBuf::from(&event.target.cwd);

    let Some(path) = handler::resolve(&cwd, &env.entrypoint) else {
        let message = handler::missing_handler_message(&env.entrypoint);
        warn!(event_id = %event.id, handler = %env.entrypoint, "Handler not found");
        answer_failure(&mut client, &event, 500, &message).await?;
        return Ok(1);
    };

    let output = match handler::execute(&path, &cwd, &input).await {
        Ok(output) => output,
        Err(e) => {
            warn!(event_id = %event.id, error = %e, "Handler could not be started");
            answer_failure(&mut client, &event, 500, &e.to_string()).await?;
            return Ok(1);
        }
    };

    answer(&mut client, &event, &output).await?;
    Ok(if output.success() { 0 } else { 1 })
}

async fn fetch_payload(client: &mut WorkerClient, event: &Event) -> RuntimeResult<Value> {
    let payload = match event.event_type {
        EventType::Http => to_value(client.http_pop(&event.id).await?),
        EventType::Database => to_value(client.database_pop(&event.id).await?),
        EventType::Schedule => to_value(client.schedule_pop(&event.id).await?),
        EventType::Firehose => to_value(client.firehose_pop(&event.id).await?),
        EventType::Rpc => to_value(client.rpc_pop(&event.id).await?),
        EventType::System => Value::Null,
    };

    Ok(json!({
        "id": event.id,
        "type": event.event_type,
        "function": event.target.id,
        "handler": event.target.handler,
        "payload": payload,
    }))
}

fn to_value<T: serde::Serialize>(payload: T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

async fn answer_failure(
    client: &mut WorkerClient,
    event: &Event,
    status: u16,
    message: &str,
) -> RuntimeResult<()> {
    match event.event_type {
        EventType::Http => {
            let body = json!({ "message": message }).to_string().into_bytes();
            client
                .http_write_head(&event.id, status, vec![json_content_type()])
                .await?;
            client.http_end(&event.id, Some(body)).await?;
        }
        EventType::Rpc => {
            client
                .rpc_respond(
                    &event.id,
                    RpcReply::Error {
                        message: message.to_string(),
                    },
                )
                .await?;
        }
        _ => {}
    }
    Ok(())
}

async fn answer(client: &mut WorkerClient, event: &Event, output: &HandlerOutput) -> RuntimeResult<()> {
    match event.event_type {
        EventType::Http if output.success() => {
            client.http_write_head(&event.id, 200, Vec::new()).await?;
            client.http_end(&event.id, Some(output.stdout.clone())).await?;
        }
        EventType::Http => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            answer_failure(client, event, 500, stderr.trim()).await?;
        }
        EventType::Rpc if output.success() => {
            client
                .rpc_respond(
                    &event.id,
                    RpcReply::Ok {
                        payload: output.stdout.clone(),
                    },
                )
                .await?;
        }
        EventType::Rpc => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            answer_failure(client, event, 500, stderr.trim()).await?;
        }
        EventType::Firehose => {
            for command in handler::parse_firehose_commands(&output.stdout) {
                forward(client, command).await?;
            }
        }
        EventType::Database | EventType::Schedule | EventType::System => {
            info!(
                event_id = %event.id,
                code = ?output.code,
                output = %String::from_utf8_lossy(&output.stdout).trim(),
                "Handler finished"
            );
        }
    }
    Ok(())
}

async fn forward(client: &mut WorkerClient, command: FirehoseCommand) -> RuntimeResult<()> {
    let result = match &command {
        FirehoseCommand::Send {
            client_id,
            name,
            data,
        } => {
            client
                .firehose_send(client_id, FirehoseCommand::message(name, data))
                .await
        }
        FirehoseCommand::SendAll { name, data } => client
            .firehose_send_all(FirehoseCommand::message(name, data))
            .await
            .map(drop),
        FirehoseCommand::Close { client_id } => client.firehose_close(client_id).await,
    };

    match result {
        // The socket may have gone away while the handler ran.
        Err(e) if e.is_not_found() => {
            warn!(command = ?command, "Firehose client is gone");
            Ok(())
        }
        other => other.map_err(RuntimeError::from),
    }
}

fn json_content_type() -> Header {
    Header::new("content-type", "application/json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_worker_env_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_RPC_ADDRESS, "127.0.0.1:7070"),
            (ENV_WORKER_ID, "w1"),
            (ENV_ENTRYPOINT, "default"),
            (ENV_TIMEOUT, "30"),
        ]
        .into_iter()
        .collect();

        let env = WorkerEnv::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(env.worker_id, "w1");
        assert_eq!(env.timeout, 30);
    }

    #[test]
    fn test_worker_env_missing_and_invalid() {
        let err = WorkerEnv::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingEnv(ENV_TIMEOUT)));

        let err = WorkerEnv::from_lookup(|name| {
            Some(if name == ENV_TIMEOUT { "soon".into() } else { "x".into() })
        })
        .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidEnv { .. }));
    }
}
