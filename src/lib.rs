//! aerofn - a replication-aware function execution scheduler
//!
//! Triggers (HTTP, database changes, schedules, firehose sockets, inbound
//! RPC) become events. Each event runs in its own worker process, which
//! talks back to the scheduler over a framed TCP protocol.

pub mod app;
pub mod cli;
pub mod config;
pub mod encoding;
pub mod engine;
pub mod enqueuer;
pub mod http_server;
pub mod observability;
pub mod queue;
pub mod replication;
pub mod rpc;
pub mod runtime;
pub mod scheduler;
