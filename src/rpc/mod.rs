//! # Worker RPC
//!
//! Length-delimited JSON protocol between the scheduler and its worker
//! processes.

pub mod client;
pub mod errors;
pub mod protocol;
pub mod server;

pub use client::WorkerClient;
pub use errors::{RpcError, RpcResult};
pub use protocol::{RequestFrame, ResponseFrame, RpcRequest, RpcResponse};
pub use server::RpcServer;
