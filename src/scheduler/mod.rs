//! # Scheduler
//!
//! Supervised pool of worker processes fed by the event queue.

pub mod errors;
pub mod pool;
pub mod worker;

pub use errors::{SchedulerError, SchedulerResult};
pub use pool::{Scheduler, SchedulerConfig, SchedulerHandle};
pub use worker::{
    supervise, ExitReason, ProcessSpawner, WorkerSpawner, WorkerSpec, WorkerState, WorkerTable,
    ENV_ENTRYPOINT, ENV_RPC_ADDRESS, ENV_TIMEOUT, ENV_WORKER_ID,
};
