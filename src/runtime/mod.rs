//! # Worker Runtime
//!
//! The worker program shipped with the scheduler. Handlers are plain
//! executables; any language works.

pub mod errors;
pub mod handler;
pub mod worker;

pub use errors::{RuntimeError, RuntimeResult};
pub use handler::{FirehoseCommand, HandlerOutput};
pub use worker::{run_worker, WorkerEnv};
