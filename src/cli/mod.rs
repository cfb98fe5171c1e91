//! CLI module for aerofn
//!
//! - start: run a replica until Ctrl-C
//! - worker: run one event as a worker process
//! - schema: print the trigger catalog

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{run, run_command, schema, start, worker};
pub use errors::{CliError, CliErrorCode, CliResult};
