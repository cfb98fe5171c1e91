//! CLI argument definitions using clap
//!
//! Commands:
//! - aerofn start --config <path>
//! - aerofn worker
//! - aerofn schema

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// AeroFn - a replication-aware function execution scheduler
#[derive(Parser, Debug)]
#[command(name = "aerofn")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a replica: HTTP server, worker RPC server, scheduler and engine
    Start {
        /// Path to configuration file
        #[arg(long, default_value = "./aerofn.json")]
        config: PathBuf,
    },

    /// Run one event as a worker process (started by the scheduler)
    Worker,

    /// Print trigger descriptions and option schemas
    Schema,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
