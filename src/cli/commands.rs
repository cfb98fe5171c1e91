//! CLI command implementations

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::app::App;
use crate::config::{Config, LoggingConfig};
use crate::enqueuer::{catalog, EnqueuerContext, EnqueuerSet, MemoryChangeFeed};
use crate::observability;
use crate::queue::QueueSet;
use crate::replication::Coordinator;
use crate::runtime::{self, WorkerEnv};
use crate::scheduler::{ProcessSpawner, Scheduler, SchedulerConfig};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};

/// Parse arguments and run the selected command
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command)
}

pub fn run_command(command: Command) -> CliResult<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match command {
        Command::Start { config } => rt.block_on(start(&config)),
        Command::Worker => {
            let code = rt.block_on(worker())?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::Schema => rt.block_on(schema()),
    }
}

/// Load the configuration and serve until Ctrl-C
pub async fn start(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    observability::init(&config.logging);
    info!(config = %config_path.display(), "Starting aerofn");

    let app = App::start(&config).await?;
    app.run_until_signal().await;
    Ok(())
}

/// Body of a worker process; returns its exit code
pub async fn worker() -> CliResult<i32> {
    observability::init(&LoggingConfig::default());
    let env = WorkerEnv::from_env()?;
    Ok(runtime::run_worker(env).await?)
}

/// Print the trigger catalog as JSON
pub async fn schema() -> CliResult<()> {
    let (queues, _events) = QueueSet::new(Duration::from_secs(1));
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        queues.clone(),
        std::sync::Arc::new(ProcessSpawner::new("true", Vec::new())),
    );
    let context = EnqueuerContext {
        queues,
        scheduler: scheduler.handle(),
        coordinator: Coordinator::standalone("schema"),
    };
    let enqueuers = EnqueuerSet::new(context, std::sync::Arc::new(MemoryChangeFeed::default()));

    let body = serde_json::to_string_pretty(&catalog(&enqueuers))
        .map_err(|e| CliError::io_error(e.to_string()))?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", body)?;
    Ok(())
}
