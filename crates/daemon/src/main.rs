//! Warren - queue-to-process-pool message dispatcher
//!
//! `warren dispatch` reads messages (one per line) and hands them to a pool
//! of worker processes; `warren worker` is the worker side, started by the
//! dispatcher itself.

mod dispatch;
mod logging;
mod settings;
mod worker;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use dispatch::DispatchOptions;
use settings::Settings;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "warren")]
#[command(about = "Queue-to-process-pool message dispatcher", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ~/.warren/warren.toml)
    #[arg(long, global = true, env = "WARREN_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch messages to a pool of workers
    Dispatch {
        /// Read messages from a file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Queue name reported for plain-text messages
        #[arg(short, long)]
        queue: Option<String>,

        /// Maximum concurrent workers (-1 = unlimited)
        #[arg(long, allow_hyphen_values = true)]
        max_workers: Option<i64>,

        /// Cached messages before the input is paused (0 = never pause)
        #[arg(long)]
        cache_limit: Option<i64>,

        /// Keep running after the input ends
        #[arg(long)]
        follow: bool,

        /// Run workers as tasks inside this process
        #[arg(long)]
        in_process: bool,
    },

    /// Worker process (started by the dispatcher)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        worker_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    let _log_guard = logging::init(&settings.log)?;

    match cli.command {
        Commands::Dispatch {
            input,
            queue,
            max_workers,
            cache_limit,
            follow,
            in_process,
        } => {
            if input.is_some() {
                settings.feed.input = input;
            }
            if let Some(queue) = queue {
                settings.feed.queue = queue;
            }
            if let Some(max_workers) = max_workers {
                settings.dispatcher.max_workers = max_workers;
            }
            if let Some(cache_limit) = cache_limit {
                settings.dispatcher.cache_limit = cache_limit;
            }
            if follow {
                settings.feed.exit_on_eof = false;
            }

            info!("Warren v{} starting...", VERSION);
            dispatch::run(
                settings,
                DispatchOptions {
                    config_path: cli.config,
                    in_process,
                },
            )
            .await
        }
        Commands::Worker { worker_id } => worker::run(&settings.worker, worker_id).await,
    }
}
