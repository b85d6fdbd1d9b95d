// Dispatcher entry point
// Wires the line feed, a supervisor and the dispatcher, then runs until
// Ctrl+C or end of input.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use warren_core::application::dispatcher::{Dispatcher, DispatcherEvent, DispatcherHandle};
use warren_core::port::{QueueFeed, UuidProvider, WorkerSupervisor};
use warren_infra_system::{LineFeed, ProcessSupervisor, TaskSupervisor, WorkerCommand};

use crate::settings::Settings;
use crate::worker::build_factory;

/// Prefix of variables always forwarded to worker processes
const FORWARDED_ENV_PREFIX: &str = "WARREN_";

pub struct DispatchOptions {
    pub config_path: Option<PathBuf>,
    /// Run workers as tasks in this process
    pub in_process: bool,
}

pub async fn run(settings: Settings, options: DispatchOptions) -> Result<()> {
    let reader: Box<dyn AsyncBufRead + Send + Unpin> = match &settings.feed.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let feed = Arc::new(LineFeed::new(settings.feed.queue.clone(), reader));
    let supervisor = build_supervisor(&settings, &options)?;

    let mut dispatcher = Dispatcher::new(
        settings.dispatcher.to_config(),
        Arc::clone(&feed) as Arc<dyn QueueFeed>,
        supervisor,
        Arc::new(UuidProvider),
    );
    let handle = dispatcher.handle();
    tokio::spawn(log_events(dispatcher.subscribe(), handle.clone()));

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = ctrl_c_handle.shutdown();
        }
    });

    if settings.feed.exit_on_eof {
        let mut exhausted = feed.exhausted();
        let eof_handle = handle.clone();
        tokio::spawn(async move {
            if exhausted.wait_for(|done| *done).await.is_ok() {
                info!("Input exhausted, shutting down");
                let _ = eof_handle.shutdown();
            }
        });
    }

    info!(
        queue = %settings.feed.queue,
        in_process = options.in_process,
        "Dispatcher ready"
    );
    dispatcher.run().await?;
    info!("Shutdown complete.");
    Ok(())
}

fn build_supervisor(
    settings: &Settings,
    options: &DispatchOptions,
) -> Result<Box<dyn WorkerSupervisor>> {
    if options.in_process {
        let factory = build_factory(&settings.worker);
        return Ok(Box::new(TaskSupervisor::new(Arc::new(factory))));
    }

    let mut command = WorkerCommand::current_exe().context("Cannot locate own executable")?;
    if let Some(path) = &options.config_path {
        command = command.arg("--config").arg(path);
    }
    command = command.arg("worker");

    let mut env_allowlist = settings.worker.env_allowlist.clone();
    env_allowlist.extend(
        std::env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(FORWARDED_ENV_PREFIX)),
    );
    Ok(Box::new(ProcessSupervisor::new(command, env_allowlist)))
}

async fn log_events(mut events: mpsc::UnboundedReceiver<DispatcherEvent>, handle: DispatcherHandle) {
    while let Some(event) = events.recv().await {
        match event {
            DispatcherEvent::Start => debug!("Dispatcher loop started"),
            DispatcherEvent::Patrolling => match handle.snapshot().await {
                Ok(snapshot) => info!(
                    state = %snapshot.state,
                    workers = snapshot.workers,
                    schedulable = snapshot.schedulable,
                    cached = snapshot.cached,
                    consumed = snapshot.stats.consumed,
                    processed = snapshot.stats.processed,
                    "Patrol"
                ),
                Err(e) => debug!(error = %e, "Snapshot unavailable"),
            },
            DispatcherEvent::Consumed {
                worker_id,
                message_id,
            } => debug!(worker_id = %worker_id, message_id = %message_id, "Message dispatched"),
            DispatcherEvent::Processed { worker_id } => {
                debug!(worker_id = %worker_id, "Message processed")
            }
            DispatcherEvent::CustomMessageProcessed { worker_id } => {
                debug!(worker_id = %worker_id, "Custom message processed")
            }
            DispatcherEvent::WorkerExit {
                worker_id,
                pid,
                remaining,
            } => info!(worker_id = %worker_id, pid, remaining, "Worker exited"),
            DispatcherEvent::LimitReached => info!("Worker limit reached, caching messages"),
            DispatcherEvent::Message { worker_id, frame } => info!(
                worker_id = %worker_id,
                kind = frame.kind,
                payload = %frame.payload,
                "Message from worker"
            ),
            DispatcherEvent::Shutdown { stats } => info!(
                consumed = stats.consumed,
                processed = stats.processed,
                peak_workers = stats.peak_num_workers,
                peak_cached = stats.peak_num_cached,
                "Dispatcher shut down"
            ),
            DispatcherEvent::Error { reason, cause } => {
                warn!(reason = %reason, error = %cause, "Dispatcher error")
            }
        }
    }
}
