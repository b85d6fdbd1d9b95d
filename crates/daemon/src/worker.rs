// Worker process entry point
// Started by the dispatcher; frames arrive on stdin and leave on stdout.

use anyhow::Result;
use tracing::{debug, info};

use warren_core::application::worker::{
    custom_handler_fn, message_handler_fn, shutdown_channel, ShutdownSender, WorkerFactory,
};
use warren_core::domain::WorkerId;
use warren_infra_system::{stdio_endpoint, CommandHandler};

use crate::settings::WorkerSettings;

/// Factory for workers configured by `settings`, in-process or not
pub fn build_factory(settings: &WorkerSettings) -> WorkerFactory {
    let factory = WorkerFactory::new()
        .with_exit_mode(settings.exit_mode)
        .with_patrol_period(settings.patrol_period_secs)
        .with_idle_shutdown(settings.idle_shutdown_secs)
        .with_custom_message_handler(custom_handler_fn(|message, ctx| {
            info!(
                worker_id = %ctx.worker_id(),
                kind = message.kind(),
                content = %message.content(),
                "Custom message received"
            );
            Ok(())
        }));

    match settings.command.split_first() {
        Some((program, args)) => {
            let mut handler = CommandHandler::new(program.clone(), args.to_vec())
                .with_env_allowlist(settings.env_allowlist.clone());
            if let Some(limit) = settings.command_timeout() {
                handler = handler.with_timeout(limit);
            }
            factory.with_message_handler(handler)
        }
        None => factory.with_message_handler(message_handler_fn(|message, ctx| {
            info!(
                worker_id = %ctx.worker_id(),
                message_id = %message.message_id,
                queue = %message.queue,
                bytes = message.content.len(),
                "Message received"
            );
            Ok(())
        })),
    }
}

pub async fn run(settings: &WorkerSettings, worker_id: String) -> Result<()> {
    let worker_id = WorkerId::new(worker_id);
    let (endpoint, io) = stdio_endpoint(worker_id.clone());
    let mut worker = build_factory(settings).make_worker(worker_id.clone(), endpoint);

    let (shutdown, token) = shutdown_channel();
    worker.set_shutdown_token(token);
    watch_signals(shutdown)?;

    info!(worker_id = %worker_id, pid = std::process::id(), "Worker process ready");
    let outcome = worker.run().await;
    drop(worker);
    io.finish().await;
    outcome?;
    Ok(())
}

/// SIGTERM asks for a voluntary exit; SIGINT is left to the dispatcher,
/// which shares our process group and drives the shutdown itself
#[cfg(unix)]
fn watch_signals(shutdown: ShutdownSender) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = terminate.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGTERM received, shutting down");
                    shutdown.shutdown();
                }
                received = interrupt.recv() => {
                    if received.is_none() {
                        break;
                    }
                    debug!("Ignoring SIGINT");
                }
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn watch_signals(_shutdown: ShutdownSender) -> Result<()> {
    Ok(())
}
