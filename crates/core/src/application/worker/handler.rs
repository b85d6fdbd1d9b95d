// Message handler traits

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::context::WorkerContext;
use crate::domain::{CustomMessage, QueueMessage};

/// Processes queue messages on a worker
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: QueueMessage,
        ctx: &mut WorkerContext<'_>,
    ) -> anyhow::Result<()>;
}

/// Processes custom messages sent by the dispatcher
#[async_trait]
pub trait CustomMessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: CustomMessage,
        ctx: &mut WorkerContext<'_>,
    ) -> anyhow::Result<()>;
}

/// Returns how long to hold a message before handling it; `None` runs it now
pub type DelayCondition = Arc<dyn Fn(&QueueMessage) -> Option<Duration> + Send + Sync>;

/// Adapts a synchronous closure into a [`MessageHandler`]
pub struct FnMessageHandler<F>(F);

pub fn message_handler_fn<F>(f: F) -> FnMessageHandler<F>
where
    F: Fn(&QueueMessage, &mut WorkerContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    FnMessageHandler(f)
}

#[async_trait]
impl<F> MessageHandler for FnMessageHandler<F>
where
    F: Fn(&QueueMessage, &mut WorkerContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(
        &self,
        message: QueueMessage,
        ctx: &mut WorkerContext<'_>,
    ) -> anyhow::Result<()> {
        (self.0)(&message, ctx)
    }
}

/// Adapts a synchronous closure into a [`CustomMessageHandler`]
pub struct FnCustomHandler<F>(F);

pub fn custom_handler_fn<F>(f: F) -> FnCustomHandler<F>
where
    F: Fn(&CustomMessage, &mut WorkerContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    FnCustomHandler(f)
}

#[async_trait]
impl<F> CustomMessageHandler for FnCustomHandler<F>
where
    F: Fn(&CustomMessage, &mut WorkerContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(
        &self,
        message: CustomMessage,
        ctx: &mut WorkerContext<'_>,
    ) -> anyhow::Result<()> {
        (self.0)(&message, ctx)
    }
}
