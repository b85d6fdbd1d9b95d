// Queue Feed Port
// Source of broker deliveries (AMQP consumer or anything shaped like one).

use crate::domain::Headers;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Broker-assigned acknowledgement handle
pub type DeliveryTag = u64;

/// Message body plus the broker metadata the dispatcher forwards
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub content: Vec<u8>,
}

/// One delivery from the feed
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub queue: String,
    pub tag: DeliveryTag,
    pub message: InboundMessage,
}

/// Where a connected feed pushes its deliveries
pub type DeliverySink = mpsc::Sender<Delivery>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Feed is not connected")]
    NotConnected,

    #[error("Feed IO error: {0}")]
    Io(String),

    #[error("Feed protocol error: {0}")]
    Protocol(String),
}

/// Queue Feed trait
///
/// Flow control is coarse: `pause` stops deliveries, `resume` restarts them.
#[async_trait]
pub trait QueueFeed: Send + Sync {
    /// Start consuming; deliveries are pushed into `sink`
    async fn connect(&self, sink: DeliverySink) -> Result<(), FeedError>;

    async fn disconnect(&self) -> Result<(), FeedError>;

    async fn pause(&self) -> Result<(), FeedError>;

    async fn resume(&self) -> Result<(), FeedError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), FeedError>;

    /// Negative acknowledgement; `requeue` returns the message to the queue
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), FeedError>;

    fn is_connected(&self) -> bool;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Recorded feed interaction
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum FeedCall {
        Connect,
        Disconnect,
        Pause,
        Resume,
        Ack(DeliveryTag),
        Reject(DeliveryTag, bool),
    }

    #[derive(Default)]
    struct Inner {
        calls: Vec<FeedCall>,
        sink: Option<DeliverySink>,
        connected: bool,
        fail_connect: bool,
        fail_pause: bool,
        next_tag: DeliveryTag,
    }

    /// In-memory feed that records every call
    #[derive(Clone, Default)]
    pub struct MockFeed {
        inner: Arc<Mutex<Inner>>,
    }

    impl MockFeed {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_connect(&self) {
            self.inner.lock().unwrap().fail_connect = true;
        }

        pub fn fail_pause(&self) {
            self.inner.lock().unwrap().fail_pause = true;
        }

        pub fn calls(&self) -> Vec<FeedCall> {
            self.inner.lock().unwrap().calls.clone()
        }

        pub fn count(&self, call: &FeedCall) -> usize {
            self.calls().iter().filter(|c| *c == call).count()
        }

        pub fn acked(&self) -> Vec<DeliveryTag> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    FeedCall::Ack(tag) => Some(tag),
                    _ => None,
                })
                .collect()
        }

        /// Push a message through the connected sink, as the broker would
        pub async fn publish(
            &self,
            queue: &str,
            content: impl Into<Vec<u8>>,
        ) -> Result<DeliveryTag, FeedError> {
            let (sink, tag) = {
                let mut inner = self.inner.lock().unwrap();
                let sink = inner.sink.clone().ok_or(FeedError::NotConnected)?;
                inner.next_tag += 1;
                (sink, inner.next_tag)
            };
            sink.send(delivery(tag, queue, content))
                .await
                .map_err(|_| FeedError::NotConnected)?;
            Ok(tag)
        }
    }

    /// Build a delivery without going through a feed
    pub fn delivery(tag: DeliveryTag, queue: &str, content: impl Into<Vec<u8>>) -> Delivery {
        Delivery {
            queue: queue.to_string(),
            tag,
            message: InboundMessage {
                exchange: "amq.direct".to_string(),
                routing_key: queue.to_string(),
                headers: Headers::new(),
                content: content.into(),
            },
        }
    }

    #[async_trait]
    impl QueueFeed for MockFeed {
        async fn connect(&self, sink: DeliverySink) -> Result<(), FeedError> {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(FeedCall::Connect);
            if inner.fail_connect {
                return Err(FeedError::Connect("mock connect failure".to_string()));
            }
            inner.sink = Some(sink);
            inner.connected = true;
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), FeedError> {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(FeedCall::Disconnect);
            inner.sink = None;
            inner.connected = false;
            Ok(())
        }

        async fn pause(&self) -> Result<(), FeedError> {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(FeedCall::Pause);
            if inner.fail_pause {
                return Err(FeedError::Io("mock pause failure".to_string()));
            }
            Ok(())
        }

        async fn resume(&self) -> Result<(), FeedError> {
            self.inner.lock().unwrap().calls.push(FeedCall::Resume);
            Ok(())
        }

        async fn ack(&self, tag: DeliveryTag) -> Result<(), FeedError> {
            self.inner.lock().unwrap().calls.push(FeedCall::Ack(tag));
            Ok(())
        }

        async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), FeedError> {
            self.inner
                .lock()
                .unwrap()
                .calls
                .push(FeedCall::Reject(tag, requeue));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.inner.lock().unwrap().connected
        }
    }
}
