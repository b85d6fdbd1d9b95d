// Line feed
// Queue feed backed by a line-oriented reader (stdin, a file, a pipe).
//
// A line holding a JSON object with a `content` field is taken as a full
// delivery description; any other line is the message content itself.
// Rejected deliveries with `requeue` are delivered again before new lines.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use warren_core::domain::Headers;
use warren_core::port::{
    Delivery, DeliverySink, DeliveryTag, FeedError, InboundMessage, QueueFeed,
};

type LineReader = Box<dyn AsyncBufRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineRecord {
    #[serde(default)]
    queue: Option<String>,
    #[serde(default)]
    exchange: String,
    #[serde(default)]
    routing_key: Option<String>,
    #[serde(default)]
    headers: Headers,
    content: String,
}

#[derive(Default)]
struct Ledger {
    unacked: HashMap<DeliveryTag, (String, InboundMessage)>,
    requeued: VecDeque<(String, InboundMessage)>,
}

struct Shared {
    flow: watch::Sender<Flow>,
    exhausted: watch::Sender<bool>,
    connected: AtomicBool,
    next_tag: AtomicU64,
    ledger: Mutex<Ledger>,
    requeue_ready: Notify,
}

pub struct LineFeed {
    queue: String,
    reader: Mutex<Option<LineReader>>,
    shared: Arc<Shared>,
}

impl LineFeed {
    /// `queue` names the queue for lines that do not carry their own
    pub fn new(queue: impl Into<String>, reader: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        let (flow, _) = watch::channel(Flow::Running);
        let (exhausted, _) = watch::channel(false);
        Self {
            queue: queue.into(),
            reader: Mutex::new(Some(Box::new(reader))),
            shared: Arc::new(Shared {
                flow,
                exhausted,
                connected: AtomicBool::new(false),
                next_tag: AtomicU64::new(1),
                ledger: Mutex::new(Ledger::default()),
                requeue_ready: Notify::new(),
            }),
        }
    }

    /// Flips to `true` once the reader hit end of input
    pub fn exhausted(&self) -> watch::Receiver<bool> {
        self.shared.exhausted.subscribe()
    }

    /// Deliveries handed out and not yet acked or rejected
    pub async fn unacked(&self) -> usize {
        self.shared.ledger.lock().await.unacked.len()
    }

    fn set_flow(&self, flow: Flow) -> Result<(), FeedError> {
        if !self.is_connected() {
            return Err(FeedError::NotConnected);
        }
        self.shared.flow.send_replace(flow);
        Ok(())
    }
}

fn parse_line(default_queue: &str, line: String) -> (String, InboundMessage) {
    if line.trim_start().starts_with('{') {
        if let Ok(record) = serde_json::from_str::<LineRecord>(&line) {
            let queue = record.queue.unwrap_or_else(|| default_queue.to_string());
            let message = InboundMessage {
                exchange: record.exchange,
                routing_key: record.routing_key.unwrap_or_else(|| queue.clone()),
                headers: record.headers,
                content: record.content.into_bytes(),
            };
            return (queue, message);
        }
    }
    let message = InboundMessage {
        routing_key: default_queue.to_string(),
        content: line.into_bytes(),
        ..InboundMessage::default()
    };
    (default_queue.to_string(), message)
}

/// Returns false once the feed is stopped
async fn wait_until_flowing(flow: &mut watch::Receiver<Flow>) -> bool {
    loop {
        let current = *flow.borrow_and_update();
        match current {
            Flow::Running => return true,
            Flow::Stopped => return false,
            Flow::Paused => {
                if flow.changed().await.is_err() {
                    return false;
                }
            }
        }
    }
}

async fn wait_until_stopped(flow: &mut watch::Receiver<Flow>) {
    while *flow.borrow_and_update() != Flow::Stopped {
        if flow.changed().await.is_err() {
            return;
        }
    }
}

async fn pump(default_queue: String, reader: LineReader, shared: Arc<Shared>, sink: DeliverySink) {
    let mut lines = reader.lines();
    let mut flow = shared.flow.subscribe();
    let mut stop = shared.flow.subscribe();
    let mut at_eof = false;

    while wait_until_flowing(&mut flow).await {
        let requeued = shared.ledger.lock().await.requeued.pop_front();
        let (queue, message) = match requeued {
            Some(entry) => entry,
            None if at_eof => {
                tokio::select! {
                    _ = shared.requeue_ready.notified() => continue,
                    _ = wait_until_stopped(&mut stop) => break,
                }
            }
            None => {
                let line = tokio::select! {
                    line = lines.next_line() => line,
                    _ = wait_until_stopped(&mut stop) => break,
                };
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => parse_line(&default_queue, line),
                    Ok(None) => {
                        info!("Line feed reached end of input");
                        at_eof = true;
                        shared.exhausted.send_replace(true);
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Line feed read failed");
                        at_eof = true;
                        shared.exhausted.send_replace(true);
                        continue;
                    }
                }
            }
        };

        let tag = shared.next_tag.fetch_add(1, Ordering::Relaxed);
        shared
            .ledger
            .lock()
            .await
            .unacked
            .insert(tag, (queue.clone(), message.clone()));
        let delivery = Delivery {
            queue,
            tag,
            message,
        };
        let sent = tokio::select! {
            sent = sink.send(delivery) => sent.is_ok(),
            _ = wait_until_stopped(&mut stop) => false,
        };
        if !sent {
            // Never reached the consumer; keep it queued rather than unacked
            let mut ledger = shared.ledger.lock().await;
            if let Some(entry) = ledger.unacked.remove(&tag) {
                ledger.requeued.push_front(entry);
            }
            break;
        }
        debug!(tag, "Line delivered");
    }
    debug!("Line feed pump stopped");
}

#[async_trait]
impl QueueFeed for LineFeed {
    async fn connect(&self, sink: DeliverySink) -> Result<(), FeedError> {
        let reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| FeedError::Connect("input already consumed".to_string()))?;
        self.shared.flow.send_replace(Flow::Running);
        self.shared.connected.store(true, Ordering::SeqCst);
        info!(queue = %self.queue, "Line feed connected");
        tokio::spawn(pump(
            self.queue.clone(),
            reader,
            Arc::clone(&self.shared),
            sink,
        ));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), FeedError> {
        self.shared.flow.send_replace(Flow::Stopped);
        self.shared.connected.store(false, Ordering::SeqCst);
        info!(queue = %self.queue, "Line feed disconnected");
        Ok(())
    }

    async fn pause(&self) -> Result<(), FeedError> {
        self.set_flow(Flow::Paused)
    }

    async fn resume(&self) -> Result<(), FeedError> {
        self.set_flow(Flow::Running)
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), FeedError> {
        self.shared
            .ledger
            .lock()
            .await
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| FeedError::Protocol(format!("unknown delivery tag {}", tag)))
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), FeedError> {
        let mut ledger = self.shared.ledger.lock().await;
        let entry = ledger
            .unacked
            .remove(&tag)
            .ok_or_else(|| FeedError::Protocol(format!("unknown delivery tag {}", tag)))?;
        if requeue {
            ledger.requeued.push_back(entry);
            self.shared.requeue_ready.notify_one();
        } else {
            debug!(tag, "Delivery rejected and dropped");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn feed(input: &'static str) -> LineFeed {
        LineFeed::new("jobs", BufReader::new(input.as_bytes()))
    }

    async fn next(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no delivery")
            .expect("feed closed")
    }

    #[tokio::test]
    async fn test_plain_and_json_lines() {
        let feed = feed(
            "hello\n\n{\"queue\":\"mail\",\"routingKey\":\"mail.send\",\"headers\":{\"x\":1},\"content\":\"hi\"}\n",
        );
        let (sink, mut rx) = mpsc::channel(8);
        feed.connect(sink).await.unwrap();
        assert!(feed.is_connected());

        let first = next(&mut rx).await;
        assert_eq!(first.queue, "jobs");
        assert_eq!(first.tag, 1);
        assert_eq!(first.message.content, b"hello".to_vec());
        assert_eq!(first.message.routing_key, "jobs");

        let second = next(&mut rx).await;
        assert_eq!(second.queue, "mail");
        assert_eq!(second.message.routing_key, "mail.send");
        assert_eq!(second.message.headers["x"], serde_json::json!(1));
        assert_eq!(second.message.content, b"hi".to_vec());

        let mut exhausted = feed.exhausted();
        exhausted.wait_for(|done| *done).await.unwrap();
        assert_eq!(feed.unacked().await, 2);

        feed.ack(1).await.unwrap();
        assert!(matches!(feed.ack(1).await, Err(FeedError::Protocol(_))));
        assert_eq!(feed.unacked().await, 1);
    }

    #[tokio::test]
    async fn test_requeued_delivery_comes_back_with_new_tag() {
        let feed = feed("only\n");
        let (sink, mut rx) = mpsc::channel(8);
        feed.connect(sink).await.unwrap();

        let first = next(&mut rx).await;
        feed.reject(first.tag, true).await.unwrap();
        let again = next(&mut rx).await;
        assert_eq!(again.message, first.message);
        assert_ne!(again.tag, first.tag);

        feed.reject(again.tag, false).await.unwrap();
        assert_eq!(feed.unacked().await, 0);
    }

    #[tokio::test]
    async fn test_pause_holds_back_deliveries() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let feed = LineFeed::new("jobs", BufReader::new(reader));
        assert_eq!(feed.pause().await, Err(FeedError::NotConnected));

        let (sink, mut rx) = mpsc::channel(8);
        feed.connect(sink).await.unwrap();
        writer.write_all(b"one\n").await.unwrap();
        assert_eq!(next(&mut rx).await.tag, 1);

        feed.pause().await.unwrap();
        writer.write_all(b"two\n").await.unwrap();
        // At most the line already being read slips through
        tokio::time::sleep(Duration::from_millis(50)).await;
        let slipped = rx.try_recv().is_ok();
        writer.write_all(b"three\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        feed.resume().await.unwrap();
        let resumed = next(&mut rx).await;
        let expected: &[u8] = if slipped { b"three" } else { b"two" };
        assert_eq!(resumed.message.content, expected.to_vec());
    }

    #[tokio::test]
    async fn test_disconnect_stops_and_reconnect_is_refused() {
        let (_writer, reader) = tokio::io::duplex(64);
        let feed = LineFeed::new("jobs", BufReader::new(reader));
        let (sink, mut rx) = mpsc::channel(8);
        feed.connect(sink).await.unwrap();

        feed.disconnect().await.unwrap();
        assert!(!feed.is_connected());
        // Pump drops the sink once it sees the stop
        assert!(timeout(Duration::from_secs(5), rx.recv()).await.unwrap().is_none());

        let (sink, _rx) = mpsc::channel(8);
        assert!(matches!(feed.connect(sink).await, Err(FeedError::Connect(_))));
    }
}
