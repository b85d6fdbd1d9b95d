// Event fan-out
//
// Subscribers get an unbounded receiver; closed subscribers are dropped
// on the next emit.

use tokio::sync::mpsc;

#[derive(Debug)]
pub struct EventBus<E> {
    subscribers: Vec<mpsc::UnboundedSender<E>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Forward events into an existing channel
    pub fn attach(&mut self, tx: mpsc::UnboundedSender<E>) {
        self.subscribers.push(tx);
    }

    pub fn emit(&mut self, event: E) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
