// Worker-side transport over a byte stream (the child's stdin/stdout)

use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use warren_core::domain::WorkerId;
use warren_core::port::{WorkerEndpoint, WorkerOutbox};

use crate::codec::{read_frames, write_frames};

/// Background pumps behind a framed endpoint
pub struct FramedIo {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl FramedIo {
    /// Wait for pending outbound frames to be written, then stop reading
    ///
    /// Call after the worker (and with it the outbox) has been dropped.
    pub async fn finish(self) {
        if let Err(e) = self.writer.await {
            warn!(error = %e, "Frame writer task failed");
        }
        self.reader.abort();
    }
}

/// Build a worker endpoint on top of an arbitrary reader/writer pair
pub fn framed_endpoint<R, W>(worker_id: WorkerId, reader: R, writer: W) -> (WorkerEndpoint, FramedIo)
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let reader = tokio::spawn(async move {
        let outcome = read_frames(reader, |frame| inbound_tx.send(frame).is_ok()).await;
        if let Err(e) = outcome {
            warn!(error = %e, "Reading frames from dispatcher failed");
        }
    });
    let writer = tokio::spawn(async move {
        if let Err(e) = write_frames(writer, outbound_rx).await {
            warn!(error = %e, "Writing frames to dispatcher failed");
        }
    });

    let endpoint = WorkerEndpoint {
        inbound: inbound_rx,
        outbox: WorkerOutbox::new(worker_id, outbound_tx),
    };
    (endpoint, FramedIo { reader, writer })
}

/// Endpoint for a worker launched by the process supervisor
pub fn stdio_endpoint(worker_id: WorkerId) -> (WorkerEndpoint, FramedIo) {
    framed_endpoint(
        worker_id,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use warren_core::domain::{Frame, MessageType};

    #[tokio::test]
    async fn test_endpoint_reads_and_writes_lines() {
        let (dispatcher_side, worker_side) = tokio::io::duplex(4096);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let (mut endpoint, io) =
            framed_endpoint(WorkerId::new("w1"), BufReader::new(worker_read), worker_write);

        let (dispatcher_read, mut dispatcher_write) = tokio::io::split(dispatcher_side);
        dispatcher_write
            .write_all(b"{\"type\":3,\"payload\":\"\"}\n")
            .await
            .unwrap();
        let frame = endpoint.inbound.recv().await.unwrap();
        assert_eq!(frame.message_type(), Some(MessageType::LastMsg));

        endpoint
            .outbox
            .send(Frame::signal(MessageType::IQuit))
            .unwrap();
        drop(endpoint);
        io.finish().await;

        let mut lines = BufReader::new(dispatcher_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"type":5,"payload":""}"#);
    }
}
