// Frame codec: one JSON object per line
//
// Used on both ends of a process pipe. Lines that fail to decode are
// logged and skipped; the stream itself keeps going.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use warren_core::domain::Frame;
use warren_core::port::TransportError;

pub fn encode_frame(frame: &Frame) -> Result<String, TransportError> {
    let mut line =
        serde_json::to_string(frame).map_err(|e| TransportError::Encode(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

pub fn decode_frame(line: &str) -> Result<Frame, TransportError> {
    serde_json::from_str(line.trim_end()).map_err(|e| TransportError::Decode(e.to_string()))
}

/// Write frames from `rx` until every sender is gone
///
/// Each frame is flushed on its own so the peer sees it without delay.
pub async fn write_frames<W, T>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<T>,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Into<Frame>,
{
    while let Some(frame) = rx.recv().await {
        let line = encode_frame(&frame.into())?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
    }
    debug!("Frame writer finished");
    Ok(())
}

/// Read frames until EOF or until `deliver` refuses one
pub async fn read_frames<R, F>(reader: R, mut deliver: F) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(Frame) -> bool,
{
    let mut lines = reader.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?
    {
        if line.trim().is_empty() {
            continue;
        }
        match decode_frame(&line) {
            Ok(frame) => {
                if !deliver(frame) {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Skipping undecodable frame"),
        }
    }
    debug!("Frame reader finished");
    Ok(())
}
