use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::common::codec;
use crate::common::types::Record;

/// One unit read from the input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFrame {
    /// A complete line without its terminator.
    Line(Vec<u8>),
    /// A line longer than the limit; its bytes were dropped.
    Oversized { length: usize },
}

/// Reads newline-delimited frames, never buffering more than `max_len`
/// bytes of a single line.
pub struct LineReader<R> {
    inner: R,
    max_len: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_len: usize) -> Self {
        Self { inner, max_len }
    }

    /// `Ok(None)` at end of stream.
    pub async fn next_frame(&mut self) -> io::Result<Option<InputFrame>> {
        let mut line = Vec::new();
        let mut oversized = false;
        let mut length = 0usize;

        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if length == 0 {
                    return Ok(None);
                }
                break;
            }

            let (used, complete) = match available.iter().position(|byte| *byte == b'\n') {
                Some(index) => (index + 1, true),
                None => (available.len(), false),
            };
            let content = if complete { used - 1 } else { used };
            length += used;

            if !oversized {
                if line.len() + content > self.max_len {
                    oversized = true;
                    line.clear();
                } else {
                    line.extend_from_slice(&available[..content]);
                }
            }
            self.inner.consume(used);

            if complete {
                break;
            }
        }

        if oversized {
            return Ok(Some(InputFrame::Oversized { length }));
        }
        if line.ends_with(b"\r") {
            line.pop();
        }
        Ok(Some(InputFrame::Line(line)))
    }
}

/// Reads `input` on its own task and forwards frames; the channel closes at
/// end of stream or on a read error.
pub fn spawn_reader<R>(input: R, max_len: usize) -> mpsc::Receiver<InputFrame>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (frame_tx, frame_rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut reader = LineReader::new(BufReader::new(input), max_len);
        loop {
            match reader.next_frame().await {
                Ok(Some(frame)) => {
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    log::debug!("Input stream reached end of file");
                    break;
                }
                Err(err) => {
                    log::error!("Failed to read input stream: {err}");
                    break;
                }
            }
        }
    });
    frame_rx
}

/// Writes one encoded record plus newline and flushes. Records that cannot
/// be encoded are logged and skipped.
pub async fn write_record<W: AsyncWrite + Unpin>(
    output: &mut W,
    record: &Record,
) -> io::Result<()> {
    let mut line = match codec::encode(record) {
        Ok(line) => line,
        Err(err) => {
            log::warn!(
                "Skipping record {} that cannot be encoded: {err}",
                record.id.as_deref().unwrap_or("?")
            );
            return Ok(());
        }
    };
    line.push('\n');
    output.write_all(line.as_bytes()).await?;
    output.flush().await
}
