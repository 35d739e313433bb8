use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::sleep;

use crate::common::events::Outcome;

use super::engine::MessageEngine;
use super::transport::{self, InputFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Commands are processed and the log tail is streamed.
    Active,
    /// The codec is unusable: input is drained and dropped, nothing is emitted.
    Passive,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("output stream failed: {0}")]
    Output(#[from] io::Error),
}

enum Wake {
    /// A frame, or `None` once the input stream has ended.
    Input(Option<InputFrame>),
    Poll,
}

/// One client connection: input commands in, log records out.
pub struct Session<W> {
    engine: MessageEngine,
    output: W,
    poll_interval: Duration,
    mode: SessionMode,
}

impl<W: AsyncWrite + Unpin> Session<W> {
    pub fn new(
        engine: MessageEngine,
        output: W,
        poll_interval: Duration,
        mode: SessionMode,
    ) -> Self {
        Self {
            engine,
            output,
            poll_interval,
            mode,
        }
    }

    /// Waits up to `poll_interval` for a line; on timeout the log tail is
    /// flushed instead. After the input stream ends only the polling
    /// continues. Returns once writing to the output fails.
    pub async fn run<R>(mut self, input: R, max_line_bytes: usize) -> SessionError
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut frames = Some(transport::spawn_reader(input, max_line_bytes));
        log::info!("Session loop started ({:?} mode)", self.mode);

        loop {
            let wake = match frames.as_mut() {
                Some(receiver) => tokio::select! {
                    frame = receiver.recv() => Wake::Input(frame),
                    _ = sleep(self.poll_interval) => Wake::Poll,
                },
                None => {
                    sleep(self.poll_interval).await;
                    Wake::Poll
                }
            };

            let result = match wake {
                Wake::Input(Some(frame)) => self.handle_frame(frame).await,
                Wake::Input(None) => {
                    log::info!("Input stream closed; still streaming new log records");
                    frames = None;
                    self.flush_tail().await
                }
                Wake::Poll => self.flush_tail().await,
            };
            if let Err(err) = result {
                return err;
            }
        }
    }

    async fn handle_frame(&mut self, frame: InputFrame) -> Result<(), SessionError> {
        if self.mode == SessionMode::Passive {
            return Ok(());
        }

        let line = match frame {
            InputFrame::Line(line) => line,
            InputFrame::Oversized { length } => {
                log::warn!("Discarding oversized input line ({length} bytes)");
                return Ok(());
            }
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }

        match self.engine.handle_line(&line) {
            // Covers the new record and anything else pending.
            Outcome::Inserted(_) => self.flush_tail().await,
            Outcome::Updated(record) => {
                transport::write_record(&mut self.output, &record).await?;
                Ok(())
            }
            Outcome::Discarded(_) => Ok(()),
        }
    }

    async fn flush_tail(&mut self) -> Result<(), SessionError> {
        if self.mode == SessionMode::Passive {
            return Ok(());
        }

        let records = match self.engine.tail() {
            Ok(records) => records,
            Err(err) => {
                log::warn!("Failed to read new log records: {err}");
                return Ok(());
            }
        };
        for record in &records {
            transport::write_record(&mut self.output, record).await?;
        }
        Ok(())
    }
}
