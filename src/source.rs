// src/source.rs - Asynchronous sample sources feeding a session
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

use crate::config::SourceConfig;
use crate::message::{InboundMessage, MessageError};
use crate::protocol::{FRAME_LEN, FrameDecoder, ProtocolError, parse_csv_line};
use crate::sim::Resonator;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Too many consecutive errors ({0})")]
    TooManyErrors(u32),
}

/// Anything that produces inbound messages. `Ok(None)` means the source is exhausted.
#[async_trait]
pub trait SampleSource: Send {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, SourceError>;
    fn describe(&self) -> String;
}

/// Opens the configured device port.
pub fn open_serial(config: &SourceConfig) -> Result<FrameSource<serial2_tokio::SerialPort>, SourceError> {
    let port = serial2_tokio::SerialPort::open(&config.serial, config.baud)?;
    tracing::info!("Opened {} at {} baud", config.serial, config.baud);
    Ok(FrameSource::new(port, &config.serial, config.max_consecutive_errors))
}

/// Decodes encoder step frames from a byte stream.
pub struct FrameSource<R> {
    reader: R,
    name: String,
    decoder: FrameDecoder,
    consecutive_errors: u32,
    max_consecutive_errors: u32,
}

impl<R: AsyncRead + Unpin + Send> FrameSource<R> {
    pub fn new(reader: R, name: &str, max_consecutive_errors: u32) -> Self {
        Self {
            reader,
            name: name.to_string(),
            decoder: FrameDecoder::new(),
            consecutive_errors: 0,
            max_consecutive_errors,
        }
    }

    fn record_error(&mut self) -> Result<(), SourceError> {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.max_consecutive_errors {
            return Err(SourceError::TooManyErrors(self.consecutive_errors));
        }
        Ok(())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> SampleSource for FrameSource<R> {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, SourceError> {
        let mut frame = [0u8; FRAME_LEN];
        loop {
            match self.reader.read_exact(&mut frame).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::info!("{} closed", self.name);
                    return Ok(None);
                }
                Err(e) => {
                    tracing::error!("Error reading from {}: {}", self.name, e);
                    self.record_error()?;
                    continue;
                }
            }

            match self.decoder.decode(&frame) {
                Ok(reading) => {
                    self.consecutive_errors = 0;
                    return Ok(Some(InboundMessage::Encoder(reading)));
                }
                Err(ProtocolError::DeviceOverflow) => {
                    tracing::warn!("Device buffer overflow reported by {}", self.name);
                }
                Err(e) => {
                    tracing::warn!("{}: {} (frame {:02x?})", self.name, e, frame);
                    self.record_error()?;
                }
            }
        }
    }

    fn describe(&self) -> String {
        format!("frames from {}", self.name)
    }
}

/// Line-oriented replay of recorder CSV captures or JSON messages.
pub struct ReplaySource<R> {
    reader: R,
    name: String,
    line: String,
    lines_read: u64,
}

impl<R: AsyncBufRead + Unpin + Send> ReplaySource<R> {
    pub fn new(reader: R, name: &str) -> Self {
        Self {
            reader,
            name: name.to_string(),
            line: String::new(),
            lines_read: 0,
        }
    }

    fn parse(&self, line: &str) -> Result<Option<InboundMessage>, SourceError> {
        if line.starts_with('{') {
            return Ok(Some(InboundMessage::from_json(line)?));
        }
        Ok(parse_csv_line(line)?.map(InboundMessage::Encoder))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> SampleSource for ReplaySource<R> {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, SourceError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                tracing::info!("Replay of {} finished after {} lines", self.name, self.lines_read);
                return Ok(None);
            }
            self.lines_read += 1;
            let line = self.line.trim();
            match self.parse(line) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Skipping line {} of {}: {}", self.lines_read, self.name, e);
                }
            }
        }
    }

    fn describe(&self) -> String {
        format!("replay of {}", self.name)
    }
}

/// Drives a `Resonator`, optionally paced at the simulated device clock.
pub struct SimulatedSource {
    resonator: Resonator,
    remaining: Option<u64>,
    paced: bool,
    last_micros: Option<u64>,
}

impl SimulatedSource {
    pub fn new(resonator: Resonator) -> Self {
        Self {
            resonator,
            remaining: None,
            paced: false,
            last_micros: None,
        }
    }

    /// Stop after `count` messages.
    pub fn limit(mut self, count: u64) -> Self {
        self.remaining = Some(count);
        self
    }

    /// Sleep between messages to emulate a live device.
    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }
}

#[async_trait]
impl SampleSource for SimulatedSource {
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, SourceError> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }
        let message = self.resonator.next_message();
        if let InboundMessage::Encoder(reading) = &message {
            let last = self.last_micros.replace(reading.device_micros);
            if let (true, Some(last)) = (self.paced, last) {
                let wait = reading.device_micros.saturating_sub(last);
                tokio::time::sleep(Duration::from_micros(wait)).await;
            }
        }
        Ok(Some(message))
    }

    fn describe(&self) -> String {
        let config = self.resonator.config();
        format!(
            "simulated resonator ({:.0} deg, {:.3}s, seed {})",
            config.amplitude, config.period_secs, config.seed
        )
    }
}
