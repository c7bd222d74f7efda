// src/journal.rs - Append-only measurement rows and raw sample captures
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::history::HistoricalRecord;
use crate::message::EncoderReading;

/// Header of capture files; `parse_csv_line` skips it on replay.
pub const CAPTURE_HEADER: &str = "Total_Time_us,Count";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub enum JournalEntry {
    Measurement(HistoricalRecord),
    Sample(EncoderReading),
}

/// Writes one JSON object per line, readable by `history::parse_records`.
pub struct MeasurementWriter<W> {
    writer: BufWriter<W>,
    written: u64,
}

impl<W: AsyncWrite + Unpin> MeasurementWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            written: 0,
        }
    }

    pub async fn write(&mut self, record: &HistoricalRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.written += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), JournalError> {
        self.writer.flush().await?;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

/// Writes raw samples as `Total_Time_us,Count` lines, readable by `ReplaySource`.
pub struct CaptureWriter<W> {
    writer: BufWriter<W>,
    header_pending: bool,
    written: u64,
}

impl<W: AsyncWrite + Unpin> CaptureWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            header_pending: true,
            written: 0,
        }
    }

    pub async fn write(&mut self, reading: &EncoderReading) -> Result<(), JournalError> {
        if self.header_pending {
            self.writer.write_all(format!("{}\n", CAPTURE_HEADER).as_bytes()).await?;
            self.header_pending = false;
        }
        let line = format!("{},{}\n", reading.device_micros, reading.raw_count);
        self.writer.write_all(line.as_bytes()).await?;
        self.written += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), JournalError> {
        self.writer.flush().await?;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

async fn open_append(path: &Path) -> Result<fs::File, JournalError> {
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    tracing::info!("Appending to {}", path.display());
    Ok(file)
}

/// Session-side end of the journal. A full queue holds the session back
/// rather than losing rows.
#[derive(Debug, Clone)]
pub struct JournalSender {
    entries: mpsc::Sender<JournalEntry>,
    measurements: bool,
    capture: bool,
}

impl JournalSender {
    pub fn wants_measurements(&self) -> bool {
        self.measurements
    }

    pub fn wants_samples(&self) -> bool {
        self.capture
    }

    pub async fn send(&self, entry: JournalEntry) {
        if self.entries.send(entry).await.is_err() {
            tracing::debug!("Journal writer has stopped");
        }
    }
}

/// Start the writer task when `[session]` names a measurements or capture file.
pub fn spawn(config: &SessionConfig) -> Option<(JournalSender, JoinHandle<Result<(), JournalError>>)> {
    let measurements = config.measurements_path.as_ref().map(PathBuf::from);
    let capture = config.capture_path.as_ref().map(PathBuf::from);
    if measurements.is_none() && capture.is_none() {
        return None;
    }
    let (entries, rx) = mpsc::channel(config.queue_depth);
    let sender = JournalSender {
        entries,
        measurements: measurements.is_some(),
        capture: capture.is_some(),
    };
    let task = tokio::spawn(async move {
        let result = run(measurements, capture, rx).await;
        if let Err(e) = &result {
            tracing::error!("Journal writer failed: {}", e);
        }
        result
    });
    Some((sender, task))
}

async fn run(
    measurements: Option<PathBuf>,
    capture: Option<PathBuf>,
    mut rx: mpsc::Receiver<JournalEntry>,
) -> Result<(), JournalError> {
    let mut measurements = match measurements {
        Some(path) => Some(MeasurementWriter::new(open_append(&path).await?)),
        None => None,
    };
    let mut capture = match capture {
        Some(path) => Some(CaptureWriter::new(open_append(&path).await?)),
        None => None,
    };

    while let Some(entry) = rx.recv().await {
        match (entry, measurements.as_mut(), capture.as_mut()) {
            (JournalEntry::Measurement(record), Some(writer), _) => writer.write(&record).await?,
            (JournalEntry::Sample(reading), _, Some(writer)) => writer.write(&reading).await?,
            _ => {}
        }
        // flush whenever the queue drains so files trail the session closely
        if rx.is_empty() {
            if let Some(writer) = measurements.as_mut() {
                writer.flush().await?;
            }
            if let Some(writer) = capture.as_mut() {
                writer.flush().await?;
            }
        }
    }

    if let Some(writer) = measurements.as_mut() {
        writer.flush().await?;
        tracing::info!("Journal wrote {} measurement rows", writer.written());
    }
    if let Some(writer) = capture.as_mut() {
        writer.flush().await?;
        tracing::info!("Journal captured {} samples", writer.written());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::parse_records;
    use crate::protocol::parse_csv_line;

    #[tokio::test]
    async fn test_measurement_lines_parse_back() {
        let mut writer = MeasurementWriter::new(Vec::new());
        for (total, period) in [(1_000_000, 0.4), (1_400_000, 0.41)] {
            writer
                .write(&HistoricalRecord {
                    total_micros: Some(total),
                    period: Some(period),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        writer.flush().await.unwrap();
        assert_eq!(writer.written(), 2);
        let text = String::from_utf8(writer.into_inner()).unwrap();
        let records = parse_records(&text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].total_micros, Some(1_400_000));
        assert_eq!(records[1].period, Some(0.41));
    }

    #[tokio::test]
    async fn test_capture_lines_replay() {
        let mut writer = CaptureWriter::new(Vec::new());
        for (device_micros, raw_count) in [(100, 1), (250, 2), (300, 1)] {
            writer
                .write(&EncoderReading {
                    device_micros,
                    raw_count,
                    drift_micros: None,
                })
                .await
                .unwrap();
        }
        writer.flush().await.unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert!(text.starts_with(CAPTURE_HEADER));
        let readings: Vec<EncoderReading> = text
            .lines()
            .filter_map(|line| parse_csv_line(line).unwrap())
            .collect();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[1].device_micros, 250);
        assert_eq!(readings[1].raw_count, 2);
    }

    #[test]
    fn test_no_paths_no_journal() {
        assert!(spawn(&SessionConfig::default()).is_none());
    }
}
