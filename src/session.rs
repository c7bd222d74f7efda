// src/session.rs - Single-writer session task serialising samples, controls and render ticks
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{AveragingConfig, Config};
use crate::engine::averaging::{AveragedReadings, AveragedSeries, AveragingEngine};
use crate::engine::history::SeriesData;
use crate::engine::{Readings, Recorder};
use crate::history::{HistoricalRecord, LoadReport};
use crate::journal::{self, JournalEntry, JournalError, JournalSender};
use crate::message::InboundMessage;
use crate::source::{SampleSource, SourceError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session task is no longer running")]
    Closed,
    #[error("Session task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),
}

/// A request sent from a handle to the session task.
#[derive(Debug)]
pub enum SessionRequest {
    Tare {
        respond_to: oneshot::Sender<bool>,
    },
    Reset {
        respond_to: oneshot::Sender<()>,
    },
    /// Change the averaging settings; `window` keeps the current one when `None`.
    SetAveraging {
        enabled: bool,
        window: Option<usize>,
        respond_to: oneshot::Sender<AveragingConfig>,
    },
    LoadHistory {
        records: Vec<HistoricalRecord>,
        respond_to: oneshot::Sender<LoadReport>,
    },
    Snapshot {
        respond_to: oneshot::Sender<Snapshot>,
    },
    Series {
        respond_to: oneshot::Sender<SeriesSnapshot>,
    },
    Shutdown,
}

/// Consistent view of the session published after every render pass and control command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub sequence: u64,
    pub ingested: u64,
    pub readings: Readings,
    pub averaged: AveragedReadings,
    pub averaging: AveragingConfig,
    pub lengths: BTreeMap<String, usize>,
    pub source_finished: bool,
}

/// Every bounded series, raw and averaged, for plotting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeriesSnapshot {
    pub raw: BTreeMap<String, SeriesData>,
    pub averaged: AveragedSeries,
    pub channels: BTreeMap<String, BTreeMap<String, SeriesData>>,
}

struct Session {
    recorder: Recorder,
    averaging: AveragingEngine,
    settings: AveragingConfig,
    ingested: u64,
    sequence: u64,
    source_finished: bool,
    snapshots: watch::Sender<Snapshot>,
    journal: Option<JournalSender>,
}

impl Session {
    fn refresh(&mut self) {
        self.averaging.update(self.recorder.history(), &self.settings);
        self.sequence += 1;
        let snapshot = self.snapshot();
        self.snapshots.send_replace(snapshot);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            sequence: self.sequence,
            ingested: self.ingested,
            readings: self.recorder.readings(),
            averaged: self.averaging.readings(),
            averaging: self.settings.clone(),
            lengths: self.recorder.lengths(),
            source_finished: self.source_finished,
        }
    }

    fn series(&self) -> SeriesSnapshot {
        SeriesSnapshot {
            raw: self
                .recorder
                .series()
                .into_iter()
                .map(|(name, data)| (name.to_string(), data))
                .collect(),
            averaged: self.averaging.series(),
            channels: self.recorder.channels().series(),
        }
    }

    async fn ingest(&mut self, message: InboundMessage) {
        let point = self.recorder.ingest_message(&message);
        let InboundMessage::Encoder(reading) = message else {
            return;
        };
        self.ingested += 1;
        let Some(journal) = &self.journal else {
            return;
        };
        if journal.wants_samples() {
            journal.send(JournalEntry::Sample(reading)).await;
        }
        if journal.wants_measurements() && point.is_some_and(|p| p.half_period.is_some()) {
            if let Some(record) = self.recorder.measurement(chrono::Utc::now()) {
                journal.send(JournalEntry::Measurement(record)).await;
            }
        }
    }

    /// Returns false once the session should stop.
    fn handle(&mut self, request: SessionRequest) -> bool {
        match request {
            SessionRequest::Tare { respond_to } => {
                let tared = self.recorder.tare();
                self.refresh();
                let _ = respond_to.send(tared);
            }
            SessionRequest::Reset { respond_to } => {
                self.recorder.reset();
                self.refresh();
                let _ = respond_to.send(());
            }
            SessionRequest::SetAveraging {
                enabled,
                window,
                respond_to,
            } => {
                self.settings.enabled = enabled;
                if let Some(window) = window {
                    self.settings.window = window.max(1);
                }
                tracing::info!(
                    "Averaging {} (window {})",
                    if enabled { "enabled" } else { "disabled" },
                    self.settings.window
                );
                self.refresh();
                let _ = respond_to.send(self.settings.clone());
            }
            SessionRequest::LoadHistory { records, respond_to } => {
                let report = self.recorder.load_history(&records);
                self.refresh();
                let _ = respond_to.send(report);
            }
            SessionRequest::Snapshot { respond_to } => {
                self.averaging.update(self.recorder.history(), &self.settings);
                let _ = respond_to.send(self.snapshot());
            }
            SessionRequest::Series { respond_to } => {
                self.averaging.update(self.recorder.history(), &self.settings);
                let _ = respond_to.send(self.series());
            }
            SessionRequest::Shutdown => {
                tracing::info!("Session shutting down after {} samples", self.ingested);
                return false;
            }
        }
        true
    }
}

/// Client side of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    requests: mpsc::Sender<SessionRequest>,
    snapshots: watch::Receiver<Snapshot>,
    engine: JoinHandle<()>,
    pump: JoinHandle<Result<(), SourceError>>,
    journal: Option<JoinHandle<Result<(), JournalError>>>,
}

/// Start the source pump and the engine task.
pub fn spawn(config: &Config, mut source: Box<dyn SampleSource>) -> SessionHandle {
    let (message_tx, mut message_rx) = mpsc::channel::<InboundMessage>(config.session.queue_depth);
    let (request_tx, mut request_rx) = mpsc::channel::<SessionRequest>(16);
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot {
        averaging: config.averaging.clone(),
        ..Snapshot::default()
    });

    tracing::info!("Starting session on {}", source.describe());
    let pump = tokio::spawn(async move {
        loop {
            match source.next_message().await {
                Ok(Some(message)) => {
                    if message_tx.send(message).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::error!("Source {} failed: {}", source.describe(), e);
                    return Err(e);
                }
            }
        }
    });

    let (journal_sender, journal_task) = journal::spawn(&config.session).unzip();

    let mut session = Session {
        recorder: Recorder::new(config.engine.clone()),
        averaging: AveragingEngine::new(&config.averaging),
        settings: config.averaging.clone(),
        ingested: 0,
        sequence: 0,
        source_finished: false,
        snapshots: snapshot_tx,
        journal: journal_sender,
    };
    let render_interval = tokio::time::Duration::from_millis(config.session.render_interval_ms);

    let engine = tokio::spawn(async move {
        let mut interval = tokio::time::interval(render_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                request = request_rx.recv() => {
                    match request {
                        Some(request) => {
                            if !session.handle(request) {
                                break;
                            }
                        }
                        None => {
                            tracing::debug!("All session handles dropped");
                            break;
                        }
                    }
                }
                message = message_rx.recv(), if !session.source_finished => {
                    match message {
                        Some(message) => session.ingest(message).await,
                        None => {
                            tracing::info!("Source finished after {} samples", session.ingested);
                            session.source_finished = true;
                            session.refresh();
                        }
                    }
                }
                _ = interval.tick() => {
                    session.refresh();
                }
            }
        }
    });

    SessionHandle {
        requests: request_tx,
        snapshots: snapshot_rx,
        engine,
        pump,
        journal: journal_task,
    }
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionRequest,
    ) -> Result<T, SessionError> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(build(respond_to))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }

    /// Returns false when there was nothing to tare.
    pub async fn tare(&self) -> Result<bool, SessionError> {
        self.request(|respond_to| SessionRequest::Tare { respond_to }).await
    }

    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(|respond_to| SessionRequest::Reset { respond_to }).await
    }

    pub async fn set_averaging(&self, enabled: bool, window: Option<usize>) -> Result<AveragingConfig, SessionError> {
        self.request(|respond_to| SessionRequest::SetAveraging {
            enabled,
            window,
            respond_to,
        })
        .await
    }

    pub async fn load_history(&self, records: Vec<HistoricalRecord>) -> Result<LoadReport, SessionError> {
        self.request(|respond_to| SessionRequest::LoadHistory { records, respond_to })
            .await
    }

    pub async fn snapshot(&self) -> Result<Snapshot, SessionError> {
        self.request(|respond_to| SessionRequest::Snapshot { respond_to }).await
    }

    pub async fn series(&self) -> Result<SeriesSnapshot, SessionError> {
        self.request(|respond_to| SessionRequest::Series { respond_to }).await
    }

    /// Receiver of the snapshot published on every render tick.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// Waits until the source is exhausted and its last sample is ingested.
    pub async fn wait_for_source(&self) -> Result<Snapshot, SessionError> {
        let mut snapshots = self.subscribe();
        let snapshot = snapshots
            .wait_for(|s| s.source_finished)
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(snapshot.clone())
    }

    /// Stop the engine and the source pump, then let the journal drain.
    ///
    /// Surfaces a source or journal failure if there was one.
    pub async fn shutdown(self) -> Result<(), SessionError> {
        let _ = self.requests.send(SessionRequest::Shutdown).await;
        self.engine.await?;
        let pump = if self.pump.is_finished() {
            self.pump.await?
        } else {
            self.pump.abort();
            Ok(())
        };
        if let Some(journal) = self.journal {
            journal.await??;
        }
        pump?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Resonator, ResonatorConfig};
    use crate::source::SimulatedSource;

    fn simulated(count: u64) -> Box<dyn SampleSource> {
        let resonator = Resonator::new(ResonatorConfig {
            channel_interval_secs: None,
            ..ResonatorConfig::default()
        });
        Box::new(SimulatedSource::new(resonator).limit(count))
    }

    #[tokio::test]
    async fn test_session_ingests_whole_source() {
        let handle = spawn(&Config::default(), simulated(500));
        let snapshot = handle.wait_for_source().await.unwrap();
        assert_eq!(snapshot.ingested, 500);
        assert_eq!(snapshot.lengths["position"], 500);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_is_atomic_for_readers() {
        let handle = spawn(&Config::default(), simulated(300));
        handle.wait_for_source().await.unwrap();
        handle.reset().await.unwrap();
        let published = handle.subscribe().borrow().clone();
        assert!(published.lengths.values().all(|len| *len == 0));
        assert_eq!(published.readings.position, 0.0);
        assert_eq!(published.averaged, AveragedReadings::default());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_tare_and_averaging_controls() {
        let handle = spawn(&Config::default(), simulated(400));
        handle.wait_for_source().await.unwrap();
        assert!(handle.tare().await.unwrap());
        assert_eq!(handle.snapshot().await.unwrap().readings.position, 0.0);

        let settings = handle.set_averaging(false, Some(5)).await.unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.effective_window(), 1);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.averaged.period, snapshot.readings.period);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_history_replaces_session() {
        let handle = spawn(&Config::default(), simulated(50));
        handle.wait_for_source().await.unwrap();
        let report = handle.load_history(Vec::new()).await.unwrap();
        assert!(report.empty);
        let series = handle.series().await.unwrap();
        assert!(series.raw["position"].values.is_empty());
        handle.shutdown().await.unwrap();
    }
}
