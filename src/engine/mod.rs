// src/engine/mod.rs - Streaming derivation engine for the balance-wheel encoder
pub mod aggregate;
pub mod averaging;
pub mod channels;
pub mod crossing;
pub mod drift;
pub mod history;
pub mod kinematics;
pub mod peak;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::EngineConfig;
use crate::history::{HistoricalRecord, LoadReport};
use crate::message::{Channel, ChannelReading, EncoderReading, InboundMessage};

use aggregate::Aggregator;
use channels::ChannelStore;
use crossing::{CrossingDetector, HalfPeriod};
use drift::{DriftEstimator, DriftRate};
use history::{History, SeriesData};
use kinematics::DerivativeEstimator;
use peak::{PeakDetector, PeakEvent, WindowPoint};

/// Everything derived from a single ingested sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DerivedPoint {
    pub time: f64,
    pub position: f64,
    pub velocity: f64,
    pub acceleration: f64,
    pub half_period: Option<HalfPeriod>,
    pub period: Option<f64>,
    pub peak: Option<PeakEvent>,
    pub amplitude: Option<f64>,
    pub amplitude_rate: Option<f64>,
    pub drift_rate: Option<DriftRate>,
}

/// Latest value of every derived quantity. Absent measurements read as 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Readings {
    pub time: f64,
    pub position: f64,
    pub velocity: f64,
    pub acceleration: f64,
    pub period: f64,
    pub positive_halfperiod: f64,
    pub negative_halfperiod: f64,
    pub amplitude: f64,
    pub amplitude_rate: f64,
    pub positive_peak: f64,
    pub negative_peak: f64,
    pub drift: f64,
    pub drift_rate: f64,
    pub tare_offset: f64,
    pub channels: BTreeMap<String, BTreeMap<String, f64>>,
}

/// Owned state of one recording session.
///
/// All mutation goes through `ingest`, `tare`, `reset` and `load_history`;
/// the caller is the single writer.
#[derive(Debug, Clone)]
pub struct Recorder {
    config: EngineConfig,
    origin_micros: Option<u64>,
    last_sample: Option<EncoderReading>,
    tare_offset: f64,
    history: History,
    kinematics: DerivativeEstimator,
    crossings: CrossingDetector,
    peaks: PeakDetector,
    aggregator: Aggregator,
    drift: DriftEstimator,
    channels: ChannelStore,
}

impl Recorder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            origin_micros: None,
            last_sample: None,
            tare_offset: 0.0,
            history: History::new(config.capacity),
            kinematics: DerivativeEstimator::new(config.derivative_step),
            crossings: CrossingDetector::new(config.crossing_debounce_secs),
            peaks: PeakDetector::new(config.quantization_step, config.peak_tolerance),
            aggregator: Aggregator::new(config.min_amplitude),
            drift: DriftEstimator::new(config.drift_window, config.drift_smoothing),
            channels: ChannelStore::new(config.capacity),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Derive everything the sample implies and append it to the history.
    pub fn ingest(&mut self, reading: &EncoderReading) -> DerivedPoint {
        let origin = *self.origin_micros.get_or_insert(reading.device_micros);
        self.last_sample = Some(*reading);
        let time = (reading.device_micros as f64 - origin as f64) / 1e6;
        let position = reading.raw_count as f64 * self.config.degrees_per_count - self.tare_offset;
        let position = if position.is_finite() { position } else { 0.0 };

        self.history.position.push(time, position);
        let velocity = self.kinematics.difference(&self.history.position);
        self.history.velocity.push(time, velocity);
        let acceleration = self.kinematics.difference(&self.history.velocity);
        self.history.acceleration.push(time, acceleration);

        let half_period = self.crossings.observe(time, position);
        let period = half_period.and_then(|_| {
            self.aggregator.emit_period(
                &mut self.history,
                time,
                self.crossings.positive_halfperiod(),
                self.crossings.negative_halfperiod(),
            )
        });

        let peak = self.observe_peak();
        let (amplitude, amplitude_rate) = match peak {
            Some(_) => self
                .aggregator
                .emit_amplitude(
                    &mut self.history,
                    time,
                    self.peaks.positive().map(|p| p.value),
                    self.peaks.negative().map(|p| p.value),
                )
                .map_or((None, None), |(amplitude, rate)| (Some(amplitude), rate)),
            None => (None, None),
        };

        let drift_rate = reading.drift_micros.and_then(|drift_micros| {
            self.history.drift.push(time, drift_micros as f64);
            let rate = self.drift.observe(reading.device_micros, drift_micros)?;
            self.history.drift_rate.push(time, rate.smoothed);
            Some(rate)
        });

        tracing::trace!(
            "Sample t={:.6}s pos={:.1} vel={:.1} acc={:.1}",
            time, position, velocity, acceleration
        );

        DerivedPoint {
            time,
            position,
            velocity,
            acceleration,
            half_period,
            period,
            peak,
            amplitude,
            amplitude_rate,
            drift_rate,
        }
    }

    fn observe_peak(&mut self) -> Option<PeakEvent> {
        let point = |back| {
            self.history
                .position
                .from_back(back)
                .map(|(time, position)| WindowPoint { time, position })
        };
        let (prev, middle, current) = (point(2)?, point(1)?, point(0)?);
        self.peaks.observe(prev, middle, current)
    }

    pub fn record_channel(&mut self, reading: &ChannelReading) -> f64 {
        tracing::trace!("{} reading {:?}", reading.channel, reading.values);
        self.channels.record(reading)
    }

    /// Route one inbound message; only encoder samples produce a derived point.
    pub fn ingest_message(&mut self, message: &InboundMessage) -> Option<DerivedPoint> {
        match message {
            InboundMessage::Encoder(reading) => Some(self.ingest(reading)),
            InboundMessage::Environment(reading) => {
                self.record_channel(reading);
                None
            }
            InboundMessage::Status(status) => {
                match &status.error {
                    Some(error) => tracing::warn!("{}: {} ({})", status.device, status.status, error),
                    None => tracing::info!("{}: {}", status.device, status.status),
                }
                None
            }
        }
    }

    /// Re-zero the position at the latest sample. Returns false on an empty history.
    pub fn tare(&mut self) -> bool {
        let Some(last) = self.history.position.last_value() else {
            tracing::debug!("Tare ignored on empty history");
            return false;
        };
        self.tare_offset += last;
        self.history.position.map_values(|value| value - last);
        self.crossings.clear(0.0);
        self.peaks.clear();
        tracing::info!("Tared at {:.1} degrees (offset now {:.1})", last, self.tare_offset);
        true
    }

    /// Discard every series and all crossing, peak, drift and channel memory.
    pub fn reset(&mut self) {
        self.history.clear();
        self.origin_micros = None;
        self.last_sample = None;
        self.crossings.clear(0.0);
        self.peaks.clear();
        self.drift.clear();
        self.channels.clear();
        if !self.config.tare_survives_reset {
            self.tare_offset = 0.0;
        }
        tracing::info!("Session reset (tare offset {:.1})", self.tare_offset);
    }

    /// Replace the session with stored rows. Null fields leave their series untouched.
    pub fn load_history(&mut self, records: &[HistoricalRecord]) -> LoadReport {
        self.reset();
        let mut report = LoadReport {
            records: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            tracing::warn!("Historical load returned no records");
            report.empty = true;
            return report;
        }

        for record in records {
            let Some(total_micros) = record.total_micros else {
                report.skipped += 1;
                continue;
            };
            let origin = *self.origin_micros.get_or_insert(total_micros);
            let time = (total_micros as f64 - origin as f64) / 1e6;

            if let Some(period) = record.period.filter(|p| p.is_finite()) {
                self.history.period.push(time, period);
                report.periods += 1;
            }
            if let Some(amplitude) = record.amplitude.filter(|a| a.is_finite()) {
                self.aggregator.record_amplitude(&mut self.history, time, amplitude);
                report.amplitudes += 1;
            }
            if let Some(drift_micros) = record.drift_micros {
                self.history.drift.push(time, drift_micros as f64);
                if let Some(rate) = self.drift.observe(total_micros, drift_micros) {
                    self.history.drift_rate.push(time, rate.smoothed);
                }
                report.drifts += 1;
            }
            for reading in record.channel_readings() {
                self.channels.record(&reading);
                report.channel_readings += 1;
            }
        }
        report.empty = report.skipped == report.records;
        if report.empty {
            tracing::warn!("Historical load had no timestamped records");
        } else {
            tracing::info!(
                "Loaded {} historical records ({} periods, {} amplitudes)",
                report.records - report.skipped, report.periods, report.amplitudes
            );
        }
        report
    }

    /// Row to persist after an accepted zero crossing.
    ///
    /// `None` until both half-periods and both peaks are known; channel fields
    /// carry the latest reading of each sensor.
    pub fn measurement(&self, recorded_at: DateTime<Utc>) -> Option<HistoricalRecord> {
        let sample = self.last_sample?;
        let period = self.crossings.period()?;
        let amplitude = self.peaks.positive()?.value - self.peaks.negative()?.value;
        let latest = |channel, field| self.channels.latest(channel, field);
        Some(HistoricalRecord {
            recorded_at: Some(recorded_at),
            total_micros: Some(sample.device_micros),
            drift_micros: sample.drift_micros,
            amplitude: Some(amplitude),
            period: Some(period),
            bmp180_temperature: latest(Channel::Bmp180, "temperature"),
            bmp180_pressure: latest(Channel::Bmp180, "pressure"),
            bmp390_temperature: latest(Channel::Bmp390, "temperature"),
            bmp390_pressure: latest(Channel::Bmp390, "pressure"),
            sht85_temperature: latest(Channel::Sht85, "temperature"),
            sht85_humidity: latest(Channel::Sht85, "humidity"),
        })
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn channels(&self) -> &ChannelStore {
        &self.channels
    }

    pub fn tare_offset(&self) -> f64 {
        self.tare_offset
    }

    pub fn current_position(&self) -> f64 {
        self.history.position.last_value().unwrap_or(0.0)
    }

    pub fn velocity(&self) -> f64 {
        self.history.velocity.last_value().unwrap_or(0.0)
    }

    pub fn acceleration(&self) -> f64 {
        self.history.acceleration.last_value().unwrap_or(0.0)
    }

    pub fn period(&self) -> f64 {
        self.history.period.last_value().unwrap_or(0.0)
    }

    pub fn positive_halfperiod(&self) -> f64 {
        self.crossings.positive_halfperiod().unwrap_or(0.0)
    }

    pub fn negative_halfperiod(&self) -> f64 {
        self.crossings.negative_halfperiod().unwrap_or(0.0)
    }

    pub fn amplitude(&self) -> f64 {
        self.history.amplitude.last_value().unwrap_or(0.0)
    }

    pub fn amplitude_rate(&self) -> f64 {
        self.history.amplitude_rate.last_value().unwrap_or(0.0)
    }

    pub fn positive_peak(&self) -> f64 {
        self.peaks.positive().map_or(0.0, |p| p.value)
    }

    pub fn negative_peak(&self) -> f64 {
        self.peaks.negative().map_or(0.0, |p| p.value)
    }

    pub fn drift(&self) -> f64 {
        self.history.drift.last_value().unwrap_or(0.0)
    }

    pub fn drift_rate(&self) -> f64 {
        self.drift.smoothed().unwrap_or(0.0)
    }

    pub fn channel_value(&self, channel: Channel, field: &str) -> f64 {
        self.channels.latest(channel, field).unwrap_or(0.0)
    }

    /// Channel value recorded closest in device time to the latest encoder sample.
    pub fn correlate(&self, channel: Channel, field: &str) -> Option<f64> {
        let origin = self.origin_micros? as f64 / 1e6;
        let time = self.history.position.last_timestamp()?;
        self.channels.nearest(channel, field, origin + time)
    }

    pub fn readings(&self) -> Readings {
        Readings {
            time: self.history.position.last_timestamp().unwrap_or(0.0),
            position: self.current_position(),
            velocity: self.velocity(),
            acceleration: self.acceleration(),
            period: self.period(),
            positive_halfperiod: self.positive_halfperiod(),
            negative_halfperiod: self.negative_halfperiod(),
            amplitude: self.amplitude(),
            amplitude_rate: self.amplitude_rate(),
            positive_peak: self.positive_peak(),
            negative_peak: self.negative_peak(),
            drift: self.drift(),
            drift_rate: self.drift_rate(),
            tare_offset: self.tare_offset,
            channels: self.channels.readings(),
        }
    }

    /// Copies of every bounded series, keyed by name, for plotting.
    pub fn series(&self) -> BTreeMap<&'static str, SeriesData> {
        self.history
            .all()
            .into_iter()
            .map(|(name, series)| (name, series.snapshot()))
            .collect()
    }

    pub fn lengths(&self) -> BTreeMap<String, usize> {
        let mut lengths: BTreeMap<String, usize> = self
            .history
            .all()
            .into_iter()
            .map(|(name, series)| (name.to_string(), series.len()))
            .collect();
        lengths.extend(self.channels.lengths());
        lengths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(device_micros: u64, raw_count: i64) -> EncoderReading {
        EncoderReading {
            device_micros,
            raw_count,
            drift_micros: None,
        }
    }

    fn recorder() -> Recorder {
        Recorder::new(EngineConfig {
            crossing_debounce_secs: 0.0,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn test_time_origin_fixed_by_first_sample() {
        let mut recorder = recorder();
        assert_eq!(recorder.ingest(&sample(5_000_000, 3)).time, 0.0);
        let point = recorder.ingest(&sample(5_250_000, 4));
        assert_eq!(point.time, 0.25);
        assert_eq!(point.position, 8.0);
    }

    #[test]
    fn test_velocity_available_once_window_is_full() {
        let mut recorder = recorder();
        let points: Vec<DerivedPoint> = (0..10)
            .map(|i| recorder.ingest(&sample(i * 100_000, i as i64)))
            .collect();
        assert_eq!(points[8].velocity, 0.0);
        // (18 - 0) degrees over 0.9 s
        assert!((points[9].velocity - 20.0).abs() < 1e-9);
        assert!((points[9].acceleration - 20.0 / 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_measurement_needs_full_swing() {
        let mut recorder = recorder();
        let at = Utc::now();
        assert_eq!(recorder.measurement(at), None);
        recorder.record_channel(&ChannelReading {
            channel: Channel::Sht85,
            device_micros: 0,
            values: [("humidity".to_string(), 41.0)].into_iter().collect(),
        });

        let counts = [0, 10, 20, 10, 0, -10, -20, -10, 0, 10];
        let mut crossings = Vec::new();
        for (i, count) in counts.into_iter().enumerate() {
            let point = recorder.ingest(&EncoderReading {
                device_micros: 1_000_000 + i as u64 * 10_000,
                raw_count: count,
                drift_micros: Some(7),
            });
            if point.half_period.is_some() {
                crossings.push((i, recorder.measurement(at)));
            }
        }
        assert_eq!(crossings.len(), 2);
        assert_eq!(crossings[0].1, None);

        let (index, record) = &crossings[1];
        assert_eq!(*index, 9);
        let record = record.clone().unwrap();
        assert_eq!(record.recorded_at, Some(at));
        assert_eq!(record.total_micros, Some(1_090_000));
        assert_eq!(record.drift_micros, Some(7));
        assert!((record.period.unwrap() - 0.08).abs() < 1e-9);
        assert_eq!(record.amplitude, Some(recorder.positive_peak() - recorder.negative_peak()));
        assert_eq!(record.sht85_humidity, Some(41.0));
        assert_eq!(record.bmp180_temperature, None);

        recorder.reset();
        assert_eq!(recorder.measurement(at), None);
    }

    #[test]
    fn test_tare_on_empty_history_is_noop() {
        let mut recorder = recorder();
        assert!(!recorder.tare());
        assert_eq!(recorder.tare_offset(), 0.0);
    }

    #[test]
    fn test_tare_rewrites_position_series() {
        let mut recorder = recorder();
        for (i, count) in [10, 12, 14].into_iter().enumerate() {
            recorder.ingest(&sample(i as u64 * 1000, count));
        }
        assert!(recorder.tare());
        assert_eq!(recorder.current_position(), 0.0);
        assert_eq!(recorder.tare_offset(), 28.0);
        let values: Vec<f64> = recorder.history().position.values().collect();
        assert_eq!(values, vec![-8.0, -4.0, 0.0]);
        assert_eq!(recorder.ingest(&sample(3000, 15)).position, 2.0);
    }

    #[test]
    fn test_square_wave_periods_through_recorder() {
        let mut recorder = recorder();
        let counts = [-3, 3, -3, 3];
        let mut periods = Vec::new();
        for (i, count) in counts.into_iter().enumerate() {
            if let Some(period) = recorder.ingest(&sample(i as u64 * 1_000_000, count)).period {
                periods.push(period);
            }
        }
        assert_eq!(periods, vec![2.0, 2.0]);
        assert_eq!(recorder.positive_halfperiod(), 1.0);
        assert_eq!(recorder.negative_halfperiod(), 1.0);
    }

    #[test]
    fn test_amplitude_from_peak_pair() {
        let mut recorder = recorder();
        // +60 then -60 degree swings with a single-sample extremum each
        let counts = [0, 20, 30, 20, 0, -20, -30, -20, 0];
        let mut amplitudes = Vec::new();
        for (i, count) in counts.into_iter().enumerate() {
            if let Some(amplitude) = recorder.ingest(&sample(i as u64 * 10_000, count)).amplitude {
                amplitudes.push(amplitude);
            }
        }
        assert_eq!(amplitudes.len(), 1);
        assert!(recorder.positive_peak() > 0.0);
        assert!(recorder.negative_peak() < 0.0);
        assert_eq!(recorder.amplitude(), recorder.positive_peak() - recorder.negative_peak());
    }

    #[test]
    fn test_reset_respects_tare_policy() {
        let mut keep = recorder();
        keep.ingest(&sample(0, 5));
        keep.tare();
        keep.reset();
        assert_eq!(keep.tare_offset(), 10.0);
        assert!(keep.history().position.is_empty());
        assert_eq!(keep.ingest(&sample(99, 5)).time, 0.0);

        let mut drop = Recorder::new(EngineConfig {
            tare_survives_reset: false,
            ..EngineConfig::default()
        });
        drop.ingest(&sample(0, 5));
        drop.tare();
        drop.reset();
        assert_eq!(drop.tare_offset(), 0.0);
    }

    #[test]
    fn test_drift_series_follow_drift_samples() {
        let mut recorder = Recorder::new(EngineConfig {
            drift_window: 2,
            ..EngineConfig::default()
        });
        for i in 0..5u64 {
            recorder.ingest(&EncoderReading {
                device_micros: i * 1_000_000,
                raw_count: 0,
                drift_micros: Some(i as i64 * 10),
            });
        }
        recorder.ingest(&sample(6_000_000, 0));
        assert_eq!(recorder.history().drift.len(), 5);
        assert_eq!(recorder.history().drift_rate.len(), 2);
        assert!((recorder.drift_rate() - 10.0).abs() < 1e-9);
        assert_eq!(recorder.drift(), 40.0);
    }

    #[test]
    fn test_channel_correlation_uses_device_time() {
        let mut recorder = recorder();
        recorder.record_channel(&ChannelReading {
            channel: Channel::Bmp180,
            device_micros: 1_000_000,
            values: [("temperature".to_string(), 20.0)].into_iter().collect(),
        });
        recorder.record_channel(&ChannelReading {
            channel: Channel::Bmp180,
            device_micros: 3_000_000,
            values: [("temperature".to_string(), 22.0)].into_iter().collect(),
        });
        recorder.ingest(&sample(2_500_000, 1));
        assert_eq!(recorder.correlate(Channel::Bmp180, "temperature"), Some(22.0));
        assert_eq!(recorder.channel_value(Channel::Bmp180, "temperature"), 22.0);
        assert_eq!(recorder.readings().channels["BMP180"]["temperature"], 22.0);
    }
}
