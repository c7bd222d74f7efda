// src/history.rs - Historical bulk-load records and time ranges
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Channel, ChannelReading};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Invalid range: start {start} is after end {end}")]
    InvertedRange { start: i64, end: i64 },
    #[error("Invalid range length: {0}")]
    InvalidLength(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Inclusive time bounds of a historical query, in microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRange {
    start_micros: i64,
    end_micros: i64,
}

impl HistoryRange {
    pub fn new(start_micros: i64, end_micros: i64) -> Result<Self, HistoryError> {
        if start_micros > end_micros {
            return Err(HistoryError::InvertedRange {
                start: start_micros,
                end: end_micros,
            });
        }
        Ok(Self { start_micros, end_micros })
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, HistoryError> {
        Self::new(start.timestamp_micros(), end.timestamp_micros())
    }

    /// The `length` immediately preceding `now`, e.g. the last hour.
    pub fn last(length: Duration, now: DateTime<Utc>) -> Result<Self, HistoryError> {
        if length < Duration::zero() {
            return Err(HistoryError::InvalidLength(length.to_string()));
        }
        let start = now
            .checked_sub_signed(length)
            .ok_or_else(|| HistoryError::InvalidLength(length.to_string()))?;
        Self::between(start, now)
    }

    /// The last `hours` hours before `now` (the 1h/6h/24h presets).
    pub fn last_hours(hours: i64, now: DateTime<Utc>) -> Result<Self, HistoryError> {
        let length = Duration::try_hours(hours)
            .ok_or_else(|| HistoryError::InvalidLength(format!("{} hours", hours)))?;
        Self::last(length, now)
    }

    pub fn start_micros(&self) -> i64 {
        self.start_micros
    }

    pub fn end_micros(&self) -> i64 {
        self.end_micros
    }

    pub fn contains(&self, micros: i64) -> bool {
        (self.start_micros..=self.end_micros).contains(&micros)
    }
}

/// One stored row of the recorder; every observation is nullable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalRecord {
    /// Host wall-clock time the row was written.
    #[serde(default, with = "chrono::serde::ts_seconds_option", alias = "timestamp")]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "TotalMicros")]
    pub total_micros: Option<u64>,
    #[serde(default, alias = "timestamp_drift", alias = "TimestampDrift")]
    pub drift_micros: Option<i64>,
    #[serde(default)]
    pub amplitude: Option<f64>,
    #[serde(default)]
    pub period: Option<f64>,
    #[serde(default)]
    pub bmp180_temperature: Option<f64>,
    #[serde(default)]
    pub bmp180_pressure: Option<f64>,
    #[serde(default)]
    pub bmp390_temperature: Option<f64>,
    #[serde(default)]
    pub bmp390_pressure: Option<f64>,
    #[serde(default)]
    pub sht85_temperature: Option<f64>,
    #[serde(default)]
    pub sht85_humidity: Option<f64>,
}

impl HistoricalRecord {
    /// Non-null channel fields of this row, one reading per channel that has any.
    pub fn channel_readings(&self) -> Vec<ChannelReading> {
        let Some(device_micros) = self.total_micros else {
            return Vec::new();
        };
        let fields = [
            (Channel::Bmp180, "temperature", self.bmp180_temperature),
            (Channel::Bmp180, "pressure", self.bmp180_pressure),
            (Channel::Bmp390, "temperature", self.bmp390_temperature),
            (Channel::Bmp390, "pressure", self.bmp390_pressure),
            (Channel::Sht85, "temperature", self.sht85_temperature),
            (Channel::Sht85, "humidity", self.sht85_humidity),
        ];
        Channel::ALL
            .iter()
            .filter_map(|channel| {
                let values: std::collections::BTreeMap<String, f64> = fields
                    .iter()
                    .filter(|(c, _, _)| c == channel)
                    .filter_map(|(_, name, value)| Some((name.to_string(), (*value)?)))
                    .collect();
                (!values.is_empty()).then(|| ChannelReading {
                    channel: *channel,
                    device_micros,
                    values,
                })
            })
            .collect()
    }
}

/// Outcome of a bulk load. `empty` is advisory, never an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub records: usize,
    pub skipped: usize,
    pub periods: usize,
    pub amplitudes: usize,
    pub drifts: usize,
    pub channel_readings: usize,
    pub empty: bool,
}

/// Parses stored rows, either a JSON array or one JSON object per line.
pub fn parse_records(text: &str) -> Result<Vec<HistoricalRecord>, HistoryError> {
    if text.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(text)?);
    }
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).map_err(HistoryError::from))
        .collect()
}

/// Rows whose wall-clock time falls inside `range`, in time order.
///
/// Rows without a wall-clock time cannot be placed in a range and are dropped.
pub fn select_range(records: &[HistoricalRecord], range: &HistoryRange) -> Vec<HistoricalRecord> {
    let mut selected: Vec<HistoricalRecord> = records
        .iter()
        .filter(|r| r.recorded_at.is_some_and(|at| range.contains(at.timestamp_micros())))
        .cloned()
        .collect();
    selected.sort_by_key(|r| r.recorded_at);
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_range_validation() {
        assert!(HistoryRange::new(10, 5).is_err());
        let range = HistoryRange::new(5, 10).unwrap();
        assert!(range.contains(5));
        assert!(range.contains(10));
        assert!(!range.contains(11));
    }

    #[test]
    fn test_last_hour_preset() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let range = HistoryRange::last(Duration::hours(1), now).unwrap();
        assert_eq!(range.end_micros() - range.start_micros(), 3_600_000_000);
        assert!(HistoryRange::last(Duration::hours(-1), now).is_err());
        let six = HistoryRange::last_hours(6, now).unwrap();
        assert_eq!(six.end_micros() - six.start_micros(), 6 * 3_600_000_000);
    }

    #[test]
    fn test_out_of_range_lengths_are_errors() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert!(matches!(
            HistoryRange::last_hours(i64::MAX, now),
            Err(HistoryError::InvalidLength(_))
        ));
        // representable as a duration, but reaches before the earliest DateTime
        assert!(matches!(
            HistoryRange::last(Duration::MAX, now),
            Err(HistoryError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_json_lines_parse() {
        let text = "{\"total_micros\": 1000, \"period\": 0.4}\n\n{\"total_micros\": 2000, \"amplitude\": 270.0}\n";
        let records = parse_records(text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].period, Some(0.4));
        assert_eq!(records[1].amplitude, Some(270.0));
        assert!(parse_records("{\"total_micros\": 1}\nnot json\n").is_err());
    }

    #[test]
    fn test_nullable_rows_parse() {
        let records = parse_records(
            r#"[
                {"timestamp": 1700000000, "total_micros": 1000, "amplitude": 270.5, "period": null},
                {"total_micros": 2000, "sht85_humidity": 40.0}
            ]"#,
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].amplitude, Some(270.5));
        assert_eq!(records[0].period, None);
        assert!(records[0].recorded_at.is_some());
        assert_eq!(records[1].recorded_at, None);
    }

    #[test]
    fn test_channel_readings_only_carry_present_fields() {
        let record = HistoricalRecord {
            total_micros: Some(5_000_000),
            bmp180_temperature: Some(21.0),
            sht85_humidity: Some(45.0),
            ..Default::default()
        };
        let readings = record.channel_readings();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].channel, Channel::Bmp180);
        assert_eq!(readings[0].values.len(), 1);
        assert_eq!(readings[1].channel, Channel::Sht85);
        assert_eq!(readings[1].values["humidity"], 45.0);
    }

    #[test]
    fn test_select_range_orders_and_filters() {
        let at = |secs: i64| Some(Utc.timestamp_opt(secs, 0).unwrap());
        let records = vec![
            HistoricalRecord { recorded_at: at(300), ..Default::default() },
            HistoricalRecord { recorded_at: at(100), ..Default::default() },
            HistoricalRecord { recorded_at: None, ..Default::default() },
            HistoricalRecord { recorded_at: at(900), ..Default::default() },
        ];
        let range = HistoryRange::new(0, 500_000_000).unwrap();
        let selected = select_range(&records, &range);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].recorded_at, at(100));
    }
}
