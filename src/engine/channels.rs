// src/engine/channels.rs - Auxiliary environmental channels
use super::history::{Series, SeriesData};
use crate::message::{Channel, ChannelReading};
use std::collections::BTreeMap;

/// Bounded series for every named field of one channel, on the channel's own
/// time base.
#[derive(Debug, Clone)]
pub struct ChannelSeries {
    origin_micros: Option<u64>,
    fields: BTreeMap<String, Series>,
    capacity: usize,
}

impl ChannelSeries {
    fn new(capacity: usize) -> Self {
        Self {
            origin_micros: None,
            fields: BTreeMap::new(),
            capacity,
        }
    }

    /// Device time, in microseconds, of the first reading since the last reset.
    pub fn origin_micros(&self) -> Option<u64> {
        self.origin_micros
    }

    pub fn field(&self, name: &str) -> Option<&Series> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn latest(&self) -> BTreeMap<String, f64> {
        self.fields
            .iter()
            .filter_map(|(name, series)| Some((name.clone(), series.last_value()?)))
            .collect()
    }

    fn record(&mut self, device_micros: u64, values: &BTreeMap<String, f64>) -> f64 {
        let origin = *self.origin_micros.get_or_insert(device_micros);
        let time = (device_micros as f64 - origin as f64) / 1e6;
        for (name, value) in values {
            let value = if value.is_finite() { *value } else { 0.0 };
            self.fields
                .entry(name.clone())
                .or_insert_with(|| Series::new(self.capacity))
                .push(time, value);
        }
        time
    }

    fn len(&self) -> usize {
        self.fields.values().map(Series::len).max().unwrap_or(0)
    }
}

/// Store for every auxiliary channel seen in the session.
#[derive(Debug, Clone)]
pub struct ChannelStore {
    capacity: usize,
    channels: BTreeMap<Channel, ChannelSeries>,
}

impl ChannelStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: BTreeMap::new(),
        }
    }

    /// Stores a reading; returns its time relative to the channel origin.
    pub fn record(&mut self, reading: &ChannelReading) -> f64 {
        let capacity = self.capacity;
        self.channels
            .entry(reading.channel)
            .or_insert_with(|| ChannelSeries::new(capacity))
            .record(reading.device_micros, &reading.values)
    }

    pub fn channel(&self, channel: Channel) -> Option<&ChannelSeries> {
        self.channels.get(&channel)
    }

    pub fn latest(&self, channel: Channel, field: &str) -> Option<f64> {
        self.channel(channel)?.field(field)?.last_value()
    }

    /// Value of `field` recorded closest to the absolute device time `device_seconds`.
    pub fn nearest(&self, channel: Channel, field: &str, device_seconds: f64) -> Option<f64> {
        let channel = self.channel(channel)?;
        let origin = channel.origin_micros? as f64 / 1e6;
        let series = channel.field(field)?;
        let index = series.nearest_index(device_seconds - origin)?;
        series.value(index)
    }

    pub fn readings(&self) -> BTreeMap<String, BTreeMap<String, f64>> {
        self.channels
            .iter()
            .map(|(channel, series)| (channel.to_string(), series.latest()))
            .collect()
    }

    pub fn series(&self) -> BTreeMap<String, BTreeMap<String, SeriesData>> {
        self.channels
            .iter()
            .map(|(channel, series)| {
                let fields = series
                    .fields
                    .iter()
                    .map(|(name, s)| (name.clone(), s.snapshot()))
                    .collect();
                (channel.to_string(), fields)
            })
            .collect()
    }

    pub fn lengths(&self) -> BTreeMap<String, usize> {
        self.channels
            .iter()
            .map(|(channel, series)| (channel.to_string(), series.len()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(channel: Channel, device_micros: u64, fields: &[(&str, f64)]) -> ChannelReading {
        ChannelReading {
            channel,
            device_micros,
            values: fields.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn test_independent_time_origins() {
        let mut store = ChannelStore::new(10);
        assert_eq!(store.record(&reading(Channel::Bmp180, 5_000_000, &[("temperature", 21.0)])), 0.0);
        assert_eq!(store.record(&reading(Channel::Sht85, 9_000_000, &[("humidity", 40.0)])), 0.0);
        assert_eq!(store.record(&reading(Channel::Bmp180, 6_500_000, &[("temperature", 21.5)])), 1.5);
        assert_eq!(store.latest(Channel::Bmp180, "temperature"), Some(21.5));
        assert_eq!(store.latest(Channel::Sht85, "temperature"), None);
    }

    #[test]
    fn test_fields_stay_length_synchronized() {
        let mut store = ChannelStore::new(3);
        for i in 0..5u64 {
            store.record(&reading(Channel::Bmp390, i * 1_000_000, &[("temperature", 20.0), ("pressure", 1013.0)]));
        }
        let channel = store.channel(Channel::Bmp390).unwrap();
        let temperature = channel.field("temperature").unwrap();
        let pressure = channel.field("pressure").unwrap();
        assert_eq!(temperature.len(), 3);
        assert_eq!(pressure.len(), 3);
        assert_eq!(
            temperature.timestamps().collect::<Vec<_>>(),
            pressure.timestamps().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_nearest_sample_correlation() {
        let mut store = ChannelStore::new(10);
        store.record(&reading(Channel::Sht85, 10_000_000, &[("humidity", 40.0)]));
        store.record(&reading(Channel::Sht85, 12_000_000, &[("humidity", 42.0)]));
        store.record(&reading(Channel::Sht85, 14_000_000, &[("humidity", 44.0)]));
        assert_eq!(store.nearest(Channel::Sht85, "humidity", 12.9), Some(42.0));
        assert_eq!(store.nearest(Channel::Sht85, "humidity", 13.1), Some(44.0));
        assert_eq!(store.nearest(Channel::Sht85, "humidity", 0.0), Some(40.0));
        assert_eq!(store.nearest(Channel::Bmp180, "humidity", 12.0), None);
    }
}
