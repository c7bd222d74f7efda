// src/engine/history.rs - Bounded, time-ordered series storage
use serde::Serialize;
use std::collections::VecDeque;

/// A pair of equal-length sequences `(timestamps, values)` in arrival order.
///
/// Once more than `capacity` entries have been pushed the oldest entries are
/// evicted from the front. Two counters let incremental consumers detect what
/// changed since they last looked:
///
/// - `appended` counts every entry ever pushed since the last clear, so the
///   logical index of the newest entry is `appended - 1` even after eviction.
/// - `generation` is bumped whenever existing entries are removed or rewritten
///   wholesale (clear, value rewrite), which invalidates any derived view.
#[derive(Debug, Clone)]
pub struct Series {
    timestamps: VecDeque<f64>,
    values: VecDeque<f64>,
    capacity: usize,
    appended: u64,
    generation: u64,
}

impl Series {
    pub fn new(capacity: usize) -> Self {
        Self {
            timestamps: VecDeque::with_capacity(capacity.min(4096)),
            values: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            appended: 0,
            generation: 0,
        }
    }

    pub fn push(&mut self, timestamp: f64, value: f64) {
        self.timestamps.push_back(timestamp);
        self.values.push_back(value);
        self.appended += 1;
        while self.values.len() > self.capacity {
            self.timestamps.pop_front();
            self.values.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries pushed since the last clear, evicted ones included.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Logical index of the oldest retained entry.
    pub fn first_index(&self) -> u64 {
        self.appended - self.values.len() as u64
    }

    pub fn last(&self) -> Option<(f64, f64)> {
        Some((*self.timestamps.back()?, *self.values.back()?))
    }

    pub fn last_value(&self) -> Option<f64> {
        self.values.back().copied()
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.timestamps.back().copied()
    }

    /// Entry `back` positions before the newest one (`0` is the newest).
    pub fn from_back(&self, back: usize) -> Option<(f64, f64)> {
        let len = self.values.len();
        if back >= len {
            return None;
        }
        let i = len - 1 - back;
        Some((self.timestamps[i], self.values[i]))
    }

    pub fn get(&self, index: usize) -> Option<(f64, f64)> {
        Some((*self.timestamps.get(index)?, *self.values.get(index)?))
    }

    pub fn value(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    pub fn timestamp(&self, index: usize) -> Option<f64> {
        self.timestamps.get(index).copied()
    }

    pub fn timestamps(&self) -> impl Iterator<Item = f64> + '_ {
        self.timestamps.iter().copied()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.timestamps.iter().copied().zip(self.values.iter().copied())
    }

    /// Index of the retained entry whose timestamp is closest to `timestamp`.
    ///
    /// Timestamps are assumed non-decreasing; ties resolve to the earlier entry.
    pub fn nearest_index(&self, timestamp: f64) -> Option<usize> {
        if self.is_empty() || !timestamp.is_finite() {
            return None;
        }
        let upper = self.timestamps.partition_point(|t| *t < timestamp);
        if upper == 0 {
            return Some(0);
        }
        if upper == self.len() {
            return Some(upper - 1);
        }
        let before = timestamp - self.timestamps[upper - 1];
        let after = self.timestamps[upper] - timestamp;
        Some(if after < before { upper } else { upper - 1 })
    }

    /// Rewrites every retained value in place, keeping timestamps untouched.
    pub fn map_values(&mut self, mut f: impl FnMut(f64) -> f64) {
        for value in self.values.iter_mut() {
            *value = f(*value);
        }
        self.generation += 1;
    }

    /// Drops the oldest entries until at most `len` remain.
    pub fn truncate_front(&mut self, len: usize) {
        while self.values.len() > len {
            self.timestamps.pop_front();
            self.values.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.timestamps.clear();
        self.values.clear();
        self.appended = 0;
        self.generation += 1;
    }

    pub fn snapshot(&self) -> SeriesData {
        SeriesData {
            timestamps: self.timestamps.iter().copied().collect(),
            values: self.values.iter().copied().collect(),
        }
    }
}

/// Owned copy of a series, used for plotting and serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesData {
    pub timestamps: Vec<f64>,
    pub values: Vec<f64>,
}

/// Every derived and raw quantity tracked for the oscillating channel.
#[derive(Debug, Clone)]
pub struct History {
    pub position: Series,
    pub velocity: Series,
    pub acceleration: Series,
    pub period: Series,
    pub amplitude: Series,
    pub amplitude_rate: Series,
    pub drift: Series,
    pub drift_rate: Series,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            position: Series::new(capacity),
            velocity: Series::new(capacity),
            acceleration: Series::new(capacity),
            period: Series::new(capacity),
            amplitude: Series::new(capacity),
            amplitude_rate: Series::new(capacity),
            drift: Series::new(capacity),
            drift_rate: Series::new(capacity),
        }
    }

    pub fn clear(&mut self) {
        for series in self.all_mut() {
            series.clear();
        }
    }

    pub fn all(&self) -> [(&'static str, &Series); 8] {
        [
            ("position", &self.position),
            ("velocity", &self.velocity),
            ("acceleration", &self.acceleration),
            ("period", &self.period),
            ("amplitude", &self.amplitude),
            ("amplitude_rate", &self.amplitude_rate),
            ("drift", &self.drift),
            ("drift_rate", &self.drift_rate),
        ]
    }

    fn all_mut(&mut self) -> [&mut Series; 8] {
        [
            &mut self.position,
            &mut self.velocity,
            &mut self.acceleration,
            &mut self.period,
            &mut self.amplitude,
            &mut self.amplitude_rate,
            &mut self.drift,
            &mut self.drift_rate,
        ]
    }
}
