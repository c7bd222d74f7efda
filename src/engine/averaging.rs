// src/engine/averaging.rs - Incremental trailing-window means
use super::history::{History, Series, SeriesData};
use crate::config::AveragingConfig;
use serde::Serialize;

/// How a cursor brought its output up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Unchanged,
    Incremental(usize),
    Recomputed,
}

fn window_mean(source: &Series, end: usize, window: usize) -> f64 {
    let mut sum = 0.0;
    for i in end + 1 - window..=end {
        sum += source.value(i).unwrap_or(0.0);
    }
    sum / window as f64
}

/// From-scratch trailing-window mean; entries with fewer than `window`
/// predecessors are skipped.
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    if values.len() < window {
        return Vec::new();
    }
    (window - 1..values.len())
        .map(|end| {
            let mut sum = 0.0;
            for value in &values[end + 1 - window..=end] {
                sum += *value;
            }
            sum / window as f64
        })
        .collect()
}

/// Windowed-mean view of one source series that only folds in new points.
///
/// The cursor remembers how many source entries it has already folded
/// (`Series::appended`) and the source generation. A shrunken or rewritten
/// source, or a different window, forces a full recompute; otherwise only the
/// tail is computed. The output is aligned with the source timestamps and holds
/// exactly the means a full recompute over the retained source would produce.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    folded: u64,
    generation: u64,
    output: Series,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            folded: 0,
            generation: 0,
            output: Series::new(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn output(&self) -> &Series {
        &self.output
    }

    pub fn latest(&self) -> Option<f64> {
        self.output.last_value()
    }

    pub fn update(&mut self, source: &Series, window: usize) -> UpdateKind {
        let window = window.max(1);
        if window != self.window
            || source.generation() != self.generation
            || source.appended() < self.folded
            || self.output.capacity() != source.capacity()
        {
            self.window = window;
            self.recompute(source);
            return UpdateKind::Recomputed;
        }
        if source.appended() == self.folded {
            return UpdateKind::Unchanged;
        }

        let first = source.first_index();
        let start = self.folded.max(first + window as u64 - 1);
        let mut added = 0;
        for logical in start..source.appended() {
            let end = (logical - first) as usize;
            if let Some(timestamp) = source.timestamp(end) {
                self.output.push(timestamp, window_mean(source, end, window));
                added += 1;
            }
        }
        self.trim(source);
        self.folded = source.appended();
        UpdateKind::Incremental(added)
    }

    fn recompute(&mut self, source: &Series) {
        self.output = Series::new(source.capacity());
        for end in self.window - 1..source.len() {
            if let Some(timestamp) = source.timestamp(end) {
                self.output.push(timestamp, window_mean(source, end, self.window));
            }
        }
        self.folded = source.appended();
        self.generation = source.generation();
    }

    fn trim(&mut self, source: &Series) {
        let defined = (source.len() + 1).saturating_sub(self.window);
        self.output.truncate_front(defined);
    }
}

/// Latest averaged values exposed to readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AveragedReadings {
    pub velocity: f64,
    pub acceleration: f64,
    pub period: f64,
    pub amplitude: f64,
    pub amplitude_rate: f64,
}

/// Averaged series for plotting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AveragedSeries {
    pub velocity: SeriesData,
    pub acceleration: SeriesData,
    pub period: SeriesData,
    pub amplitude: SeriesData,
    pub amplitude_rate: SeriesData,
}

/// Independent cursors for every smoothed view.
#[derive(Debug, Clone)]
pub struct AveragingEngine {
    velocity: MovingAverage,
    acceleration: MovingAverage,
    period: MovingAverage,
    amplitude: MovingAverage,
    amplitude_rate: MovingAverage,
}

impl AveragingEngine {
    pub fn new(settings: &AveragingConfig) -> Self {
        let smoothing = settings.smoothing_window;
        let window = settings.effective_window();
        Self {
            velocity: MovingAverage::new(smoothing),
            acceleration: MovingAverage::new(smoothing),
            period: MovingAverage::new(window),
            amplitude: MovingAverage::new(window),
            amplitude_rate: MovingAverage::new(window),
        }
    }

    /// Bring every view up to date; safe to call any number of times between ingests.
    pub fn update(&mut self, history: &History, settings: &AveragingConfig) {
        let smoothing = settings.smoothing_window;
        let window = settings.effective_window();
        let updates = [
            self.velocity.update(&history.velocity, smoothing),
            self.acceleration.update(&history.acceleration, smoothing),
            self.period.update(&history.period, window),
            self.amplitude.update(&history.amplitude, window),
            self.amplitude_rate.update(&history.amplitude_rate, window),
        ];
        if updates.contains(&UpdateKind::Recomputed) {
            tracing::trace!("Averaging pass recomputed at least one view: {:?}", updates);
        }
    }

    pub fn velocity(&self) -> &Series {
        self.velocity.output()
    }

    pub fn acceleration(&self) -> &Series {
        self.acceleration.output()
    }

    pub fn period(&self) -> &Series {
        self.period.output()
    }

    pub fn amplitude(&self) -> &Series {
        self.amplitude.output()
    }

    pub fn amplitude_rate(&self) -> &Series {
        self.amplitude_rate.output()
    }

    pub fn readings(&self) -> AveragedReadings {
        AveragedReadings {
            velocity: self.velocity.latest().unwrap_or(0.0),
            acceleration: self.acceleration.latest().unwrap_or(0.0),
            period: self.period.latest().unwrap_or(0.0),
            amplitude: self.amplitude.latest().unwrap_or(0.0),
            amplitude_rate: self.amplitude_rate.latest().unwrap_or(0.0),
        }
    }

    pub fn series(&self) -> AveragedSeries {
        AveragedSeries {
            velocity: self.velocity.output().snapshot(),
            acceleration: self.acceleration.output().snapshot(),
            period: self.period.output().snapshot(),
            amplitude: self.amplitude.output().snapshot(),
            amplitude_rate: self.amplitude_rate.output().snapshot(),
        }
    }
}
