// src/engine/drift.rs - Device/host clock drift-rate estimation
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DriftRate {
    /// Rate over the last window, in microseconds per second.
    pub instant: f64,
    /// Exponentially smoothed rate, in microseconds per second.
    pub smoothed: f64,
}

/// Periodic, exponentially smoothed estimate of the relative rate between the
/// device clock and the host clock.
///
/// Each sample carries the device timestamp `ts` and the device-vs-host offset
/// `drift`, so `ts + drift` is the host time of the sample. Every `window`
/// samples the slope of host time against device time over that window gives
/// the instantaneous rate error. The first estimate seeds the average.
#[derive(Debug, Clone)]
pub struct DriftEstimator {
    window: usize,
    smoothing: f64,
    anchor: Option<(f64, f64)>,
    since_anchor: usize,
    smoothed: Option<f64>,
}

impl DriftEstimator {
    pub fn new(window: usize, smoothing: f64) -> Self {
        Self {
            window: window.max(1),
            smoothing: smoothing.clamp(f64::MIN_POSITIVE, 1.0),
            anchor: None,
            since_anchor: 0,
            smoothed: None,
        }
    }

    pub fn observe(&mut self, device_micros: u64, drift_micros: i64) -> Option<DriftRate> {
        let ts = device_micros as f64;
        let drift = drift_micros as f64;

        let Some((ts_start, drift_start)) = self.anchor else {
            self.anchor = Some((ts, drift));
            self.since_anchor = 0;
            return None;
        };

        self.since_anchor += 1;
        if self.since_anchor < self.window {
            return None;
        }
        self.anchor = Some((ts, drift));
        self.since_anchor = 0;

        let elapsed = ts - ts_start;
        if elapsed <= 0.0 {
            tracing::debug!("Skipping drift estimate over non-positive device interval {}", elapsed);
            return None;
        }
        let instant = (((drift + ts) - (drift_start + ts_start)) / elapsed - 1.0) * 1e6;
        if !instant.is_finite() {
            return None;
        }

        let smoothed = match self.smoothed {
            Some(previous) => self.smoothing * instant + (1.0 - self.smoothing) * previous,
            None => instant,
        };
        self.smoothed = Some(smoothed);
        Some(DriftRate { instant, smoothed })
    }

    pub fn smoothed(&self) -> Option<f64> {
        self.smoothed
    }

    pub fn clear(&mut self) {
        self.anchor = None;
        self.since_anchor = 0;
        self.smoothed = None;
    }
}
