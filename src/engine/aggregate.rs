// src/engine/aggregate.rs - Period, amplitude and amplitude-rate emission
use super::history::History;

/// Combines half-periods into full periods and peak pairs into amplitudes.
#[derive(Debug, Clone)]
pub struct Aggregator {
    min_amplitude: f64,
}

impl Aggregator {
    pub fn new(min_amplitude: f64) -> Self {
        Self { min_amplitude }
    }

    /// Append a full period when both half-periods are known.
    pub fn emit_period(
        &self,
        history: &mut History,
        time: f64,
        positive: Option<f64>,
        negative: Option<f64>,
    ) -> Option<f64> {
        let period = positive? + negative?;
        if !period.is_finite() {
            return None;
        }
        history.period.push(time, period);
        Some(period)
    }

    /// Append a peak-to-peak amplitude when both peaks are known.
    ///
    /// Amplitudes whose magnitude does not exceed the configured noise floor are
    /// dropped. Returns the amplitude and, when a previous amplitude exists, the
    /// amplitude rate.
    pub fn emit_amplitude(
        &self,
        history: &mut History,
        time: f64,
        positive_peak: Option<f64>,
        negative_peak: Option<f64>,
    ) -> Option<(f64, Option<f64>)> {
        let amplitude = positive_peak? - negative_peak?;
        if !amplitude.is_finite() || amplitude.abs() <= self.min_amplitude {
            tracing::debug!("Dropping amplitude {:.3} below noise floor {:.3}", amplitude, self.min_amplitude);
            return None;
        }
        Some((amplitude, self.record_amplitude(history, time, amplitude)))
    }

    /// Append an amplitude and its discrete rate of change against the previous entry.
    pub fn record_amplitude(&self, history: &mut History, time: f64, amplitude: f64) -> Option<f64> {
        let previous = history.amplitude.last();
        history.amplitude.push(time, amplitude);

        let (previous_time, previous_amplitude) = previous?;
        let dt = time - previous_time;
        let rate = if dt > 0.0 { (amplitude - previous_amplitude) / dt } else { 0.0 };
        let rate = if rate.is_finite() { rate } else { 0.0 };
        history.amplitude_rate.push(time, rate);
        Some(rate)
    }
}
