// src/engine/kinematics.rs - Fixed-lag finite differences
use super::history::Series;

/// Velocity and acceleration from fixed-lag finite differences.
///
/// `step` is the window length in samples: the estimate at the newest sample
/// `i` is `(y[i] - y[i - step + 1]) / (t[i] - t[i - step + 1])`, available once
/// `step` samples exist. It is a causal estimator and lags the true derivative
/// by roughly `step / 2` samples.
#[derive(Debug, Clone)]
pub struct DerivativeEstimator {
    step: usize,
}

impl DerivativeEstimator {
    pub fn new(step: usize) -> Self {
        Self { step: step.max(1) }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Finite difference over the newest entry of `series`.
    ///
    /// Returns 0 while fewer than `step` entries exist, and whenever the
    /// elapsed time is not strictly positive or the result is not finite.
    pub fn difference(&self, series: &Series) -> f64 {
        let (Some((t_now, y_now)), Some((t_then, y_then))) =
            (series.from_back(0), series.from_back(self.step - 1))
        else {
            return 0.0;
        };
        let dt = t_now - t_then;
        if dt <= 0.0 {
            tracing::debug!("Degenerate finite difference interval dt={}", dt);
            return 0.0;
        }
        let rate = (y_now - y_then) / dt;
        if rate.is_finite() { rate } else { 0.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize, slope: f64) -> Series {
        let mut series = Series::new(100);
        for i in 0..len {
            let t = i as f64 * 0.01;
            series.push(t, slope * t);
        }
        series
    }

    #[test]
    fn test_zero_until_window_is_full() {
        let estimator = DerivativeEstimator::new(10);
        assert_eq!(estimator.difference(&ramp(0, 50.0)), 0.0);
        assert_eq!(estimator.difference(&ramp(9, 50.0)), 0.0);
        assert!((estimator.difference(&ramp(10, 50.0)) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_unit_step_has_no_window() {
        let estimator = DerivativeEstimator::new(1);
        assert_eq!(estimator.difference(&ramp(5, 50.0)), 0.0);
    }

    #[test]
    fn test_constant_slope() {
        let estimator = DerivativeEstimator::new(3);
        assert!((estimator.difference(&ramp(40, -120.0)) + 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_equal_timestamps_yield_zero() {
        let estimator = DerivativeEstimator::new(2);
        let mut series = Series::new(10);
        series.push(1.0, 0.0);
        series.push(1.0, 2.0);
        series.push(1.0, 4.0);
        assert_eq!(estimator.difference(&series), 0.0);
    }

    #[test]
    fn test_out_of_order_timestamps_yield_zero() {
        let estimator = DerivativeEstimator::new(1);
        let mut series = Series::new(10);
        series.push(2.0, 0.0);
        series.push(1.0, 2.0);
        assert_eq!(estimator.difference(&series), 0.0);
    }
}
