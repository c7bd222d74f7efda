// src/engine/peak.rs - Sub-sample extremum detection
use super::crossing::Polarity;
use serde::Serialize;

/// A refined extremum of the position signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Peak {
    pub time: f64,
    pub value: f64,
    /// True when the quadratic fit was accepted, false when the raw sample was used.
    pub interpolated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeakEvent {
    pub polarity: Polarity,
    pub peak: Peak,
}

/// One sample of the 3-point sliding window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowPoint {
    pub time: f64,
    pub position: f64,
}

/// Vertex of the quadratic through three points, in a frame centred on `t2`.
///
/// Returns `None` when the fit is degenerate (coincident times, collinear
/// points) or produces a non-finite vertex.
pub fn interpolate_vertex(p1: f64, p2: f64, p3: f64, t1: f64, t2: f64, t3: f64) -> Option<(f64, f64)> {
    let x1 = t1 - t2;
    let x3 = t3 - t2;

    // y = a x^2 + b x + p2 with x2 = 0
    let denom = x1 * (x1 - x3) * -x3;
    if denom == 0.0 || !denom.is_finite() {
        return None;
    }
    let a = (x3 * (p2 - p1) + x1 * (p3 - p2)) / denom;
    let b = (x3 * x3 * (p1 - p2) + x1 * x1 * (p2 - p3)) / denom;
    if a == 0.0 {
        return None;
    }

    let x_peak = -b / (2.0 * a);
    let value = a * x_peak * x_peak + b * x_peak + p2;
    let time = x_peak + t2;
    if time.is_finite() && value.is_finite() {
        Some((time, value))
    } else {
        None
    }
}

/// Detects local extrema on a 3-sample window and refines them with a
/// quantization-corrected quadratic fit.
#[derive(Debug, Clone)]
pub struct PeakDetector {
    quantum: f64,
    tolerance: f64,
    positive: Option<Peak>,
    negative: Option<Peak>,
}

impl PeakDetector {
    pub fn new(quantum: f64, tolerance: f64) -> Self {
        Self {
            quantum,
            tolerance,
            positive: None,
            negative: None,
        }
    }

    /// Examine the window `(prev, middle, current)`; reports a peak at `middle`.
    pub fn observe(&mut self, prev: WindowPoint, middle: WindowPoint, current: WindowPoint) -> Option<PeakEvent> {
        let (p1, p2, p3) = (prev.position, middle.position, current.position);

        let (polarity, corrected) = if p2 > p1 && p2 > p3 && p2 > 0.0 {
            // the sample after the true maximum reads one step low
            (Polarity::Positive, (p1, p2, p3 + self.quantum))
        } else if p2 < p1 && p2 < p3 && p2 < 0.0 {
            (Polarity::Negative, (p1 + self.quantum, p2 + self.quantum, p3))
        } else {
            return None;
        };

        let peak = self.refine(corrected, prev, middle, current);
        match polarity {
            Polarity::Positive => self.positive = Some(peak),
            Polarity::Negative => self.negative = Some(peak),
        }
        tracing::trace!(
            "{:?} peak {:.3} at {:.6}s (interpolated: {})",
            polarity, peak.value, peak.time, peak.interpolated
        );
        Some(PeakEvent { polarity, peak })
    }

    fn refine(
        &self,
        (p1, p2, p3): (f64, f64, f64),
        prev: WindowPoint,
        middle: WindowPoint,
        current: WindowPoint,
    ) -> Peak {
        let raw = Peak {
            time: middle.time,
            value: middle.position,
            interpolated: false,
        };
        let Some((time, value)) = interpolate_vertex(p1, p2, p3, prev.time, middle.time, current.time) else {
            tracing::debug!("Degenerate peak fit at {:.6}s, using raw sample", middle.time);
            return raw;
        };
        if time < prev.time || time > current.time || (value - middle.position).abs() > self.tolerance {
            tracing::debug!(
                "Rejected peak fit ({:.3} at {:.6}s) around raw {:.3}",
                value, time, middle.position
            );
            return raw;
        }
        Peak {
            time,
            value,
            interpolated: true,
        }
    }

    pub fn positive(&self) -> Option<Peak> {
        self.positive
    }

    pub fn negative(&self) -> Option<Peak> {
        self.negative
    }

    pub fn clear(&mut self) {
        self.positive = None;
        self.negative = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(time: f64, position: f64) -> WindowPoint {
        WindowPoint { time, position }
    }

    #[test]
    fn test_exact_parabola_vertex() {
        // y = 10 - 10 (t - 1)^2
        let (t, y) = interpolate_vertex(0.0, 10.0, 0.0, 0.0, 1.0, 2.0).unwrap();
        assert!((t - 1.0).abs() < 1e-12);
        assert!((y - 10.0).abs() < 1e-12);

        // off-centre vertex with uneven spacing: y = 7 - 3 (t - 0.4)^2
        let f = |t: f64| 7.0 - 3.0 * (t - 0.4) * (t - 0.4);
        let (t, y) = interpolate_vertex(f(0.0), f(0.5), f(1.25), 0.0, 0.5, 1.25).unwrap();
        assert!((t - 0.4).abs() < 1e-9);
        assert!((y - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_collinear_points_have_no_vertex() {
        assert_eq!(interpolate_vertex(0.0, 2.0, 4.0, 0.0, 1.0, 2.0), None);
        assert_eq!(interpolate_vertex(0.0, 2.0, 4.0, 1.0, 1.0, 2.0), None);
    }

    #[test]
    fn test_positive_peak_with_bias_correction() {
        let mut detector = PeakDetector::new(2.0, 4.0);
        // after +2 on the trailing sample the window is the parabola (0,0),(1,10),(2,0)
        let event = detector
            .observe(point(0.0, 0.0), point(1.0, 10.0), point(2.0, -2.0))
            .unwrap();
        assert_eq!(event.polarity, Polarity::Positive);
        assert!(event.peak.interpolated);
        assert!((event.peak.time - 1.0).abs() < 1e-12);
        assert!((event.peak.value - 10.0).abs() < 1e-12);
        assert_eq!(detector.positive(), Some(event.peak));
    }

    #[test]
    fn test_negative_peak_with_bias_correction() {
        let mut detector = PeakDetector::new(2.0, 4.0);
        // after +2 on the leading two samples: (0,-8),(1,-18),(2,-8)
        let event = detector
            .observe(point(0.0, -10.0), point(1.0, -20.0), point(2.0, -8.0))
            .unwrap();
        assert_eq!(event.polarity, Polarity::Negative);
        assert!((event.peak.time - 1.0).abs() < 1e-12);
        assert!((event.peak.value + 18.0).abs() < 1e-12);
        assert!(detector.negative().is_some());
        assert!(detector.positive().is_none());
    }

    #[test]
    fn test_monotonic_window_is_not_a_peak() {
        let mut detector = PeakDetector::new(2.0, 4.0);
        assert_eq!(detector.observe(point(0.0, 2.0), point(1.0, 4.0), point(2.0, 6.0)), None);
        assert_eq!(detector.observe(point(0.0, 6.0), point(1.0, 6.0), point(2.0, 4.0)), None);
    }

    #[test]
    fn test_extremum_on_wrong_side_of_zero_is_ignored() {
        let mut detector = PeakDetector::new(2.0, 4.0);
        assert_eq!(detector.observe(point(0.0, -10.0), point(1.0, -4.0), point(2.0, -10.0)), None);
        assert_eq!(detector.observe(point(0.0, 10.0), point(1.0, 4.0), point(2.0, 10.0)), None);
    }

    #[test]
    fn test_fit_outside_tolerance_falls_back_to_raw() {
        let mut detector = PeakDetector::new(2.0, 4.0);
        // sharp spike: corrected fit overshoots the middle sample by far more than 4 degrees
        let event = detector
            .observe(point(0.0, 0.0), point(0.001, 40.0), point(1.0, 38.0))
            .unwrap();
        assert!(!event.peak.interpolated);
        assert_eq!(event.peak.value, 40.0);
        assert_eq!(event.peak.time, 0.001);
    }

    #[test]
    fn test_coincident_times_fall_back_to_raw() {
        let mut detector = PeakDetector::new(2.0, 4.0);
        let event = detector
            .observe(point(1.0, 0.0), point(1.0, 10.0), point(1.0, 0.0))
            .unwrap();
        assert!(!event.peak.interpolated);
        assert_eq!(event.peak.value, 10.0);
    }
}
