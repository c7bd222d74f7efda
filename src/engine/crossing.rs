// src/engine/crossing.rs - Zero-crossing / half-period state machine
use serde::Serialize;

/// Direction of the zero crossing that closed a half-period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HalfPeriod {
    pub polarity: Polarity,
    /// Seconds between the previous crossing and this one.
    pub duration: f64,
    /// Session time of the closing crossing.
    pub at: f64,
}

/// Watches sign changes of the tared position signal and times half-periods.
///
/// The previous sample starts at 0, the rest position after a tare, so the
/// very first sample can already register a crossing.
#[derive(Debug, Clone)]
pub struct CrossingDetector {
    debounce: f64,
    previous: f64,
    last_crossing: Option<f64>,
    positive: Option<f64>,
    negative: Option<f64>,
}

impl CrossingDetector {
    pub fn new(debounce: f64) -> Self {
        Self {
            debounce: debounce.max(0.0),
            previous: 0.0,
            last_crossing: None,
            positive: None,
            negative: None,
        }
    }

    /// Feed the next position sample; returns the half-period it closes, if any.
    pub fn observe(&mut self, time: f64, position: f64) -> Option<HalfPeriod> {
        let previous = std::mem::replace(&mut self.previous, position);

        let polarity = if previous <= 0.0 && position > 0.0 {
            Polarity::Positive
        } else if previous >= 0.0 && position < 0.0 {
            Polarity::Negative
        } else {
            return None;
        };

        if let Some(last) = self.last_crossing {
            if self.debounce > 0.0 && time - last < self.debounce {
                tracing::trace!("Ignoring zero crossing {:.6}s after the last one", time - last);
                return None;
            }
        }

        let half = self.last_crossing.map(|last| HalfPeriod {
            polarity,
            duration: time - last,
            at: time,
        });
        self.last_crossing = Some(time);

        let half = half?;
        match polarity {
            Polarity::Positive => self.positive = Some(half.duration),
            Polarity::Negative => self.negative = Some(half.duration),
        }
        Some(half)
    }

    pub fn last_crossing(&self) -> Option<f64> {
        self.last_crossing
    }

    pub fn positive_halfperiod(&self) -> Option<f64> {
        self.positive
    }

    pub fn negative_halfperiod(&self) -> Option<f64> {
        self.negative
    }

    /// Sum of the most recent positive and negative half-periods.
    pub fn period(&self) -> Option<f64> {
        Some(self.positive? + self.negative?)
    }

    /// Forget crossing memory; `position` becomes the new previous sample.
    pub fn clear(&mut self, position: f64) {
        self.previous = position;
        self.last_crossing = None;
        self.positive = None;
        self.negative = None;
    }
}
