// src/sim.rs - Seeded synthetic balance wheel
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::f64::consts::TAU;

use crate::message::{Channel, ChannelReading, EncoderReading, InboundMessage};

#[derive(Debug, Clone)]
pub struct ResonatorConfig {
    /// Initial peak deflection, in degrees.
    pub amplitude: f64,
    pub period_secs: f64,
    /// Exponential amplitude decay rate, per second.
    pub decay_per_sec: f64,
    /// Step of the internal clock used to locate encoder transitions.
    pub resolution_micros: u64,
    /// Uniform timing jitter applied to every sample, in microseconds.
    pub jitter_micros: f64,
    /// Host clock rate error relative to the device, in parts per million.
    pub drift_ppm: f64,
    pub degrees_per_count: f64,
    /// Cadence of auxiliary sensor readings; `None` disables them.
    pub channel_interval_secs: Option<f64>,
    pub seed: u64,
}

impl Default for ResonatorConfig {
    fn default() -> Self {
        Self {
            amplitude: 135.0,
            period_secs: 0.4,
            decay_per_sec: 0.0,
            resolution_micros: 10,
            jitter_micros: 50.0,
            drift_ppm: 20.0,
            degrees_per_count: 2.0,
            channel_interval_secs: Some(2.0),
            seed: 0x5eed,
        }
    }
}

/// Damped sinusoid quantized to encoder counts.
///
/// Like the real encoder it reports one sample per count step, timestamped on a
/// jittered device clock. A wheel that has come to rest still reports its count
/// once per period.
#[derive(Debug)]
pub struct Resonator {
    config: ResonatorConfig,
    rng: StdRng,
    clock_micros: u64,
    count: i64,
    last_micros: u64,
    next_channel_secs: f64,
    channel_cursor: usize,
    pending: VecDeque<InboundMessage>,
}

impl Resonator {
    pub fn new(config: ResonatorConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            next_channel_secs: 0.0,
            clock_micros: 0,
            count: 0,
            last_micros: 0,
            channel_cursor: 0,
            pending: VecDeque::new(),
            config,
        }
    }

    pub fn config(&self) -> &ResonatorConfig {
        &self.config
    }

    /// Noise-free deflection at `time` seconds.
    pub fn angle_at(&self, time: f64) -> f64 {
        let envelope = self.config.amplitude * (-self.config.decay_per_sec * time).exp();
        envelope * (TAU * time / self.config.period_secs).sin()
    }

    pub fn next_sample(&mut self) -> EncoderReading {
        let resolution = self.config.resolution_micros.max(1);
        let idle_limit = (self.config.period_secs * 1e6) as u64;
        let mut idle = 0;
        while idle < idle_limit {
            self.clock_micros += resolution;
            idle += resolution;
            let time = self.clock_micros as f64 / 1e6;
            let target = (self.angle_at(time) / self.config.degrees_per_count).round() as i64;
            if target != self.count {
                self.count += (target - self.count).signum();
                break;
            }
        }

        let nominal = self.clock_micros as f64;
        let jitter = if self.config.jitter_micros > 0.0 {
            self.rng.random_range(-self.config.jitter_micros..=self.config.jitter_micros)
        } else {
            0.0
        };
        let device_micros = ((nominal + jitter).max(0.0) as u64).max(self.last_micros);
        self.last_micros = device_micros;

        let drift_micros = (device_micros as f64 * self.config.drift_ppm / 1e6).round() as i64;

        EncoderReading {
            device_micros,
            raw_count: self.count,
            drift_micros: Some(drift_micros),
        }
    }

    /// Next inbound message, interleaving auxiliary readings at their own cadence.
    pub fn next_message(&mut self) -> InboundMessage {
        if let Some(message) = self.pending.pop_front() {
            return message;
        }
        let sample = self.next_sample();
        if let Some(interval) = self.config.channel_interval_secs {
            let time = sample.device_micros as f64 / 1e6;
            if time >= self.next_channel_secs {
                self.next_channel_secs = time + interval;
                let reading = self.channel_reading(sample.device_micros);
                self.pending.push_back(InboundMessage::Environment(reading));
            }
        }
        InboundMessage::Encoder(sample)
    }

    fn channel_reading(&mut self, device_micros: u64) -> ChannelReading {
        let channel = Channel::ALL[self.channel_cursor % Channel::ALL.len()];
        self.channel_cursor += 1;
        let mut values = BTreeMap::new();
        values.insert("temperature".to_string(), 22.0 + self.rng.random_range(-0.2..=0.2));
        match channel {
            Channel::Bmp180 | Channel::Bmp390 => {
                values.insert("pressure".to_string(), 1013.25 + self.rng.random_range(-0.5..=0.5));
            }
            Channel::Sht85 => {
                values.insert("humidity".to_string(), 45.0 + self.rng.random_range(-1.0..=1.0));
            }
        }
        ChannelReading {
            channel,
            device_micros,
            values,
        }
    }
}
