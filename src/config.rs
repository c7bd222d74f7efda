//! # Clockwatch Configuration
//!
//! This module defines the configuration for the derivation engine, the averaging
//! pass, the session runtime and the device connection.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [engine]
//! capacity = 4000
//! crossing_debounce_secs = 0.05
//! tare_survives_reset = false
//!
//! [averaging]
//! enabled = true
//! window = 25
//!
//! [source]
//! serial = "/dev/ttyUSB0"
//! ```
//!
//! Every section and every field is optional; missing values fall back to the
//! defaults below.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for a recording session.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub averaging: AveragingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

/// Tuning of the streaming derivation engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Maximum number of entries kept per series.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_degrees_per_count")]
    pub degrees_per_count: f64,
    /// Window, in samples, of the velocity and acceleration finite differences.
    #[serde(default = "default_derivative_step")]
    pub derivative_step: usize,
    /// Minimum spacing between accepted zero crossings. 0 disables the guard.
    #[serde(default = "default_crossing_debounce_secs")]
    pub crossing_debounce_secs: f64,
    #[serde(default = "default_quantization_step")]
    pub quantization_step: f64,
    #[serde(default = "default_peak_tolerance")]
    pub peak_tolerance: f64,
    /// Amplitudes at or below this magnitude are treated as noise.
    #[serde(default = "default_min_amplitude")]
    pub min_amplitude: f64,
    #[serde(default = "default_drift_window")]
    pub drift_window: usize,
    #[serde(default = "default_drift_smoothing")]
    pub drift_smoothing: f64,
    #[serde(default = "default_tare_survives_reset")]
    pub tare_survives_reset: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            degrees_per_count: default_degrees_per_count(),
            derivative_step: default_derivative_step(),
            crossing_debounce_secs: default_crossing_debounce_secs(),
            quantization_step: default_quantization_step(),
            peak_tolerance: default_peak_tolerance(),
            min_amplitude: default_min_amplitude(),
            drift_window: default_drift_window(),
            drift_smoothing: default_drift_smoothing(),
            tare_survives_reset: default_tare_survives_reset(),
        }
    }
}

/// Windowed-mean views computed on the render cadence.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AveragingConfig {
    #[serde(default = "default_averaging_enabled")]
    pub enabled: bool,
    /// Window for period, amplitude and amplitude rate.
    #[serde(default = "default_averaging_window")]
    pub window: usize,
    /// Window for velocity and acceleration.
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,
}

impl AveragingConfig {
    /// Window actually applied to the measurement series.
    pub fn effective_window(&self) -> usize {
        if self.enabled { self.window.max(1) } else { 1 }
    }
}

impl Default for AveragingConfig {
    fn default() -> Self {
        Self {
            enabled: default_averaging_enabled(),
            window: default_averaging_window(),
            smoothing_window: default_smoothing_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_render_interval_ms")]
    pub render_interval_ms: u64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// JSON-lines file receiving one measurement row per accepted zero crossing.
    #[serde(default)]
    pub measurements_path: Option<String>,
    /// CSV file receiving every raw encoder sample.
    #[serde(default)]
    pub capture_path: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            render_interval_ms: default_render_interval_ms(),
            queue_depth: default_queue_depth(),
            measurements_path: None,
            capture_path: None,
        }
    }
}

/// Encoder device connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub serial: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            serial: "".to_string(),
            baud: default_baud(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.derivative_step == 0 {
            return Err(ConfigError::Invalid("engine.derivative_step must be > 0".to_string()));
        }
        let min_capacity = engine.derivative_step.max(3);
        if engine.capacity < min_capacity {
            return Err(ConfigError::Invalid(format!(
                "engine.capacity must be at least {} (got {})",
                min_capacity, engine.capacity
            )));
        }
        for (name, value) in [
            ("engine.degrees_per_count", engine.degrees_per_count),
            ("engine.crossing_debounce_secs", engine.crossing_debounce_secs),
            ("engine.quantization_step", engine.quantization_step),
            ("engine.peak_tolerance", engine.peak_tolerance),
            ("engine.min_amplitude", engine.min_amplitude),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!("{} must be a finite value >= 0", name)));
            }
        }
        if engine.degrees_per_count == 0.0 {
            return Err(ConfigError::Invalid("engine.degrees_per_count must be > 0".to_string()));
        }
        if engine.drift_window < 2 {
            return Err(ConfigError::Invalid("engine.drift_window must be at least 2".to_string()));
        }
        if !(engine.drift_smoothing > 0.0 && engine.drift_smoothing <= 1.0) {
            return Err(ConfigError::Invalid("engine.drift_smoothing must be in (0, 1]".to_string()));
        }
        if self.averaging.window == 0 || self.averaging.smoothing_window == 0 {
            return Err(ConfigError::Invalid("averaging windows must be > 0".to_string()));
        }
        if self.session.render_interval_ms == 0 {
            return Err(ConfigError::Invalid("session.render_interval_ms must be > 0".to_string()));
        }
        if self.session.queue_depth == 0 {
            return Err(ConfigError::Invalid("session.queue_depth must be > 0".to_string()));
        }
        Ok(())
    }
}

fn default_capacity() -> usize { 2000 }
fn default_degrees_per_count() -> f64 { 2.0 }
fn default_derivative_step() -> usize { 10 }
fn default_crossing_debounce_secs() -> f64 { 0.1 }
fn default_quantization_step() -> f64 { 2.0 }
fn default_peak_tolerance() -> f64 { 4.0 }
fn default_min_amplitude() -> f64 { 10.0 }
fn default_drift_window() -> usize { 100 }
fn default_drift_smoothing() -> f64 { 0.001 }
fn default_tare_survives_reset() -> bool { true }
fn default_averaging_enabled() -> bool { true }
fn default_averaging_window() -> usize { 10 }
fn default_smoothing_window() -> usize { 20 }
fn default_render_interval_ms() -> u64 { 100 }
fn default_queue_depth() -> usize { 1024 }
fn default_baud() -> u32 { 115200 }
fn default_max_consecutive_errors() -> u32 { 10 }

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}
