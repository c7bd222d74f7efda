// src/lib.rs - Balance-wheel encoder derivation engine
pub mod config;
pub mod engine;
pub mod history;
pub mod journal;
pub mod message;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod source;

pub use config::{Config, ConfigError, load_config};
pub use engine::{DerivedPoint, Readings, Recorder};
pub use message::{Channel, ChannelReading, EncoderReading, InboundMessage};
pub use session::{SessionHandle, Snapshot};
