// src/message.rs - Inbound message model, classified once at the boundary
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Expected a JSON object")]
    NotAnObject,
    #[error("Unknown channel type: {0}")]
    UnknownChannel(String),
    #[error("Unrecognised message shape (keys: {0})")]
    UnknownShape(String),
}

/// One decoded sample of the balance-wheel encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EncoderReading {
    /// Microseconds since device start.
    pub device_micros: u64,
    /// Signed encoder tally.
    pub raw_count: i64,
    /// Device-vs-host clock offset, when the transport reports one.
    pub drift_micros: Option<i64>,
}

/// Auxiliary environmental sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Channel {
    Bmp180,
    Bmp390,
    Sht85,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Bmp180, Channel::Bmp390, Channel::Sht85];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Bmp180 => "BMP180",
            Channel::Bmp390 => "BMP390",
            Channel::Sht85 => "SHT85",
        }
    }

    /// Fields the sensor reports besides temperature.
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Channel::Bmp180 | Channel::Bmp390 => &["temperature", "pressure"],
            Channel::Sht85 => &["temperature", "humidity"],
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BMP180" => Ok(Channel::Bmp180),
            "BMP390" => Ok(Channel::Bmp390),
            "SHT85" => Ok(Channel::Sht85),
            _ => Err(MessageError::UnknownChannel(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReading {
    pub channel: Channel,
    pub device_micros: u64,
    pub values: BTreeMap<String, f64>,
}

/// Connection state reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub device: String,
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum InboundMessage {
    Encoder(EncoderReading),
    Environment(ChannelReading),
    Status(DeviceStatus),
}

/// Every key any producer is known to send. Aliases cover the device's
/// capitalised names and the camel/snake case spellings; anything else lands
/// in `rest`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default, alias = "Device")]
    device: Option<String>,
    #[serde(default, alias = "Status")]
    status: Option<String>,
    #[serde(default, alias = "Error")]
    error: Option<String>,
    #[serde(default, rename = "type", alias = "channelType", alias = "channel_type")]
    channel: Option<String>,
    #[serde(default)]
    values: Option<BTreeMap<String, Value>>,
    #[serde(
        default,
        alias = "TotalMicros",
        alias = "totalMicros",
        alias = "deviceMicros",
        alias = "timestamp",
        alias = "Timestamp"
    )]
    device_micros: Option<Value>,
    #[serde(default, alias = "Count", alias = "count", alias = "rawCount")]
    raw_count: Option<Value>,
    #[serde(default, alias = "TimestampDrift", alias = "timestampDrift", alias = "driftMicros")]
    drift_micros: Option<Value>,
    #[serde(flatten)]
    rest: BTreeMap<String, Value>,
}

// Non-numeric values read as 0.
fn lenient_u64(value: &Value) -> u64 {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
        .unwrap_or(0)
}

fn lenient_i64(value: &Value) -> i64 {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
        .unwrap_or(0)
}

fn numeric_fields(fields: BTreeMap<String, Value>) -> BTreeMap<String, f64> {
    fields
        .into_iter()
        .filter_map(|(key, value)| Some((key.to_ascii_lowercase(), value.as_f64()?)))
        .collect()
}

impl InboundMessage {
    /// Classify one JSON object into a message variant.
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// A `Device` key makes a status message, a channel tag an environment
    /// reading, and a timestamp or count an encoder sample. Missing numbers
    /// default to 0.
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        if !value.is_object() {
            return Err(MessageError::NotAnObject);
        }
        let envelope: Envelope = serde_json::from_value(value)?;

        if let Some(device) = envelope.device {
            return Ok(InboundMessage::Status(DeviceStatus {
                device,
                status: envelope.status.unwrap_or_default(),
                error: envelope.error.filter(|e| !e.is_empty()),
            }));
        }

        if let Some(tag) = envelope.channel {
            let channel: Channel = tag.parse()?;
            let values = numeric_fields(envelope.values.unwrap_or(envelope.rest));
            return Ok(InboundMessage::Environment(ChannelReading {
                channel,
                device_micros: envelope.device_micros.as_ref().map_or(0, lenient_u64),
                values,
            }));
        }

        if envelope.device_micros.is_some() || envelope.raw_count.is_some() {
            return Ok(InboundMessage::Encoder(EncoderReading {
                device_micros: envelope.device_micros.as_ref().map_or(0, lenient_u64),
                raw_count: envelope.raw_count.as_ref().map_or(0, lenient_i64),
                drift_micros: envelope.drift_micros.as_ref().map(lenient_i64),
            }));
        }

        let keys: Vec<&str> = envelope.rest.keys().map(String::as_str).collect();
        Err(MessageError::UnknownShape(keys.join(",")))
    }
}
