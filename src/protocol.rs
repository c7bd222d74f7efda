// src/protocol.rs - Encoder wire frames and recorder CSV lines
use thiserror::Error;

use crate::message::EncoderReading;

pub const FRAME_LEN: usize = 5;
const OVERFLOW_MARKER: [u8; FRAME_LEN] = [0xFF; FRAME_LEN];
const DIRECTION_BIT: u8 = 0x80;
const CHECKSUM_MASK: u8 = 0x7F;
const WRAP: u64 = 1 << 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Device buffer overflow")]
    DeviceOverflow,
    #[error("Checksum mismatch: calculated {calculated:#04x}, received {received:#04x}")]
    Checksum { calculated: u8, received: u8 },
    #[error("Malformed CSV line: {0}")]
    Csv(String),
}

fn checksum(frame: &[u8; FRAME_LEN]) -> u8 {
    frame[..4].iter().fold(0, |acc, b| acc ^ b) & CHECKSUM_MASK
}

/// Builds the frame the device would send for one encoder step.
pub fn encode_frame(timestamp: u32, forward: bool) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[..4].copy_from_slice(&timestamp.to_be_bytes());
    frame[4] = checksum(&frame) | if forward { DIRECTION_BIT } else { 0 };
    frame
}

/// Stateful decoder for the 5-byte step frames.
///
/// Each frame is one encoder step: a big-endian u32 microsecond timestamp
/// followed by a byte carrying the direction in its top bit and a 7-bit XOR
/// checksum of the timestamp bytes. The decoder keeps the running count and
/// extends the 32-bit timestamp across wraps.
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    last_timestamp: Option<u32>,
    wraps: u64,
    count: i64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn wraps(&self) -> u64 {
        self.wraps
    }

    pub fn decode(&mut self, frame: &[u8; FRAME_LEN]) -> Result<EncoderReading, ProtocolError> {
        if *frame == OVERFLOW_MARKER {
            return Err(ProtocolError::DeviceOverflow);
        }
        let calculated = checksum(frame);
        let received = frame[4] & CHECKSUM_MASK;
        if calculated != received {
            return Err(ProtocolError::Checksum { calculated, received });
        }

        let timestamp = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if self.last_timestamp.is_some_and(|last| timestamp < last) {
            self.wraps += 1;
            tracing::info!("Device timestamp wrapped ({} total)", self.wraps);
        }
        self.last_timestamp = Some(timestamp);

        if frame[4] & DIRECTION_BIT != 0 {
            self.count += 1;
        } else {
            self.count -= 1;
        }

        Ok(EncoderReading {
            device_micros: self.wraps * WRAP + timestamp as u64,
            raw_count: self.count,
            drift_micros: None,
        })
    }
}

/// Parses one line of a recorder CSV capture.
///
/// Accepts `Timestamp_us,Total_Time_us,Count` and `Total_Time_us,Count`
/// rows. Header and blank lines yield `Ok(None)`.
pub fn parse_csv_line(line: &str) -> Result<Option<EncoderReading>, ProtocolError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let (total, count) = match fields.as_slice() {
        [_, total, count] | [total, count] => (total, count),
        _ => return Err(ProtocolError::Csv(line.to_string())),
    };
    let device_micros = total.parse().map_err(|_| ProtocolError::Csv(line.to_string()))?;
    let raw_count = count.parse().map_err(|_| ProtocolError::Csv(line.to_string()))?;
    Ok(Some(EncoderReading {
        device_micros,
        raw_count,
        drift_micros: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_counts_steps() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&encode_frame(100, true)).unwrap().raw_count, 1);
        assert_eq!(decoder.decode(&encode_frame(200, true)).unwrap().raw_count, 2);
        let reading = decoder.decode(&encode_frame(300, false)).unwrap();
        assert_eq!(reading.raw_count, 1);
        assert_eq!(reading.device_micros, 300);
    }

    #[test]
    fn test_checksum_mismatch_is_rejected() {
        let mut frame = encode_frame(0x0102_0304, true);
        frame[2] ^= 0x10;
        let err = FrameDecoder::new().decode(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::Checksum { .. }));
    }

    #[test]
    fn test_overflow_marker_checked_first() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&[0xFF; 5]), Err(ProtocolError::DeviceOverflow));
        assert_eq!(decoder.count(), 0);
    }

    #[test]
    fn test_timestamp_wrap_extends_device_time() {
        let mut decoder = FrameDecoder::new();
        decoder.decode(&encode_frame(u32::MAX - 10, true)).unwrap();
        let reading = decoder.decode(&encode_frame(5, true)).unwrap();
        assert_eq!(decoder.wraps(), 1);
        assert_eq!(reading.device_micros, (1u64 << 32) + 5);
    }

    #[test]
    fn test_csv_lines() {
        assert_eq!(parse_csv_line("Timestamp_us,Total_Time_us,Count"), Ok(None));
        assert_eq!(parse_csv_line(""), Ok(None));
        assert_eq!(
            parse_csv_line("123,4294967400,-7").unwrap().unwrap(),
            EncoderReading {
                device_micros: 4_294_967_400,
                raw_count: -7,
                drift_micros: None,
            }
        );
        assert_eq!(parse_csv_line("500, 3").unwrap().unwrap().device_micros, 500);
        assert!(parse_csv_line("1,2,3,4").is_err());
        assert!(parse_csv_line("1,x").is_err());
    }
}
