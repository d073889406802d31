//! Decoding of the raw characteristic payloads sent by the plant sensor.
//!
//! The sensor exposes its data in two characteristics:
//!
//! - the identity slot (battery level and firmware version, 7 bytes)
//! - the environment slot (temperature, brightness, moisture and
//!   conductivity, 16 bytes on the wire, of which the first 10 carry data)
//!
//! All multi-byte values are little-endian. Everything here is pure.

use std::fmt;
use thiserror::Error;

/// Minimum length of the identity payload.
pub const IDENTITY_LEN: usize = 7;

/// Minimum length of the environment payload.
pub const ENVIRONMENT_LEN: usize = 10;

/// Payload the sensor returns from the environment slot while it has no
/// valid reading.
pub const INVALID_READING: [u8; 16] = [
    0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x99, 0x88, 0x77, 0x66, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Error types for decoding sensor payloads.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Payload shorter than the fields it must contain
    #[error("payload too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    /// Firmware version bytes are not printable ASCII
    #[error("invalid firmware version: {0}")]
    InvalidVersion(String),
    /// The sensor answered with its "no data yet" pattern
    #[error("invalid data received")]
    InvalidReading,
}

/// Battery level and firmware version.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub battery: u8,
    pub version: String,
}

/// Environmental readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Environment {
    pub temperature: f64,
    pub brightness: u16,
    pub moisture: u8,
    pub conductivity: u16,
}

fn ensure_len(data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() < expected {
        return Err(DecodeError::TooShort {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Decode the identity payload.
///
/// Byte 0 is the battery level, taken as-is. Bytes 2 to 6 are the firmware
/// version as ASCII text.
pub fn decode_identity(data: &[u8]) -> Result<Identity, DecodeError> {
    ensure_len(data, IDENTITY_LEN)?;

    let raw_version = &data[2..7];
    if !raw_version.iter().all(|&b| matches!(b, b' '..=b'~')) {
        return Err(DecodeError::InvalidVersion(
            HexBytes(raw_version).to_string(),
        ));
    }

    Ok(Identity {
        battery: data[0],
        version: raw_version.iter().map(|&b| char::from(b)).collect(),
    })
}

/// Decode the environment payload.
///
/// Moisture is a single byte (byte 7) while every other field spans two
/// bytes. The hardware encodes it that way.
pub fn decode_environment(data: &[u8]) -> Result<Environment, DecodeError> {
    if is_invalid_reading(data) {
        return Err(DecodeError::InvalidReading);
    }
    ensure_len(data, ENVIRONMENT_LEN)?;

    Ok(Environment {
        temperature: decode_temperature([data[0], data[1]]),
        brightness: u16::from_le_bytes([data[3], data[4]]),
        moisture: data[7],
        conductivity: u16::from_le_bytes([data[8], data[9]]),
    })
}

/// Temperature in tenths of a degree.
///
/// Negative values carry bit 7 of the high byte. Their magnitude is stored
/// bit-inverted, so both bytes are flipped back before reading them; the
/// result is not the two's complement value.
fn decode_temperature(raw: [u8; 2]) -> f64 {
    let negative = raw[1] & 0x80 != 0;
    let bytes = if negative {
        [raw[0] ^ 0xFF, raw[1] ^ 0xFF]
    } else {
        raw
    };
    let tenths = f64::from(u16::from_le_bytes(bytes)) / 10.0;
    // 0xFFFF inverts to zero, which is reported as 0.0 rather than -0.0
    if negative && tenths != 0.0 { -tenths } else { tenths }
}

/// Whether `data` is the sensor's "no valid reading" pattern.
pub fn is_invalid_reading(data: &[u8]) -> bool {
    data == INVALID_READING
}

/// Display adapter printing bytes as space-separated lowercase hex.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ENVIRONMENT_PAYLOAD, IDENTITY_PAYLOAD};

    #[test]
    fn test_decode_identity() {
        let identity = decode_identity(&IDENTITY_PAYLOAD).unwrap();
        assert_eq!(identity.battery, 98);
        assert_eq!(identity.version, "2.8.6");
    }

    #[test]
    fn test_decode_environment() {
        let env = decode_environment(&ENVIRONMENT_PAYLOAD).unwrap();
        assert_eq!(env.temperature, 20.6);
        assert_eq!(env.brightness, 53);
        assert_eq!(env.moisture, 28);
        assert_eq!(env.conductivity, 200);
    }

    #[test]
    fn test_decode_is_deterministic() {
        assert_eq!(
            decode_environment(&ENVIRONMENT_PAYLOAD),
            decode_environment(&ENVIRONMENT_PAYLOAD)
        );
        assert_eq!(
            decode_identity(&IDENTITY_PAYLOAD),
            decode_identity(&IDENTITY_PAYLOAD)
        );
    }

    #[test]
    fn test_negative_temperature_uses_inverted_magnitude() {
        // 0xFFF5 inverted is 0x000A
        let mut data = ENVIRONMENT_PAYLOAD;
        data[0] = 0xF5;
        data[1] = 0xFF;
        let env = decode_environment(&data).unwrap();
        assert_eq!(env.temperature, -1.0);

        // two's complement would read 0xFF9C as -10.0; inverted it is -9.9
        data[0] = 0x9C;
        data[1] = 0xFF;
        let env = decode_environment(&data).unwrap();
        assert_eq!(env.temperature, -9.9);
    }

    #[test]
    fn test_high_bit_alone_marks_negative() {
        let mut data = ENVIRONMENT_PAYLOAD;
        data[0] = 0xFF;
        data[1] = 0x80;
        // inverted: 0x00, 0x7F -> 0x7F00 = 32512
        let env = decode_environment(&data).unwrap();
        assert_eq!(env.temperature, -3251.2);
    }

    #[test]
    fn test_moisture_is_single_byte() {
        let mut data = ENVIRONMENT_PAYLOAD;
        data[7] = 0x1C;
        data[8] = 0xFF;
        let env = decode_environment(&data).unwrap();
        assert_eq!(env.moisture, 28);
        assert_eq!(env.conductivity, 0x00FF);
    }

    #[test]
    fn test_invalid_reading_is_rejected() {
        assert_eq!(
            decode_environment(&INVALID_READING),
            Err(DecodeError::InvalidReading)
        );
        assert!(is_invalid_reading(&INVALID_READING));
        assert!(!is_invalid_reading(&ENVIRONMENT_PAYLOAD));
    }

    #[test]
    fn test_short_payloads() {
        assert_eq!(
            decode_environment(&ENVIRONMENT_PAYLOAD[..9]),
            Err(DecodeError::TooShort {
                expected: ENVIRONMENT_LEN,
                actual: 9
            })
        );
        assert_eq!(
            decode_identity(&IDENTITY_PAYLOAD[..6]),
            Err(DecodeError::TooShort {
                expected: IDENTITY_LEN,
                actual: 6
            })
        );
        assert!(decode_identity(&[]).is_err());
    }

    #[test]
    fn test_version_must_be_printable() {
        let mut data = IDENTITY_PAYLOAD;
        data[4] = 0x00;
        assert!(matches!(
            decode_identity(&data),
            Err(DecodeError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_version_may_contain_spaces() {
        let identity = decode_identity(&[0x62, 0x1d, 0x33, 0x2e, 0x32, 0x20, 0x31]).unwrap();
        assert_eq!(identity.version, "3.2 1");

        let mut data = IDENTITY_PAYLOAD;
        data[6] = 0x7F;
        assert!(decode_identity(&data).is_err());
    }

    #[test]
    fn test_inverted_zero_is_positive_zero() {
        let mut data = ENVIRONMENT_PAYLOAD;
        data[0] = 0xFF;
        data[1] = 0xFF;
        let env = decode_environment(&data).unwrap();
        assert_eq!(env.temperature, 0.0);
        assert!(env.temperature.is_sign_positive());
        assert_eq!(format!("{:.1}", env.temperature), "0.0");
    }

    #[test]
    fn test_battery_is_not_bounds_checked() {
        let mut data = IDENTITY_PAYLOAD;
        data[0] = 0xFF;
        assert_eq!(decode_identity(&data).unwrap().battery, 255);
    }

    #[test]
    fn test_hex_bytes() {
        assert_eq!(HexBytes(&[0xff, 0x00, 0x1b]).to_string(), "ff 00 1b");
        assert_eq!(HexBytes(&[]).to_string(), "");
    }

    #[test]
    fn test_decode_error_display() {
        assert_eq!(
            DecodeError::InvalidReading.to_string(),
            "invalid data received"
        );
        assert_eq!(
            DecodeError::TooShort {
                expected: 10,
                actual: 3
            }
            .to_string(),
            "payload too short: expected at least 10 bytes, got 3"
        );
    }
}
