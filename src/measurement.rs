//! Plant sensor measurement data structure.

use chrono::{DateTime, Local};

/// One complete reading of a plant sensor.
///
/// Units:
/// - Battery in percent (raw byte, nominally 0-100)
/// - Temperature in Celsius with one decimal of precision, may be negative
/// - Brightness in lux
/// - Moisture in percent
/// - Conductivity in µS/cm
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Battery level in percent
    pub battery: u8,
    /// Firmware version reported by the sensor, e.g. "3.2.1"
    pub version: String,
    /// Temperature in Celsius
    pub temperature: f64,
    /// Brightness in lux
    pub brightness: u16,
    /// Soil moisture in percent
    pub moisture: u8,
    /// Soil conductivity in µS/cm
    pub conductivity: u16,
    /// When the measurement was assembled
    pub timestamp: DateTime<Local>,
}
