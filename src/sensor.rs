//! Sensor identities and per-sensor failure policy.
//!
//! A sensor is identified by its hardware address and an optional
//! human-readable alias. The alias is what ends up in the MQTT topic, so
//! `C4:7C:8D:60:D6:1C=basil` publishes under `<prefix>/basil/`.

use crate::mac_address::MacAddress;
use serde::{Deserialize, Deserializer};
use std::fmt;

/// Hardware address plus optional alias of one plant sensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SensorIdentity {
    address: MacAddress,
    alias: Option<String>,
}

impl SensorIdentity {
    pub fn new(address: MacAddress, alias: Option<String>) -> Self {
        // an empty alias would yield a topic like "plants//"
        let alias = alias.filter(|a| !a.trim().is_empty());
        Self { address, alias }
    }

    pub fn address(&self) -> MacAddress {
        self.address
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The name used in topics: the alias when set, the address otherwise.
    pub fn topic_name(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => self.address.to_string(),
        }
    }
}

impl fmt::Display for SensorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{alias}"),
            None => write!(f, "{}", self.address),
        }
    }
}

/// What to do once a sensor has failed a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Report failures as warnings only, never on the operator console.
    pub fail_silent: bool,
}

/// A configured sensor: who it is and how loudly it may fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorConfig {
    pub identity: SensorIdentity,
    pub policy: RetryPolicy,
}

impl SensorConfig {
    pub fn new(address: MacAddress, alias: Option<String>, fail_silent: bool) -> Self {
        Self {
            identity: SensorIdentity::new(address, alias),
            policy: RetryPolicy { fail_silent },
        }
    }
}

impl fmt::Display for SensorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity)?;
        if self.policy.fail_silent {
            write!(f, " (fail silent)")?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct RawSensor {
    mac: MacAddress,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default, deserialize_with = "presence_flag")]
    fail_silent: bool,
}

/// A bare `fail_silent:` key (YAML null) counts as enabled; an explicit
/// boolean is taken as written.
pub(crate) fn presence_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(true))
}

impl<'de> Deserialize<'de> for SensorConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawSensor::deserialize(deserializer)?;
        Ok(SensorConfig::new(raw.mac, raw.alias, raw.fail_silent))
    }
}

/// Parse a sensor from the command line in the format `MAC[=ALIAS]`.
///
/// # Example
/// ```
/// use plant_gateway::sensor::parse_sensor;
///
/// let sensor = parse_sensor("C4:7C:8D:60:D6:1C=basil").unwrap();
/// assert_eq!(sensor.identity.topic_name(), "basil");
/// assert!(!sensor.policy.fail_silent);
/// ```
pub fn parse_sensor(src: &str) -> Result<SensorConfig, String> {
    let (address, alias) = match src.split_once('=') {
        Some((address, alias)) => (address, Some(alias.to_string())),
        None => (src, None),
    };
    let address: MacAddress = address
        .parse()
        .map_err(|e| format!("invalid sensor '{src}': {e}"))?;
    Ok(SensorConfig::new(address, alias, false))
}

/// Render a list of sensors for log lines, e.g. `basil, C4:7C:8D:60:D6:1C (fail silent)`.
pub fn name_list(sensors: &[SensorConfig]) -> String {
    sensors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
