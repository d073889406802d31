//! `plant-gateway` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing and process exit codes.
//! The core “business logic” lives in [`crate::app`] where it can be tested
//! deterministically with an injected device link, message bus and output streams.

pub mod app;
pub mod config;
pub mod decoder;
pub mod duration;
pub mod link;
pub mod logging;
pub mod mac_address;
pub mod measurement;
pub mod publish;
pub mod reader;
pub mod retry;
pub mod scheduler;
pub mod sensor;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types at the crate root
pub use config::{ConfigError, Settings};
pub use decoder::{DecodeError, decode_environment, decode_identity};
pub use duration::parse_duration;
pub use link::{Backend, Characteristic, DeviceLink, LinkError, Session};
pub use mac_address::MacAddress;
pub use measurement::Measurement;
pub use publish::{BusClient, MqttPublisher, PublishError, Publisher, TopicOptions};
pub use reader::{DeviceReader, ReadError};
pub use retry::{OperationRetry, RoundBackoff};
pub use scheduler::{AcquisitionOutcome, Scheduler};
pub use sensor::{SensorConfig, SensorIdentity, parse_sensor};
