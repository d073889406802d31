//! Republishing measurements on the message bus.
//!
//! [`Publisher`] is what the scheduler talks to. [`MqttPublisher`] turns a
//! measurement into a topic and a JSON payload and hands both to a
//! [`BusClient`], which is either a real broker connection ([`mqtt::MqttBus`])
//! or the dry-run [`console::ConsoleBus`].

pub mod console;
pub mod mqtt;

use crate::measurement::Measurement;
use crate::sensor::SensorIdentity;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

/// Timestamp layout used when no `timestamp_format` is configured.
pub const ISO_TIMESTAMP: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Errors returned while publishing a measurement.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The broker connection is not (yet) established
    #[error("not connected to MQTT broker")]
    NotConnected,
    /// The client rejected the request or the connection failed
    #[error("MQTT error: {0}")]
    Transport(String),
    /// The payload could not be encoded
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Low-level message bus. Every publish uses QoS 1 (at least once).
pub trait BusClient: Send + Sync {
    /// Establish the connection. Succeeds without doing anything when
    /// already connected.
    fn connect(&self) -> BoxFuture<'_, Result<(), PublishError>>;

    fn is_connected(&self) -> bool;

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        retain: bool,
    ) -> BoxFuture<'a, Result<(), PublishError>>;

    fn disconnect(&self) -> BoxFuture<'_, Result<(), PublishError>>;
}

impl<T: BusClient + ?Sized> BusClient for &T {
    fn connect(&self) -> BoxFuture<'_, Result<(), PublishError>> {
        (**self).connect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        retain: bool,
    ) -> BoxFuture<'a, Result<(), PublishError>> {
        (**self).publish(topic, payload, retain)
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), PublishError>> {
        (**self).disconnect()
    }
}

/// Republishes one sensor's measurement.
pub trait Publisher: Send + Sync {
    fn publish<'a>(
        &'a self,
        sensor: &'a SensorIdentity,
        measurement: &'a Measurement,
    ) -> BoxFuture<'a, Result<(), PublishError>>;
}

/// Topic layout and payload options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicOptions {
    pub prefix: String,
    pub trailing_slash: bool,
    /// strftime pattern for the `timestamp` field; ISO-8601 when `None`
    pub timestamp_format: Option<String>,
}

impl TopicOptions {
    /// `{prefix}/{alias or address}`, plus `/` when `trailing_slash` is set.
    pub fn topic_for(&self, sensor: &SensorIdentity) -> String {
        let mut topic = format!("{}/{}", self.prefix, sensor.topic_name());
        if self.trailing_slash {
            topic.push('/');
        }
        topic
    }
}

#[derive(Serialize)]
struct Payload {
    battery: u8,
    temperature: String,
    brightness: u16,
    moisture: u8,
    conductivity: u16,
    timestamp: String,
}

/// Encode a measurement as the flat JSON object consumers expect.
///
/// The temperature is a string with exactly one decimal digit.
pub fn encode_payload(
    measurement: &Measurement,
    timestamp_format: Option<&str>,
) -> Result<Vec<u8>, PublishError> {
    let timestamp = measurement
        .timestamp
        .format(timestamp_format.unwrap_or(ISO_TIMESTAMP))
        .to_string();
    let payload = Payload {
        battery: measurement.battery,
        temperature: format!("{:.1}", measurement.temperature),
        brightness: measurement.brightness,
        moisture: measurement.moisture,
        conductivity: measurement.conductivity,
        timestamp,
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Publisher that sends retained JSON messages over a [`BusClient`].
pub struct MqttPublisher<B> {
    bus: B,
    options: TopicOptions,
}

impl<B: BusClient> MqttPublisher<B> {
    pub fn new(bus: B, options: TopicOptions) -> Self {
        Self { bus, options }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    async fn ensure_connected(&self) -> Result<(), PublishError> {
        if !self.bus.is_connected() {
            self.bus.connect().await?;
            if !self.bus.is_connected() {
                return Err(PublishError::NotConnected);
            }
        }
        Ok(())
    }
}

impl<B: BusClient> Publisher for MqttPublisher<B> {
    fn publish<'a>(
        &'a self,
        sensor: &'a SensorIdentity,
        measurement: &'a Measurement,
    ) -> BoxFuture<'a, Result<(), PublishError>> {
        async move {
            let payload = encode_payload(measurement, self.options.timestamp_format.as_deref())?;
            let topic = self.options.topic_for(sensor);

            self.ensure_connected().await?;
            self.bus.publish(&topic, payload, true).await?;
            info!("sent data to topic {}", topic);
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac_address::MacAddress;
    use crate::test_utils::{RecordingBus, TEST_MAC, measurement};
    use chrono::{Local, TimeZone};
    use serde_json::Value;

    fn options() -> TopicOptions {
        TopicOptions {
            prefix: "plants".to_string(),
            trailing_slash: true,
            timestamp_format: None,
        }
    }

    #[test]
    fn test_topic_uses_alias_and_trailing_slash() {
        let basil = SensorIdentity::new(TEST_MAC, Some("basil".to_string()));
        assert_eq!(options().topic_for(&basil), "plants/basil/");

        let mut no_slash = options();
        no_slash.trailing_slash = false;
        assert_eq!(no_slash.topic_for(&basil), "plants/basil");
    }

    #[test]
    fn test_topic_falls_back_to_address() {
        let anonymous = SensorIdentity::new(MacAddress([0xC4, 0x7C, 0x8D, 0, 0, 1]), None);
        assert_eq!(options().topic_for(&anonymous), "plants/C4:7C:8D:00:00:01/");
    }

    #[test]
    fn test_payload_fields() {
        let mut m = measurement();
        m.timestamp = Local.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();

        let payload = encode_payload(&m, None).unwrap();
        let json: Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(json["battery"], 98);
        assert_eq!(json["temperature"], "20.6");
        assert_eq!(json["brightness"], 53);
        assert_eq!(json["moisture"], 28);
        assert_eq!(json["conductivity"], 200);
        assert_eq!(json["timestamp"], "2024-05-17T08:30:00.000000");
    }

    #[test]
    fn test_temperature_always_has_one_decimal() {
        let mut m = measurement();
        m.temperature = 21.0;
        let json: Value = serde_json::from_slice(&encode_payload(&m, None).unwrap()).unwrap();
        assert_eq!(json["temperature"], "21.0");

        m.temperature = -3.2;
        let json: Value = serde_json::from_slice(&encode_payload(&m, None).unwrap()).unwrap();
        assert_eq!(json["temperature"], "-3.2");
    }

    #[test]
    fn test_custom_timestamp_format() {
        let mut m = measurement();
        m.timestamp = Local.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();

        let payload = encode_payload(&m, Some("%d.%m.%Y %H:%M")).unwrap();
        let json: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["timestamp"], "17.05.2024 08:30");
    }

    #[tokio::test]
    async fn test_publish_connects_lazily_and_retains() {
        let publisher = MqttPublisher::new(RecordingBus::default(), options());
        assert!(!publisher.bus().is_connected());

        let basil = SensorIdentity::new(TEST_MAC, Some("basil".to_string()));
        publisher.publish(&basil, &measurement()).await.unwrap();

        assert_eq!(publisher.bus().connect_calls(), 1);
        let sent = publisher.bus().messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "plants/basil/");
        assert!(sent[0].retain);

        // second publish reuses the connection
        publisher.publish(&basil, &measurement()).await.unwrap();
        assert_eq!(publisher.bus().connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_publish_fails_when_broker_unreachable() {
        let publisher = MqttPublisher::new(RecordingBus::unreachable(), options());
        let basil = SensorIdentity::new(TEST_MAC, None);

        let err = publisher
            .publish(&basil, &measurement())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::NotConnected));
        assert!(publisher.bus().messages().is_empty());
    }
}
