//! Reading one complete measurement from a plant sensor.
//!
//! The sequence is fixed by the device firmware:
//!
//! 1. connect
//! 2. write the measure command to the control characteristic
//! 3. read the environment characteristic
//! 4. read the identity characteristic
//!
//! Steps 2 to 4 are each retried on transport errors according to the
//! configured [`OperationRetry`]. A "no valid reading" answer in step 3 ends
//! the attempt at once.

use crate::decoder::{self, DecodeError, HexBytes};
use crate::link::{Characteristic, DeviceLink, LinkError, MEASURE_COMMAND, Session};
use crate::measurement::Measurement;
use crate::retry::OperationRetry;
use crate::sensor::SensorIdentity;
use chrono::Local;
use thiserror::Error;
use tracing::debug;

/// Errors returned by [`DeviceReader::read_measurement`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadError {
    /// Link failure that survived the per-operation retries
    #[error("device error: {cause}")]
    Device { cause: LinkError },
    /// The sensor returned its "no valid reading" pattern
    #[error("invalid data received")]
    InvalidReading,
    /// A payload could not be decoded
    #[error("decode error: {0}")]
    Decode(DecodeError),
}

impl From<LinkError> for ReadError {
    fn from(cause: LinkError) -> Self {
        ReadError::Device { cause }
    }
}

impl From<DecodeError> for ReadError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::InvalidReading => ReadError::InvalidReading,
            other => ReadError::Decode(other),
        }
    }
}

/// Reads measurements through a [`DeviceLink`].
pub struct DeviceReader<'a> {
    link: &'a dyn DeviceLink,
    retry: OperationRetry,
}

impl<'a> DeviceReader<'a> {
    pub fn new(link: &'a dyn DeviceLink, retry: OperationRetry) -> Self {
        Self { link, retry }
    }

    /// Connect to the sensor and read a fresh measurement.
    ///
    /// The connection is closed again whether or not the read succeeded.
    pub async fn read_measurement(
        &self,
        identity: &SensorIdentity,
    ) -> Result<Measurement, ReadError> {
        let address = identity.address();
        let session = self.link.connect(address).await?;
        debug!("connected to device {}", address);

        let result = self.read_session(session.as_ref()).await;

        if let Err(err) = session.disconnect().await {
            debug!("disconnecting from {} failed: {}", address, err);
        }
        result
    }

    async fn read_session(&self, session: &dyn Session) -> Result<Measurement, ReadError> {
        self.retry
            .run("write measure command", || {
                session.write(Characteristic::Control, &MEASURE_COMMAND, true)
            })
            .await?;

        let raw = self
            .retry
            .run("read environment", || session.read(Characteristic::Environment))
            .await?;
        debug!(
            "raw data for {}: {}",
            Characteristic::Environment,
            HexBytes(&raw)
        );
        if decoder::is_invalid_reading(&raw) {
            debug!("invalid data received");
            return Err(ReadError::InvalidReading);
        }
        let environment = decoder::decode_environment(&raw)?;

        let raw = self
            .retry
            .run("read identity", || session.read(Characteristic::Identity))
            .await?;
        debug!(
            "raw data for {}: {}",
            Characteristic::Identity,
            HexBytes(&raw)
        );
        let identity = decoder::decode_identity(&raw)?;

        debug!(
            "battery: {}, version: {}, temperature: {:.1}, brightness: {}, moisture: {}, conductivity: {}",
            identity.battery,
            identity.version,
            environment.temperature,
            environment.brightness,
            environment.moisture,
            environment.conductivity
        );

        Ok(Measurement {
            battery: identity.battery,
            version: identity.version,
            temperature: environment.temperature,
            brightness: environment.brightness,
            moisture: environment.moisture,
            conductivity: environment.conductivity,
            timestamp: Local::now(),
        })
    }
}
