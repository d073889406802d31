//! Bluetooth LE link abstraction for plant sensors.
//!
//! The acquisition pipeline only needs to connect to a device, write one
//! characteristic and read two others. This module defines that narrow
//! interface as the [`DeviceLink`] and [`Session`] traits, with one
//! implementation per compiled-in backend.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "l2cap")]
pub mod l2cap;

use crate::mac_address::MacAddress;
use futures::future::BoxFuture;
use thiserror::Error;

/// Error types for device link operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// The device could not be reached or refused the connection
    #[error("device {0} unreachable: {1}")]
    Unreachable(MacAddress, String),
    /// Radio-level failure during a read or write
    #[error("transport error: {0}")]
    Transport(String),
    /// The device does not expose the requested characteristic
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Characteristic),
    /// Adapter or backend failure unrelated to a single device
    #[error("Bluetooth error: {0}")]
    Backend(String),
}

impl LinkError {
    /// Whether the error is a transient radio failure worth retrying.
    pub fn is_transport(&self) -> bool {
        matches!(self, LinkError::Transport(_))
    }
}

/// Characteristic slots used by the plant sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// Mode register; writing [`MEASURE_COMMAND`] requests a fresh reading
    Control,
    /// Temperature, brightness, moisture and conductivity
    Environment,
    /// Battery level and firmware version
    Identity,
}

impl Characteristic {
    /// ATT attribute handle of the characteristic value.
    pub fn handle(self) -> u16 {
        match self {
            Characteristic::Control => 0x33,
            Characteristic::Environment => 0x35,
            Characteristic::Identity => 0x38,
        }
    }

    /// 128-bit UUID of the characteristic.
    pub fn uuid(self) -> &'static str {
        match self {
            Characteristic::Control => "00001a00-0000-1000-8000-00805f9b34fb",
            Characteristic::Environment => "00001a01-0000-1000-8000-00805f9b34fb",
            Characteristic::Identity => "00001a02-0000-1000-8000-00805f9b34fb",
        }
    }
}

impl std::fmt::Display for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Characteristic::Control => "control",
            Characteristic::Environment => "environment",
            Characteristic::Identity => "identity",
        };
        write!(f, "{name} (0x{:02x})", self.handle())
    }
}

/// Command written to [`Characteristic::Control`] before reading the
/// environment slot.
pub const MEASURE_COMMAND: [u8; 2] = [0xA0, 0x1F];

/// An open connection to one device.
///
/// Calls are issued sequentially by the reader; implementations serialize
/// them internally when the underlying transport requires it.
pub trait Session: Send + Sync {
    fn read(&self, characteristic: Characteristic) -> BoxFuture<'_, Result<Vec<u8>, LinkError>>;

    fn write<'a>(
        &'a self,
        characteristic: Characteristic,
        value: &'a [u8],
        wait_for_ack: bool,
    ) -> BoxFuture<'a, Result<(), LinkError>>;

    fn disconnect(&self) -> BoxFuture<'_, Result<(), LinkError>>;
}

/// Opens sessions to devices by address.
pub trait DeviceLink: Send + Sync {
    fn connect(&self, address: MacAddress)
    -> BoxFuture<'_, Result<Box<dyn Session>, LinkError>>;
}

/// Available link backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw L2CAP socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "l2cap")]
    L2cap,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "l2cap", not(feature = "bluer")))]
        return Backend::L2cap;
        #[cfg(not(any(feature = "bluer", feature = "l2cap")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "l2cap")]
            Backend::L2cap => write!(f, "l2cap"),
            #[cfg(not(any(feature = "bluer", feature = "l2cap")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "l2cap")]
            "l2cap" | "raw" => Ok(Backend::L2cap),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Open the link for the selected backend on adapter `hci<interface>`.
pub async fn open(backend: Backend, interface: u16) -> Result<Box<dyn DeviceLink>, LinkError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Ok(Box::new(bluer::BluerLink::open(interface).await?)),
        #[cfg(feature = "l2cap")]
        Backend::L2cap => {
            if interface != 0 {
                tracing::warn!("the l2cap backend always uses the default adapter, ignoring hci{interface}");
            }
            Ok(Box::new(l2cap::L2capLink::new()))
        }
    }
}
