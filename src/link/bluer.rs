//! BlueZ D-Bus backend for plant sensor connections.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running. Characteristics
//! are located by UUID after GATT service resolution.

use super::{Characteristic, DeviceLink, LinkError, Session};
use crate::mac_address::MacAddress;
use bluer::gatt::WriteOp;
use bluer::gatt::remote::{self, CharacteristicWriteRequest};
use bluer::{Adapter, Device};
use futures::{FutureExt, TryFutureExt};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How long to wait for BlueZ to finish GATT service discovery.
const SERVICE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICE_RESOLVE_POLL: Duration = Duration::from_millis(100);

fn backend_error(err: bluer::Error) -> LinkError {
    LinkError::Backend(err.to_string())
}

fn transport_error(err: bluer::Error) -> LinkError {
    LinkError::Transport(err.to_string())
}

/// Device link backed by a BlueZ adapter.
pub struct BluerLink {
    // keeps the D-Bus connection alive for the adapter handle
    _session: bluer::Session,
    adapter: Adapter,
}

impl BluerLink {
    /// Connect to BlueZ and power on adapter `hci<interface>`.
    pub async fn open(interface: u16) -> Result<Self, LinkError> {
        let session = bluer::Session::new().await.map_err(backend_error)?;
        let adapter = session
            .adapter(&format!("hci{interface}"))
            .map_err(backend_error)?;
        adapter.set_powered(true).await.map_err(backend_error)?;
        debug!("using Bluetooth adapter {}", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
        })
    }

    async fn open_session(&self, address: MacAddress) -> Result<BluerSession, LinkError> {
        let unreachable = |err: bluer::Error| LinkError::Unreachable(address, err.to_string());

        let device = self.adapter.device(address.into()).map_err(backend_error)?;
        if !device.is_connected().await.map_err(unreachable)? {
            device.connect().await.map_err(unreachable)?;
        }
        debug!("connected to device {}", address);

        let resolved = async {
            wait_for_services(&device, address).await?;
            find_characteristics(&device).await
        }
        .await;
        let characteristics = disconnect_on_error(address, resolved, || {
            device.disconnect().map_err(transport_error)
        })
        .await?;

        Ok(BluerSession {
            device,
            characteristics,
        })
    }
}

/// Pass `result` through, closing the connection first when it is an error.
async fn disconnect_on_error<T, F, Fut>(
    address: MacAddress,
    result: Result<T, LinkError>,
    disconnect: F,
) -> Result<T, LinkError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), LinkError>>,
{
    if result.is_err()
        && let Err(err) = disconnect().await
    {
        debug!("disconnecting from {} failed: {}", address, err);
    }
    result
}

async fn wait_for_services(device: &Device, address: MacAddress) -> Result<(), LinkError> {
    let resolve = async {
        loop {
            match device.is_services_resolved().await {
                Ok(true) => return Ok(()),
                Ok(false) => tokio::time::sleep(SERVICE_RESOLVE_POLL).await,
                Err(err) => return Err(transport_error(err)),
            }
        }
    };

    tokio::time::timeout(SERVICE_RESOLVE_TIMEOUT, resolve)
        .await
        .map_err(|_| {
            LinkError::Unreachable(address, "timed out resolving GATT services".to_string())
        })?
}

/// Map every known characteristic UUID to its remote handle.
async fn find_characteristics(
    device: &Device,
) -> Result<HashMap<Characteristic, remote::Characteristic>, LinkError> {
    let wanted = [
        Characteristic::Control,
        Characteristic::Environment,
        Characteristic::Identity,
    ];
    let mut found = HashMap::new();

    for service in device.services().await.map_err(transport_error)? {
        for characteristic in service.characteristics().await.map_err(transport_error)? {
            let uuid = characteristic
                .uuid()
                .await
                .map_err(transport_error)?
                .to_string();
            if let Some(kind) = wanted.iter().find(|c| c.uuid() == uuid) {
                found.insert(*kind, characteristic);
            }
        }
    }

    match wanted.iter().find(|c| !found.contains_key(*c)) {
        Some(missing) => Err(LinkError::CharacteristicNotFound(*missing)),
        None => Ok(found),
    }
}

impl DeviceLink for BluerLink {
    fn connect(&self, address: MacAddress) -> BoxFuture<'_, Result<Box<dyn Session>, LinkError>> {
        async move {
            let session = self.open_session(address).await?;
            Ok(Box::new(session) as Box<dyn Session>)
        }
        .boxed()
    }
}

/// A connected device with its characteristics resolved.
struct BluerSession {
    device: Device,
    characteristics: HashMap<Characteristic, remote::Characteristic>,
}

impl BluerSession {
    fn characteristic(
        &self,
        characteristic: Characteristic,
    ) -> Result<&remote::Characteristic, LinkError> {
        self.characteristics
            .get(&characteristic)
            .ok_or(LinkError::CharacteristicNotFound(characteristic))
    }
}

impl Session for BluerSession {
    fn read(&self, characteristic: Characteristic) -> BoxFuture<'_, Result<Vec<u8>, LinkError>> {
        async move {
            self.characteristic(characteristic)?
                .read()
                .await
                .map_err(transport_error)
        }
        .boxed()
    }

    fn write<'a>(
        &'a self,
        characteristic: Characteristic,
        value: &'a [u8],
        wait_for_ack: bool,
    ) -> BoxFuture<'a, Result<(), LinkError>> {
        async move {
            let mut request = CharacteristicWriteRequest::default();
            request.op_type = if wait_for_ack {
                WriteOp::Request
            } else {
                WriteOp::Command
            };
            self.characteristic(characteristic)?
                .write_ext(value, &request)
                .await
                .map_err(transport_error)
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), LinkError>> {
        async move { self.device.disconnect().await.map_err(transport_error) }.boxed()
    }
}
