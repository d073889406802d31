//! Fixtures and fake collaborators shared by the unit tests.

use crate::link::{Characteristic, DeviceLink, LinkError, Session};
use crate::mac_address::MacAddress;
use crate::measurement::Measurement;
use crate::publish::{BusClient, PublishError};
use crate::retry::OperationRetry;
use chrono::Local;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xC4, 0x7C, 0x8D, 0x60, 0xD6, 0x1C]);

/// Identity slot: battery 98 %, firmware "2.8.6".
pub const IDENTITY_PAYLOAD: [u8; 7] = [0x62, 0x1d, 0x32, 0x2e, 0x38, 0x2e, 0x36];

/// Environment slot: 20.6 °C, 53 lux, 28 % moisture, 200 µS/cm.
pub const ENVIRONMENT_PAYLOAD: [u8; 16] = [
    0xce, 0x00, 0x00, 0x35, 0x00, 0x00, 0x00, 0x1c, 0xc8, 0x00, 0x02, 0x3c, 0x00, 0xfb, 0x34,
    0x9b,
];

/// Per-operation retry with short delays, so paused-time tests stay readable.
pub fn fast_retry() -> OperationRetry {
    OperationRetry {
        attempts: 5,
        base_delay: Duration::from_millis(10),
    }
}

/// The measurement encoded by the two payload fixtures.
pub fn measurement() -> Measurement {
    Measurement {
        battery: 98,
        version: "2.8.6".to_string(),
        temperature: 20.6,
        brightness: 53,
        moisture: 28,
        conductivity: 200,
        timestamp: Local::now(),
    }
}

/// Operations recorded by [`FakeLink`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Connect,
    Write(Characteristic, Vec<u8>, bool),
    Read(Characteristic),
    Disconnect,
}

#[derive(Default)]
struct FakeDevice {
    payloads: HashMap<Characteristic, Vec<u8>>,
    read_failures: HashMap<Characteristic, u32>,
}

#[derive(Default)]
struct FakeState {
    devices: HashMap<MacAddress, FakeDevice>,
    ops: HashMap<MacAddress, Vec<Op>>,
}

/// Scripted in-memory device link.
///
/// Unknown addresses are unreachable. Known devices answer with the payload
/// fixtures unless told otherwise.
#[derive(Default, Clone)]
pub struct FakeLink {
    state: Arc<Mutex<FakeState>>,
}

impl FakeLink {
    pub fn healthy(address: MacAddress) -> Self {
        let link = Self::default();
        link.add_healthy(address);
        link
    }

    pub fn add_healthy(&self, address: MacAddress) {
        let mut device = FakeDevice::default();
        device
            .payloads
            .insert(Characteristic::Environment, ENVIRONMENT_PAYLOAD.to_vec());
        device
            .payloads
            .insert(Characteristic::Identity, IDENTITY_PAYLOAD.to_vec());
        self.state.lock().unwrap().devices.insert(address, device);
    }

    /// Make the next `count` reads of `characteristic` fail with a transport error.
    pub fn fail_reads(&self, address: MacAddress, characteristic: Characteristic, count: u32) {
        let mut state = self.state.lock().unwrap();
        let device = state.devices.entry(address).or_default();
        device.read_failures.insert(characteristic, count);
    }

    pub fn set_payload(&self, address: MacAddress, characteristic: Characteristic, data: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        let device = state.devices.entry(address).or_default();
        device.payloads.insert(characteristic, data);
    }

    pub fn ops(&self, address: MacAddress) -> Vec<Op> {
        let state = self.state.lock().unwrap();
        state.ops.get(&address).cloned().unwrap_or_default()
    }

    pub fn connect_attempts(&self, address: MacAddress) -> usize {
        self.ops(address)
            .iter()
            .filter(|op| **op == Op::Connect)
            .count()
    }

    fn record(&self, address: MacAddress, op: Op) {
        let mut state = self.state.lock().unwrap();
        state.ops.entry(address).or_default().push(op);
    }
}

impl DeviceLink for FakeLink {
    fn connect(&self, address: MacAddress) -> BoxFuture<'_, Result<Box<dyn Session>, LinkError>> {
        async move {
            self.record(address, Op::Connect);
            if !self.state.lock().unwrap().devices.contains_key(&address) {
                return Err(LinkError::Unreachable(
                    address,
                    "connection timed out".to_string(),
                ));
            }
            Ok(Box::new(FakeSession {
                link: self.clone(),
                address,
            }) as Box<dyn Session>)
        }
        .boxed()
    }
}

struct FakeSession {
    link: FakeLink,
    address: MacAddress,
}

impl Session for FakeSession {
    fn read(&self, characteristic: Characteristic) -> BoxFuture<'_, Result<Vec<u8>, LinkError>> {
        async move {
            self.link.record(self.address, Op::Read(characteristic));
            let mut state = self.link.state.lock().unwrap();
            let device = state
                .devices
                .get_mut(&self.address)
                .ok_or_else(|| LinkError::Transport("device went away".to_string()))?;

            if let Some(remaining) = device.read_failures.get_mut(&characteristic)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(LinkError::Transport("read timed out".to_string()));
            }
            device
                .payloads
                .get(&characteristic)
                .cloned()
                .ok_or(LinkError::CharacteristicNotFound(characteristic))
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
            self.link.record(
                self.address,
                Op::Write(characteristic, value.to_vec(), wait_for_ack),
            );
            Ok(())
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), LinkError>> {
        async move {
            self.link.record(self.address, Op::Disconnect);
            Ok(())
        }
        .boxed()
    }
}

/// A message captured by [`RecordingBus`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
    pub sent_at: Instant,
}

/// In-memory bus that records every publish.
#[derive(Default)]
pub struct RecordingBus {
    unreachable: bool,
    connected: AtomicBool,
    connects: AtomicUsize,
    messages: Mutex<Vec<SentMessage>>,
}

impl RecordingBus {
    /// A bus whose broker never acknowledges the connection.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.messages.lock().unwrap().clone()
    }
}

impl BusClient for RecordingBus {
    fn connect(&self) -> BoxFuture<'_, Result<(), PublishError>> {
        async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.unreachable {
                self.connected.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
        .boxed()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        retain: bool,
    ) -> BoxFuture<'a, Result<(), PublishError>> {
        async move {
            if !self.is_connected() {
                return Err(PublishError::NotConnected);
            }
            self.messages.lock().unwrap().push(SentMessage {
                topic: topic.to_string(),
                payload,
                retain,
                sent_at: Instant::now(),
            });
            Ok(())
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), PublishError>> {
        async move {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }
}
