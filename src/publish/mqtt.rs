//! MQTT broker connection on top of `rumqttc`.

use super::{BusClient, PublishError};
use crate::config::MqttSettings;
use futures::FutureExt;
use futures::future::BoxFuture;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 10;

/// Connection state shared with the event loop task.
#[derive(Default)]
struct ConnectionState {
    connected: AtomicBool,
    changed: Notify,
}

impl ConnectionState {
    fn set(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn get(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn wait_for(&self, connected: bool) {
        loop {
            let changed = self.changed.notified();
            if self.get() == connected {
                return;
            }
            changed.await;
        }
    }
}

/// A broker connection. The event loop is started by the first
/// [`BusClient::connect`] call and keeps reconnecting until disconnected.
pub struct MqttBus {
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    state: Arc<ConnectionState>,
    server: String,
}

impl MqttBus {
    pub fn new(settings: &MqttSettings) -> Self {
        let mut options = MqttOptions::new(&settings.client_id, &settings.server, settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some(user) = &settings.user {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            state: Arc::new(ConnectionState::default()),
            server: format!("{}:{}", settings.server, settings.port),
        }
    }

    fn start_event_loop(&self) {
        let eventloop = match self.eventloop.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(eventloop) = eventloop else {
            return;
        };
        tokio::spawn(drive(eventloop, self.state.clone()));
    }
}

/// Poll the event loop, tracking connection state, until a disconnect is sent.
async fn drive(mut eventloop: EventLoop, state: Arc<ConnectionState>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("MQTT connection established");
                    state.set(true);
                } else {
                    warn!("MQTT connection refused: {:?}", ack.code);
                    state.set(false);
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("MQTT connection terminated by broker");
                state.set(false);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("disconnected MQTT connection");
                state.set(false);
                return;
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(err) => {
                error!("MQTT connection error: {}", err);
                state.set(false);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

impl BusClient for MqttBus {
    fn connect(&self) -> BoxFuture<'_, Result<(), PublishError>> {
        async move {
            if self.state.get() {
                return Ok(());
            }
            debug!("connecting to MQTT broker {}", self.server);
            self.start_event_loop();
            tokio::time::timeout(CONNECT_TIMEOUT, self.state.wait_for(true))
                .await
                .map_err(|_| PublishError::NotConnected)
        }
        .boxed()
    }

    fn is_connected(&self) -> bool {
        self.state.get()
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        retain: bool,
    ) -> BoxFuture<'a, Result<(), PublishError>> {
        async move {
            self.client
                .publish(topic, QoS::AtLeastOnce, retain, payload)
                .await
                .map_err(|err| PublishError::Transport(err.to_string()))
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), PublishError>> {
        async move {
            if !self.state.get() {
                return Ok(());
            }
            self.client
                .disconnect()
                .await
                .map_err(|err| PublishError::Transport(err.to_string()))?;
            // queued publishes are flushed before the disconnect goes out
            if tokio::time::timeout(CONNECT_TIMEOUT, self.state.wait_for(false))
                .await
                .is_err()
            {
                warn!("timed out waiting for MQTT disconnect");
            }
            Ok(())
        }
        .boxed()
    }
}
