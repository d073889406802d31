//! Core application runner (business logic) for `plant-gateway`.
//!
//! This module is decoupled from CLI parsing and process exit codes so it
//! can be tested deterministically with an injected link, bus and shutdown
//! signal.

use crate::config::{ConfigError, DEFAULT_CONFIG_PATH, Settings};
use crate::link::{Backend, DeviceLink, LinkError};
use crate::publish::console::ConsoleBus;
use crate::publish::mqtt::MqttBus;
use crate::publish::{BusClient, MqttPublisher, PublishError, TopicOptions};
use crate::reader::DeviceReader;
use crate::scheduler::Scheduler;
use crate::sensor::{SensorConfig, name_list, parse_sensor};
use clap::Parser;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// Command line options.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Path of the YAML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Bluetooth backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Keep running and poll all sensors every interval.
    /// Accepts duration with suffix: 30s, 10m, 1h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, value_parser = crate::duration::parse_duration)]
    pub interval: Option<Duration>,

    /// Print topics and payloads to stdout instead of publishing them
    #[arg(long)]
    pub dry_run: bool,

    /// Poll only this sensor instead of the configured ones.
    /// Format: --sensor C4:7C:8D:60:D6:1C=basil
    #[arg(long = "sensor", value_parser = parse_sensor, value_name = "SENSOR")]
    pub sensors: Vec<SensorConfig>,

    /// Verbose output, enables debug logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Opens the Bluetooth link, so tests can run without hardware.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        backend: Backend,
        interface: u16,
    ) -> BoxFuture<'_, Result<Box<dyn DeviceLink>, LinkError>>;
}

/// Connector that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealConnector;

impl Connector for RealConnector {
    fn open(
        &self,
        backend: Backend,
        interface: u16,
    ) -> BoxFuture<'_, Result<Box<dyn DeviceLink>, LinkError>> {
        crate::link::open(backend, interface).boxed()
    }
}

/// Load the configuration file named on the command line.
pub fn load_settings(options: &Options) -> Result<Settings, RunError> {
    Ok(Settings::load(&options.config)?)
}

/// Set up logging as configured; `-v` forces debug output.
pub fn init_logging(options: &Options, settings: &Settings) -> Result<Option<WorkerGuard>, RunError> {
    Ok(crate::logging::init(
        settings.debug || options.verbose,
        settings.logfile.as_deref(),
    )?)
}

/// Run with the real Bluetooth link, the configured broker (or stdout for
/// `--dry-run`), stderr as the operator console and Ctrl-C as shutdown.
pub async fn run(options: Options, settings: Settings) -> Result<Vec<SensorConfig>, RunError> {
    let mut err = io::stderr();
    if options.dry_run {
        run_with_io(
            &options,
            &settings,
            &RealConnector,
            ConsoleBus::stdout(),
            &mut err,
            ctrl_c(),
        )
        .await
    } else {
        let bus = MqttBus::new(&settings.mqtt);
        run_with_io(&options, &settings, &RealConnector, bus, &mut err, ctrl_c()).await
    }
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
}

/// Run one acquisition cycle, or one per `options.interval` until `shutdown`
/// completes.
///
/// A `shutdown` during a cycle lets the sensor being read finish, so its
/// connection is closed, and skips the rest. Escalated failures are
/// written to `err`. Returns the sensors without
/// `fail_silent` that could not be published in the last completed cycle;
/// a loop ended by `shutdown` returns an empty list.
pub async fn run_with_io<B: BusClient>(
    options: &Options,
    settings: &Settings,
    connector: &dyn Connector,
    bus: B,
    err: &mut dyn Write,
    shutdown: impl Future<Output = ()>,
) -> Result<Vec<SensorConfig>, RunError> {
    let sensors = if options.sensors.is_empty() {
        settings.sensors.clone()
    } else {
        options.sensors.clone()
    };

    let link = connector.open(options.backend, settings.interface).await?;
    let publisher = MqttPublisher::new(
        bus,
        TopicOptions {
            prefix: settings.mqtt.prefix.clone(),
            trailing_slash: settings.mqtt.trailing_slash,
            timestamp_format: settings.mqtt.timestamp_format.clone(),
        },
    );
    let (stop, stopped) = watch::channel(false);
    let scheduler = Scheduler::new(
        DeviceReader::new(link.as_ref(), settings.retry.operation_retry()),
        &publisher,
        settings.retry.round_backoff(),
    )
    .with_stop(stopped);

    let mut shutdown = std::pin::pin!(shutdown);
    let escalated = loop {
        info!("polling sensor(s) {}", name_list(&sensors));
        let mut cycle = std::pin::pin!(scheduler.process_all(&sensors, &mut *err));
        let remaining = tokio::select! {
            remaining = &mut cycle => remaining,
            _ = &mut shutdown => {
                info!("finishing the current sensor before shutting down");
                stop.send_replace(true);
                cycle.await;
                break Vec::new();
            }
        };
        if !remaining.is_empty() {
            warn!("could not process sensor(s) {}", name_list(&remaining));
        }

        let Some(interval) = options.interval else {
            break remaining
                .into_iter()
                .filter(|s| !s.policy.fail_silent)
                .collect();
        };
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = &mut shutdown => break Vec::new(),
        }
    };

    info!("shutting down");
    publisher.bus().disconnect().await?;
    Ok(escalated)
}
