//! Batch acquisition across all configured sensors.
//!
//! Sensors are read one after another in rounds. A sensor that fails is kept
//! for the next round, which starts after an exponentially growing pause.
//! A failing sensor never holds up the others in the same round.

use crate::measurement::Measurement;
use crate::publish::Publisher;
use crate::reader::{DeviceReader, ReadError};
use crate::retry::RoundBackoff;
use crate::sensor::{SensorConfig, name_list};
use std::collections::HashSet;
use std::io::Write;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Result of reading one sensor in one round.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionOutcome {
    Success(Measurement),
    Failure(ReadError),
}

impl From<Result<Measurement, ReadError>> for AcquisitionOutcome {
    fn from(result: Result<Measurement, ReadError>) -> Self {
        match result {
            Ok(measurement) => AcquisitionOutcome::Success(measurement),
            Err(err) => AcquisitionOutcome::Failure(err),
        }
    }
}

/// Drives the reader and publisher over a list of sensors.
pub struct Scheduler<'a> {
    reader: DeviceReader<'a>,
    publisher: &'a dyn Publisher,
    backoff: RoundBackoff,
    stop: Option<watch::Receiver<bool>>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        reader: DeviceReader<'a>,
        publisher: &'a dyn Publisher,
        backoff: RoundBackoff,
    ) -> Self {
        Self {
            reader,
            publisher,
            backoff,
            stop: None,
        }
    }

    /// Stop between sensors once `stop` turns true. The sensor being read
    /// at that moment is finished, so its connection is closed properly.
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(|stop| *stop.borrow())
    }

    /// Sleep for `delay`; false if a stop was requested meanwhile.
    async fn pause(&self, delay: Duration) -> bool {
        let Some(mut stop) = self.stop.clone() else {
            tokio::time::sleep(delay).await;
            return true;
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            Ok(_) = stop.wait_for(|stopped| *stopped) => false,
        }
    }

    /// Read one sensor once.
    pub async fn acquire(&self, sensor: &SensorConfig) -> AcquisitionOutcome {
        info!("getting data from sensor {}", sensor.identity.topic_name());
        self.reader.read_measurement(&sensor.identity).await.into()
    }

    /// Read and publish every sensor, retrying failed ones in later rounds.
    ///
    /// Failures of sensors without `fail_silent` are also written to
    /// `console`. Returns the sensors that could not be read in any round,
    /// in input order.
    pub async fn process_all(
        &self,
        sensors: &[SensorConfig],
        console: &mut dyn Write,
    ) -> Vec<SensorConfig> {
        let mut seen = HashSet::new();
        let mut pending: Vec<SensorConfig> = sensors
            .iter()
            .filter(|s| seen.insert(s.identity.address()))
            .cloned()
            .collect();

        for round in 0..self.backoff.rounds {
            if pending.is_empty() || self.stopped() {
                break;
            }
            if let Some(delay) = self.backoff.delay_before(round) {
                info!(
                    "try {} of {}: could not process sensor(s) {}. Waiting {:?} for next try",
                    round,
                    self.backoff.rounds,
                    name_list(&pending),
                    delay
                );
                if !self.pause(delay).await {
                    break;
                }
            }

            let mut failed = Vec::new();
            for sensor in pending {
                if self.stopped() {
                    failed.push(sensor);
                    continue;
                }
                match self.acquire(&sensor).await {
                    AcquisitionOutcome::Success(measurement) => {
                        self.publish(&sensor, &measurement).await;
                    }
                    AcquisitionOutcome::Failure(err) => {
                        report_failure(&sensor, &err, console);
                        failed.push(sensor);
                    }
                }
            }
            pending = failed;
        }

        pending
    }

    async fn publish(&self, sensor: &SensorConfig, measurement: &Measurement) {
        if let Err(err) = self.publisher.publish(&sensor.identity, measurement).await {
            error!(
                "could not publish data of {} ({}): {}",
                sensor.identity.address(),
                sensor.identity,
                err
            );
        }
    }
}

fn report_failure(sensor: &SensorConfig, err: &ReadError, console: &mut dyn Write) {
    let msg = format!(
        "could not read data from {} ({}) with reason: {}",
        sensor.identity.address(),
        sensor.identity,
        err
    );
    if sensor.policy.fail_silent {
        warn!(
            "{}; fail_silent is set for sensor {}, so not raising an error",
            msg, sensor.identity
        );
    } else {
        error!("{}", msg);
        if let Err(io_err) = writeln!(console, "{msg}") {
            error!("could not write to console: {}", io_err);
        }
    }
}
