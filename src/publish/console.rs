//! Dry-run bus: prints `topic payload` lines instead of talking to a broker.

use super::{BusClient, PublishError};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::io::Write;
use std::sync::Mutex;

pub struct ConsoleBus {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleBus {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }
}

impl BusClient for ConsoleBus {
    fn connect(&self) -> BoxFuture<'_, Result<(), PublishError>> {
        async { Ok(()) }.boxed()
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        _retain: bool,
    ) -> BoxFuture<'a, Result<(), PublishError>> {
        async move {
            let mut out = self
                .out
                .lock()
                .map_err(|_| PublishError::Transport("console writer poisoned".to_string()))?;
            writeln!(out, "{} {}", topic, String::from_utf8_lossy(&payload))
                .and_then(|_| out.flush())
                .map_err(|err| PublishError::Transport(err.to_string()))
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), PublishError>> {
        async { Ok(()) }.boxed()
    }
}
