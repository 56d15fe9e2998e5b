use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};

use nodebed_core::{
    orchestrator::{Interrupt, Runnable},
    wire::NodeId,
    AnyResult,
};
use serde::Deserialize;
use tracing::{info, warn};

use super::ServiceConfig;
use crate::logging::{LogClient, LogLevel, LogRecord};

#[derive(Debug, Default, Deserialize)]
struct Params {
    label: Option<String>,
    /// Logging collector that also receives every beat.
    log_to: Option<SocketAddr>,
}

fn params(config: &ServiceConfig) -> AnyResult<Params> {
    if config.params.is_null() {
        return Ok(Params::default());
    }
    Ok(serde_json::from_value(config.params.clone())?)
}

fn label(config: &ServiceConfig, fallback: &str) -> AnyResult<String> {
    Ok(params(config)?
        .label
        .unwrap_or_else(|| fallback.to_string()))
}

/// Announces itself and idles until stopped.
pub struct TestService {
    label: String,
    wakeup: Interrupt,
}

impl TestService {
    pub const NAME: &'static str = "TestService";

    pub fn new(config: &ServiceConfig) -> AnyResult<Self> {
        Ok(Self {
            label: label(config, Self::NAME)?,
            wakeup: Interrupt::new(),
        })
    }
}

impl Runnable for TestService {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn start(&self) -> AnyResult<()> {
        info!("{} started", self.label);
        self.wakeup.wait();
        info!("{} stopped", self.label);
        Ok(())
    }

    fn stop(&self) {
        self.wakeup.interrupt();
    }
}

/// A logging session opened on first use and reopened after a failure.
struct RemoteLog {
    addr: SocketAddr,
    client: Mutex<Option<LogClient>>,
}

impl RemoteLog {
    fn send(&self, record: &LogRecord) {
        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if client.is_none() {
            match LogClient::connect(self.addr, NodeId::UNASSIGNED) {
                Ok(c) => *client = Some(c),
                Err(e) => {
                    warn!("log collector at {} unreachable: {e}", self.addr);
                    return;
                }
            }
        }
        if let Some(c) = client.as_mut() {
            if let Err(e) = c.send(record) {
                warn!("shipping a beat to {} failed: {e}", self.addr);
                *client = None;
            }
        }
    }
}

/// Logs one heartbeat per `start`; meant to be looped.
pub struct Heartbeat {
    label: String,
    beats: AtomicU64,
    remote: Option<RemoteLog>,
}

impl Heartbeat {
    pub const NAME: &'static str = "Heartbeat";

    pub fn new(config: &ServiceConfig) -> AnyResult<Self> {
        let params = params(config)?;
        Ok(Self {
            label: params.label.unwrap_or_else(|| Self::NAME.to_string()),
            beats: AtomicU64::new(0),
            remote: params.log_to.map(|addr| RemoteLog {
                addr,
                client: Mutex::new(None),
            }),
        })
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

impl Runnable for Heartbeat {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn start(&self) -> AnyResult<()> {
        let n = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        info!(beat = n, "heartbeat from {}", self.label);
        if let Some(remote) = &self.remote {
            remote.send(&LogRecord::new(
                LogLevel::Info,
                self.label.as_str(),
                format!("beat {n}"),
            ));
        }
        Ok(())
    }

    fn stop(&self) {}
}
