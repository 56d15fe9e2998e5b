//! Launches of named services requested by peers.
//!
//! Requests are checked without touching the filesystem. Loading the config
//! and constructing the service happen on the dispatched thread, never on
//! the multiplexer.
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::anyhow;
use nodebed_core::{
    orchestrator::{Interrupt, Runnable, ThreadDispatcher},
    AnyResult,
};
use tracing::{debug, info};

use super::{BoxRunnable, ServiceBuilder};
use crate::hub::ServiceRegistrar;

/// Validates launch requests and dispatches them.
#[derive(Clone)]
pub struct ServiceLauncher {
    builder: Arc<ServiceBuilder>,
    dispatcher: ThreadDispatcher,
    registrar: Option<Arc<ServiceRegistrar>>,
}

impl ServiceLauncher {
    pub fn new(builder: Arc<ServiceBuilder>, dispatcher: ThreadDispatcher) -> Self {
        Self {
            builder,
            dispatcher,
            registrar: None,
        }
    }

    /// Register every launched service with the hub.
    pub fn with_registrar(mut self, registrar: ServiceRegistrar) -> Self {
        self.registrar = Some(Arc::new(registrar));
        self
    }

    pub fn dispatcher(&self) -> &ThreadDispatcher {
        &self.dispatcher
    }

    /// Check `name` and `config`, then dispatch the launch (not
    /// force-started). Returns the dispatcher handle.
    pub fn launch(&self, name: &str, config: Option<&Path>) -> AnyResult<String> {
        if !self.builder.contains(name) {
            return Err(anyhow!("unknown service {name:?}"));
        }
        if let Some(path) = config {
            self.builder.services().resolve(path)?;
        }
        let launch = PendingLaunch {
            name: name.to_string(),
            config: config.map(Path::to_path_buf),
            builder: self.builder.clone(),
            registrar: self.registrar.clone(),
            service: Mutex::new(None),
            wakeup: Interrupt::new(),
        };
        self.dispatcher.dispatch(launch, false)
    }
}

/// Builds its service when started, then runs it in place.
///
/// The service's own start delay is honored here, after the build, and a
/// stop arriving before the build completes keeps the service from starting.
struct PendingLaunch {
    name: String,
    config: Option<PathBuf>,
    builder: Arc<ServiceBuilder>,
    registrar: Option<Arc<ServiceRegistrar>>,
    service: Mutex<Option<Arc<BoxRunnable>>>,
    wakeup: Interrupt,
}

impl PendingLaunch {
    fn service(&self) -> MutexGuard<'_, Option<Arc<BoxRunnable>>> {
        self.service.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Runnable for PendingLaunch {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> AnyResult<()> {
        let service = Arc::new(self.builder.build(&self.name, self.config.as_deref())?);
        {
            let mut slot = self.service();
            if self.wakeup.is_interrupted() {
                debug!("{} stopped while it was being built", self.name);
                return Ok(());
            }
            *slot = Some(service.clone());
        }
        if let Some(registrar) = &self.registrar {
            registrar.register(&self.name);
        }
        if let Some(delay) = service.start_delay() {
            debug!("{} waits {delay:?} before starting", self.name);
            if self.wakeup.wait_timeout(delay) {
                info!("{} stopped before it started", self.name);
                return Ok(());
            }
        }
        service.start()
    }

    fn stop(&self) {
        self.wakeup.interrupt();
        let service = self.service().clone();
        if let Some(service) = service {
            service.stop();
        }
    }

    fn on_exit(&self, failed: bool) {
        let service = self.service().clone();
        if let Some(service) = service {
            service.on_exit(failed);
        }
    }
}
