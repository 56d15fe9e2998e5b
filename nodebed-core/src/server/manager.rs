use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tracing::{error, info};

use super::{Multiplexer, StopHandle};
use crate::{
    error::Result,
    orchestrator::{Runnable, ThreadDispatcher},
    AnyResult,
};

/// Requests a coordinated shutdown of a running [`ConnectionManager`].
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    multiplexer: StopHandle,
}

impl ShutdownHandle {
    /// Returns `false` when a shutdown was already requested; the second
    /// request does nothing.
    pub fn request(&self) -> bool {
        if self.requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("shutdown requested");
        self.multiplexer.stop();
        true
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Owns the multiplexer, the thread dispatcher and the companion runnables
/// that live as long as the daemon does.
pub struct ConnectionManager {
    multiplexer: Multiplexer,
    dispatcher: ThreadDispatcher,
    companions: Vec<Box<dyn Runnable>>,
    shutdown: ShutdownHandle,
}

impl ConnectionManager {
    pub fn new(multiplexer: Multiplexer, dispatcher: ThreadDispatcher) -> Self {
        let shutdown = ShutdownHandle {
            requested: Arc::new(AtomicBool::new(false)),
            multiplexer: multiplexer.stop_handle(),
        };
        Self {
            multiplexer,
            dispatcher,
            companions: Vec::new(),
            shutdown,
        }
    }

    /// Add a runnable that is force-started with the manager.
    pub fn with_companion(mut self, runnable: impl Runnable) -> Self {
        self.companions.push(Box::new(runnable));
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn dispatcher(&self) -> &ThreadDispatcher {
        &self.dispatcher
    }

    pub fn bind(&mut self) -> Result<SocketAddr> {
        self.multiplexer.bind()
    }

    /// Run until the multiplexer stops, then stop every dispatched runnable.
    pub fn run(self) -> AnyResult<()> {
        let ConnectionManager {
            multiplexer,
            dispatcher,
            companions,
            ..
        } = self;
        for companion in companions {
            if let Err(e) = dispatcher.dispatch(companion, true) {
                error!("dispatching companion failed: {e:?}");
                dispatcher.shutdown_all();
                return Err(e);
            }
        }
        info!("connection manager running");
        let result = multiplexer.start();
        if let Err(e) = &result {
            error!("multiplexer failed: {e}");
        }
        dispatcher.shutdown_all();
        info!("connection manager stopped");
        result.map_err(Into::into)
    }
}
