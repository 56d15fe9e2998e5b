use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    time::Duration,
};

use nodebed_core::{orchestrator::Runnable, AnyResult};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService,
};
use tracing::warn;

/// Downgrades errors and panics of the inner `start` to a warning.
///
/// Like any panic guard, this relies on the inner runnable staying usable
/// after an unwind.
pub struct SwallowErrors<T> {
    inner: T,
}

impl<T> SwallowErrors<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<R: Runnable> Runnable for SwallowErrors<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn start(&self) -> AnyResult<()> {
        match catch_unwind(AssertUnwindSafe(|| self.inner.start())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} failed, ignoring: {e:?}", self.inner.name()),
            Err(_) => warn!("{} panicked, ignoring", self.inner.name()),
        }
        Ok(())
    }

    fn stop(&self) {
        self.inner.stop()
    }

    fn start_delay(&self) -> Option<Duration> {
        self.inner.start_delay()
    }

    fn on_exit(&self, failed: bool) {
        self.inner.on_exit(failed)
    }
}

impl<F> SwallowErrors<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_c: &C, inner| SwallowErrors { inner })
    }
}

impl<F: MakeService> MakeService for SwallowErrors<F> {
    type Service = SwallowErrors<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(SwallowErrors {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}
