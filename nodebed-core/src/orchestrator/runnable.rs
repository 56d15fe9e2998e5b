use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::AnyResult;

/// Anything the [`ThreadDispatcher`](super::ThreadDispatcher) can run on its
/// own thread.
///
/// `start` blocks until the work is done or interrupted. `stop` must not
/// block, may be called any number of times and from any thread, and must
/// make a blocked `start` return soon.
pub trait Runnable: Send + Sync + 'static {
    /// Diagnostic name, used as the prefix of the dispatcher handle name.
    fn name(&self) -> &str;

    fn start(&self) -> AnyResult<()>;

    fn stop(&self);

    /// Delay to honor before the first `start` when not force-started.
    fn start_delay(&self) -> Option<Duration> {
        None
    }

    /// Called on the runnable's thread once `start` has returned.
    fn on_exit(&self, _failed: bool) {}
}

impl<R: Runnable + ?Sized> Runnable for Box<R> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn start(&self) -> AnyResult<()> {
        (**self).start()
    }

    fn stop(&self) {
        (**self).stop()
    }

    fn start_delay(&self) -> Option<Duration> {
        (**self).start_delay()
    }

    fn on_exit(&self, failed: bool) {
        (**self).on_exit(failed)
    }
}

impl<R: Runnable + ?Sized> Runnable for Arc<R> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn start(&self) -> AnyResult<()> {
        (**self).start()
    }

    fn stop(&self) {
        (**self).stop()
    }

    fn start_delay(&self) -> Option<Duration> {
        (**self).start_delay()
    }

    fn on_exit(&self, failed: bool) {
        (**self).on_exit(failed)
    }
}

/// Interruptible wait: the sanctioned blocking point between work cycles.
///
/// Once interrupted it stays interrupted; every later wait returns at once.
#[derive(Debug, Default)]
pub struct Interrupt {
    interrupted: Mutex<bool>,
    cond: Condvar,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        let mut flag = self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *flag = true;
        self.cond.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        *self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `timeout` unless interrupted first. Returns whether the
    /// wait ended because of an interrupt.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut flag = self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            flag = self
                .cond
                .wait_timeout(flag, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Block until interrupted.
    pub fn wait(&self) {
        let mut flag = self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*flag {
            flag = self.cond.wait(flag).unwrap_or_else(PoisonError::into_inner);
        }
    }
}
