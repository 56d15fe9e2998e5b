use std::{
    any::Any,
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use anyhow::bail;
use tracing::{debug, error, info, warn};

use super::{Interrupt, Runnable};
use crate::AnyResult;

struct Tracked {
    runnable: Arc<dyn Runnable>,
    wakeup: Arc<Interrupt>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    counter: AtomicU64,
    /// Set under the `active` lock once shutdown has taken the handles.
    closing: AtomicBool,
    active: Mutex<HashMap<String, Tracked>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deregister(&self, name: &str) {
        // Dropping our own JoinHandle detaches the (already finishing) thread.
        if self.lock().remove(name).is_some() {
            debug!("runnable {name} deregistered");
        }
    }
}

/// Removes a thread's entry however its body exits.
struct Deregister {
    registry: Arc<Registry>,
    name: String,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.registry.deregister(&self.name);
    }
}

/// Runs every [`Runnable`] on its own named OS thread and keeps a registry of
/// the live ones.
///
/// Threads deregister themselves on the way out, so the registry only ever
/// holds live threads. [`ThreadDispatcher::shutdown_all`] takes
/// ownership of every remaining handle, signals all of them and only then
/// joins them, so the total shutdown time is bounded by the slowest runnable.
///
/// Cloning is cheap and every clone shares the registry.
#[derive(Clone, Default)]
pub struct ThreadDispatcher {
    registry: Arc<Registry>,
}

impl ThreadDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `runnable` and return its unique handle name.
    ///
    /// Unless `force_start` is set, the runnable's `start_delay` is honored
    /// first, interruptibly: a shutdown during the delay skips `start`.
    pub fn dispatch<R: Runnable>(&self, runnable: R, force_start: bool) -> AnyResult<String> {
        let runnable: Arc<dyn Runnable> = Arc::new(runnable);
        let seq = self.registry.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{seq}", runnable.name());
        let wakeup = Arc::new(Interrupt::new());

        let body = {
            let runnable = runnable.clone();
            let wakeup = wakeup.clone();
            let registry = self.registry.clone();
            let name = name.clone();
            move || {
                let _deregister = Deregister {
                    registry,
                    name: name.clone(),
                };
                run_to_completion(&name, runnable.as_ref(), &wakeup, force_start);
            }
        };

        // Hold the registry lock across spawn so the new thread cannot
        // deregister before its entry exists.
        let mut active = self.registry.lock();
        if self.registry.closing.load(Ordering::Acquire) {
            drop(active);
            runnable.stop();
            warn!("refused to dispatch {name}: shutting down");
            bail!("dispatcher is shutting down, {name} not started");
        }
        let join = thread::Builder::new().name(name.clone()).spawn(body)?;
        active.insert(
            name.clone(),
            Tracked {
                runnable,
                wakeup,
                join,
            },
        );
        drop(active);
        info!("dispatched {name}");
        Ok(name)
    }

    /// Number of live dispatched runnables.
    pub fn count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop and join every live runnable. Later dispatches are refused.
    pub fn shutdown_all(&self) {
        let tracked: Vec<(String, Tracked)> = {
            let mut active = self.registry.lock();
            self.registry.closing.store(true, Ordering::Release);
            active.drain().collect()
        };
        if tracked.is_empty() {
            return;
        }
        info!("stopping {} runnables", tracked.len());

        for (name, t) in tracked.iter() {
            debug!("signalling {name}");
            t.wakeup.interrupt();
            t.runnable.stop();
        }

        for (name, t) in tracked {
            if t.join.join().is_err() {
                error!("runnable {name} thread panicked outside its guard");
            } else {
                debug!("joined {name}");
            }
        }
        info!("all runnables stopped");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Outcome of one worker body, before `on_exit`.
enum Exit {
    Finished,
    Interrupted,
    Failed,
}

fn run_body(name: &str, runnable: &dyn Runnable, wakeup: &Interrupt, force_start: bool) -> Exit {
    if !force_start {
        if let Some(delay) = runnable.start_delay() {
            debug!("{name} waits {delay:?} before starting");
            if wakeup.wait_timeout(delay) {
                info!("{name} stopped before it started");
                return Exit::Interrupted;
            }
        }
    }
    match runnable.start() {
        Ok(()) => {
            debug!("{name} finished");
            Exit::Finished
        }
        Err(e) => {
            error!("runnable {} ({name}) failed: {e:?}", runnable.name());
            Exit::Failed
        }
    }
}

fn run_to_completion(name: &str, runnable: &dyn Runnable, wakeup: &Interrupt, force_start: bool) {
    let exit = catch_unwind(AssertUnwindSafe(|| {
        run_body(name, runnable, wakeup, force_start)
    }))
    .unwrap_or_else(|panic| {
        error!(
            "runnable {} ({name}) panicked: {}",
            runnable.name(),
            panic_message(panic.as_ref())
        );
        Exit::Failed
    });

    let failed = matches!(exit, Exit::Failed);
    if catch_unwind(AssertUnwindSafe(|| runnable.on_exit(failed))).is_err() {
        warn!("{name} exit callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        time::{Duration, Instant},
    };

    use super::*;

    /// Blocks until stopped; records how it was driven.
    #[derive(Default)]
    struct Sleeper {
        wakeup: Interrupt,
        started: AtomicUsize,
        stops: AtomicUsize,
        linger: Duration,
    }

    impl Runnable for Sleeper {
        fn name(&self) -> &str {
            "Sleeper"
        }

        fn start(&self) -> AnyResult<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.wakeup.wait_timeout(Duration::from_secs(30));
            thread::sleep(self.linger);
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.wakeup.interrupt();
        }
    }

    struct Failing {
        exited_with_failure: Arc<AtomicBool>,
        panic: bool,
    }

    impl Runnable for Failing {
        fn name(&self) -> &str {
            "Failing"
        }

        fn start(&self) -> AnyResult<()> {
            if self.panic {
                panic!("boom");
            }
            bail!("refusing to work")
        }

        fn stop(&self) {}

        fn on_exit(&self, failed: bool) {
            self.exited_with_failure.store(failed, Ordering::SeqCst);
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn names_are_unique_per_dispatch() {
        let d = ThreadDispatcher::new();
        let a = d.dispatch(Arc::new(Sleeper::default()), true).unwrap();
        let b = d.dispatch(Arc::new(Sleeper::default()), true).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("Sleeper-"));
        assert_eq!(d.count(), 2);
        d.shutdown_all();
        assert_eq!(d.count(), 0);
    }

    #[test]
    fn shutdown_signals_everyone_before_joining() {
        let d = ThreadDispatcher::new();
        let sleepers: Vec<Arc<Sleeper>> = (0..5)
            .map(|_| {
                Arc::new(Sleeper {
                    linger: Duration::from_millis(200),
                    ..Default::default()
                })
            })
            .collect();
        for s in &sleepers {
            d.dispatch(s.clone(), true).unwrap();
        }
        assert!(wait_until(|| sleepers
            .iter()
            .all(|s| s.started.load(Ordering::SeqCst) == 1)));

        let begin = Instant::now();
        d.shutdown_all();
        let elapsed = begin.elapsed();

        // Sequential stop-then-join would take at least 5 * 200ms.
        assert!(elapsed < Duration::from_millis(800), "took {elapsed:?}");
        assert!(sleepers.iter().all(|s| s.stops.load(Ordering::SeqCst) == 1));
        assert_eq!(d.count(), 0);
    }

    #[test]
    fn self_terminated_runnables_are_pruned() {
        let d = ThreadDispatcher::new();
        let flag = Arc::new(AtomicBool::new(false));
        d.dispatch(
            Failing {
                exited_with_failure: flag.clone(),
                panic: false,
            },
            true,
        )
        .unwrap();
        assert!(wait_until(|| d.count() == 0));
        assert!(flag.load(Ordering::SeqCst));
        // Nothing left to stop or join twice.
        d.shutdown_all();
        d.shutdown_all();
    }

    #[test]
    fn panics_are_contained() {
        let d = ThreadDispatcher::new();
        let flag = Arc::new(AtomicBool::new(false));
        d.dispatch(
            Failing {
                exited_with_failure: flag.clone(),
                panic: true,
            },
            true,
        )
        .unwrap();
        assert!(wait_until(|| d.count() == 0));
        assert!(flag.load(Ordering::SeqCst));
    }

    struct Delayed {
        started: AtomicBool,
        exits: AtomicUsize,
    }

    impl Runnable for Delayed {
        fn name(&self) -> &str {
            "Delayed"
        }

        fn start(&self) -> AnyResult<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {}

        fn start_delay(&self) -> Option<Duration> {
            Some(Duration::from_secs(30))
        }

        fn on_exit(&self, _failed: bool) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn start_delay_is_interruptible() {
        let d = ThreadDispatcher::new();
        let r = Arc::new(Delayed {
            started: AtomicBool::new(false),
            exits: AtomicUsize::new(0),
        });
        d.dispatch(r.clone(), false).unwrap();
        let begin = Instant::now();
        d.shutdown_all();
        assert!(begin.elapsed() < Duration::from_secs(5));
        assert!(!r.started.load(Ordering::SeqCst));
        assert_eq!(r.exits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn force_start_skips_the_delay() {
        let d = ThreadDispatcher::new();
        let r = Arc::new(Delayed {
            started: AtomicBool::new(false),
            exits: AtomicUsize::new(0),
        });
        d.dispatch(r.clone(), true).unwrap();
        assert!(wait_until(|| r.started.load(Ordering::SeqCst)));
        assert!(wait_until(|| d.count() == 0));
    }

    struct BadDelay {
        exits: Arc<Mutex<Vec<bool>>>,
    }

    impl Runnable for BadDelay {
        fn name(&self) -> &str {
            "BadDelay"
        }

        fn start(&self) -> AnyResult<()> {
            Ok(())
        }

        fn stop(&self) {}

        fn start_delay(&self) -> Option<Duration> {
            panic!("delay out of range");
        }

        fn on_exit(&self, failed: bool) {
            self.exits.lock().unwrap().push(failed);
        }
    }

    #[test]
    fn panicking_start_delay_still_deregisters() {
        let d = ThreadDispatcher::new();
        let exits = Arc::new(Mutex::new(Vec::new()));
        d.dispatch(
            BadDelay {
                exits: exits.clone(),
            },
            false,
        )
        .unwrap();
        assert!(wait_until(|| d.count() == 0));
        assert_eq!(*exits.lock().unwrap(), vec![true]);
        d.shutdown_all();
    }

    #[test]
    fn dispatch_after_shutdown_is_refused() {
        let d = ThreadDispatcher::new();
        d.dispatch(Arc::new(Sleeper::default()), true).unwrap();
        d.shutdown_all();

        let late = Arc::new(Sleeper::default());
        assert!(d.dispatch(late.clone(), true).is_err());
        assert_eq!(late.stops.load(Ordering::SeqCst), 1);
        assert_eq!(late.started.load(Ordering::SeqCst), 0);
        assert_eq!(d.count(), 0);
    }

    /// Dispatches from another thread while shutdown runs, the way a listener
    /// keeps accepting until its own stop lands.
    struct Spawning {
        dispatcher: ThreadDispatcher,
        wakeup: Interrupt,
        children: Mutex<Vec<Arc<Sleeper>>>,
    }

    impl Runnable for Spawning {
        fn name(&self) -> &str {
            "Spawning"
        }

        fn start(&self) -> AnyResult<()> {
            loop {
                let child = Arc::new(Sleeper::default());
                self.children.lock().unwrap().push(child.clone());
                if self.dispatcher.dispatch(child, true).is_err() {
                    return Ok(());
                }
                if self.wakeup.wait_timeout(Duration::from_millis(1)) {
                    // Keep dispatching for a moment after our stop lands.
                    thread::sleep(Duration::from_millis(20));
                    let child = Arc::new(Sleeper::default());
                    self.children.lock().unwrap().push(child.clone());
                    let _ = self.dispatcher.dispatch(child, true);
                    return Ok(());
                }
            }
        }

        fn stop(&self) {
            self.wakeup.interrupt();
        }
    }

    #[test]
    fn dispatches_racing_shutdown_never_leak() {
        let d = ThreadDispatcher::new();
        let spawning = Arc::new(Spawning {
            dispatcher: d.clone(),
            wakeup: Interrupt::new(),
            children: Mutex::new(Vec::new()),
        });
        d.dispatch(spawning.clone(), true).unwrap();
        assert!(wait_until(|| d.count() > 3));

        d.shutdown_all();
        assert_eq!(d.count(), 0);
        // Every child either was joined or was stopped when refused.
        let children = spawning.children.lock().unwrap();
        assert!(children
            .iter()
            .all(|c| c.stops.load(Ordering::SeqCst) == 1));
    }
}
