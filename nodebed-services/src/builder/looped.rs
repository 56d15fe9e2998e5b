use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use nodebed_core::{
    orchestrator::{Interrupt, Runnable},
    sampler::Sampler,
    AnyError, AnyResult,
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Param,
};
use tracing::debug;

use super::LoopPolicy;

/// Repeats the inner runnable with a sampled pause between iterations.
pub struct LoopedService<R> {
    inner: R,
    sampler: Mutex<Sampler>,
    delay_first: bool,
    max_iterations: Option<u64>,
    iterations: AtomicU64,
    wakeup: Interrupt,
    stopped: AtomicBool,
}

impl<R> LoopedService<R> {
    pub fn new(inner: R, policy: LoopPolicy) -> AnyResult<Self> {
        Ok(Self {
            inner,
            sampler: Mutex::new(Sampler::new(policy.delay)?),
            delay_first: policy.delay_first,
            max_iterations: policy.max_iterations,
            iterations: AtomicU64::new(0),
            wakeup: Interrupt::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Acquire)
    }

    fn next_delay(&self) -> Duration {
        self.sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_duration()
    }
}

impl<R: Runnable> Runnable for LoopedService<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn start(&self) -> AnyResult<()> {
        while !self.wakeup.is_interrupted() {
            self.inner.start()?;
            let done = self.iterations.fetch_add(1, Ordering::AcqRel) + 1;
            if self.max_iterations.is_some_and(|max| done >= max) {
                debug!("{} finished {done} iterations", self.name());
                break;
            }
            if self.wakeup.wait_timeout(self.next_delay()) {
                break;
            }
        }
        Ok(())
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wakeup.interrupt();
        self.inner.stop();
    }

    fn start_delay(&self) -> Option<Duration> {
        if self.delay_first {
            return Some(self.next_delay());
        }
        self.inner.start_delay()
    }

    fn on_exit(&self, failed: bool) {
        self.inner.on_exit(failed)
    }
}

pub struct LoopedFactory<F> {
    policy: LoopPolicy,
    inner: F,
}

impl<F> LoopedFactory<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<LoopPolicy>,
    {
        layer_fn(|c: &C, inner| LoopedFactory {
            policy: c.param(),
            inner,
        })
    }
}

impl<F> MakeService for LoopedFactory<F>
where
    F: MakeService,
    F::Error: Into<AnyError>,
{
    type Service = LoopedService<F::Service>;
    type Error = AnyError;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        let inner = self.inner.make().map_err(Into::into)?;
        LoopedService::new(inner, self.policy.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::AtomicUsize, Arc},
        thread,
        time::Instant,
    };

    use nodebed_core::sampler::{SamplerConfig, MAX_DELAY};

    use super::*;

    #[derive(Default)]
    struct Counter {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl Runnable for Counter {
        fn name(&self) -> &str {
            "Counter"
        }

        fn start(&self) -> AnyResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn policy(delay: f64, delay_first: bool, max_iterations: Option<u64>) -> LoopPolicy {
        LoopPolicy {
            delay: SamplerConfig::Constant { value: delay },
            delay_first,
            max_iterations,
        }
    }

    #[test]
    fn stops_after_max_iterations() {
        let counter = Arc::new(Counter::default());
        let looped = LoopedService::new(counter.clone(), policy(0.0, false, Some(3))).unwrap();
        looped.start().unwrap();
        assert_eq!(counter.starts.load(Ordering::SeqCst), 3);
        assert_eq!(looped.iterations(), 3);
        assert_eq!(looped.start_delay(), None);
    }

    #[test]
    fn stop_interrupts_the_pause_and_reaches_inner_once() {
        let counter = Arc::new(Counter::default());
        let looped =
            Arc::new(LoopedService::new(counter.clone(), policy(60.0, false, None)).unwrap());
        let runner = {
            let looped = looped.clone();
            thread::spawn(move || looped.start())
        };
        while counter.starts.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        let begin = Instant::now();
        looped.stop();
        looped.stop();
        runner.join().unwrap().unwrap();
        assert!(begin.elapsed() < Duration::from_secs(5));
        assert_eq!(counter.starts.load(Ordering::SeqCst), 1);
        assert_eq!(counter.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_first_samples_the_start_delay() {
        let counter = Arc::new(Counter::default());
        let looped = LoopedService::new(counter, policy(2.5, true, Some(1))).unwrap();
        assert_eq!(looped.start_delay(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn oversized_delays_are_bounded() {
        let counter = Arc::new(Counter::default());
        let looped = LoopedService::new(counter, policy(1e20, true, Some(1))).unwrap();
        assert_eq!(looped.start_delay(), Some(MAX_DELAY));
    }

    #[test]
    fn stopped_before_start_runs_nothing() {
        let counter = Arc::new(Counter::default());
        let looped = LoopedService::new(counter.clone(), policy(0.0, false, None)).unwrap();
        looped.stop();
        looped.start().unwrap();
        assert_eq!(counter.starts.load(Ordering::SeqCst), 0);
    }
}
