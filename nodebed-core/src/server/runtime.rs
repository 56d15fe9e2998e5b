use std::{future::Future, io};

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{time::TimeDriver, LegacyDriver, Runtime, RuntimeBuilder};
use tracing::{info, warn};

use crate::config::{RuntimeConfig, RuntimeType};

#[cfg(target_os = "linux")]
const MIN_SQPOLL_IDLE_TIME: u32 = 1000;

/// The multiplexer's runtime, with whichever driver the host supports.
pub enum RuntimeWrapper {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl TryFrom<&RuntimeConfig> for RuntimeWrapper {
    type Error = io::Error;

    fn try_from(config: &RuntimeConfig) -> Result<Self, Self::Error> {
        #[cfg(target_os = "linux")]
        let runtime_type = if config.runtime_type == RuntimeType::IoUring {
            if monoio::utils::detect_uring() {
                RuntimeType::IoUring
            } else {
                warn!("io_uring is not available, falling back to the legacy driver");
                RuntimeType::Legacy
            }
        } else {
            RuntimeType::Legacy
        };
        #[cfg(not(target_os = "linux"))]
        let runtime_type = RuntimeType::Legacy;

        info!(
            "building {:?} runtime with {} entries and sqpoll {:?}",
            runtime_type, config.entries, config.sqpoll_idle
        );
        match runtime_type {
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring => {
                let builder = match config.sqpoll_idle {
                    Some(idle) => {
                        let idle = MIN_SQPOLL_IDLE_TIME.max(idle);
                        let mut uring_builder = io_uring::IoUring::builder();
                        uring_builder.setup_sqpoll(idle);
                        RuntimeBuilder::<IoUringDriver>::new().uring_builder(uring_builder)
                    }
                    None => RuntimeBuilder::<IoUringDriver>::new(),
                };
                let runtime = builder
                    .enable_timer()
                    .with_entries(config.entries)
                    .build()?;
                Ok(RuntimeWrapper::IoUring(runtime))
            }
            RuntimeType::Legacy => {
                let runtime = RuntimeBuilder::<LegacyDriver>::new()
                    .enable_timer()
                    .build()?;
                Ok(RuntimeWrapper::Legacy(runtime))
            }
        }
    }
}

impl RuntimeWrapper {
    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future,
    {
        match self {
            #[cfg(target_os = "linux")]
            RuntimeWrapper::IoUring(driver) => driver.block_on(future),
            RuntimeWrapper::Legacy(driver) => driver.block_on(future),
        }
    }
}

/// Pin the calling thread to `core`; failures only cost performance.
pub fn bind_to_core(core: usize) {
    if let Err(e) = monoio::utils::bind_to_cpu_set([core]) {
        warn!("bind multiplexer thread to core {core} failed: {e}");
    }
}
