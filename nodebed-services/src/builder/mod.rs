//! Turns a service name plus an optional config file into a [`Runnable`].
//!
//! Constructors are registered by name. The config's `extensions` list wraps
//! the constructed workload in decorator factories, in list order: the first
//! extension sits closest to the workload.
use std::{collections::HashMap, fmt, path::Path, sync::Arc};

use anyhow::{anyhow, Context};
use nodebed_core::{
    config::{parse_file, ServicesConfig},
    orchestrator::Runnable,
    sampler::SamplerConfig,
    AnyError, AnyResult,
};
use serde::{Deserialize, Serialize};
use service_async::{layer::FactoryLayer, MakeService, Param};
use tracing::debug;

mod launch;
mod looped;
mod swallow;
mod workloads;

pub use launch::ServiceLauncher;
pub use looped::{LoopedFactory, LoopedService};
pub use swallow::SwallowErrors;
pub use workloads::{Heartbeat, TestService};

pub type BoxRunnable = Box<dyn Runnable>;

pub type Constructor = Arc<dyn Fn(&ServiceConfig) -> AnyResult<BoxRunnable> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extension {
    Looped,
    SwallowErrors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopPolicy {
    /// Pause between iterations, in seconds.
    #[serde(default)]
    pub delay: SamplerConfig,
    /// Also wait one sampled delay before the first iteration.
    #[serde(default)]
    pub delay_first: bool,
    pub max_iterations: Option<u64>,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            delay: SamplerConfig::default(),
            delay_first: false,
            max_iterations: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub extensions: Vec<Extension>,
    #[serde(default)]
    pub looping: LoopPolicy,
    /// Workload-specific parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Param<LoopPolicy> for ServiceConfig {
    fn param(&self) -> LoopPolicy {
        self.looping.clone()
    }
}

/// Type-erased runnable factory, so decorators can be stacked in an order
/// only known at runtime.
pub struct BoxFactory(Box<dyn Fn() -> AnyResult<BoxRunnable> + Send + Sync>);

impl BoxFactory {
    pub fn new<F>(factory: F) -> Self
    where
        F: MakeService + Send + Sync + 'static,
        F::Service: Runnable,
        F::Error: Into<AnyError>,
    {
        BoxFactory(Box::new(move || {
            factory
                .make()
                .map(|svc| Box::new(svc) as BoxRunnable)
                .map_err(Into::into)
        }))
    }
}

impl MakeService for BoxFactory {
    type Service = BoxRunnable;
    type Error = AnyError;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        (self.0)()
    }
}

/// Calls a registered constructor with the service's config.
struct ConstructorFactory {
    constructor: Constructor,
    config: ServiceConfig,
}

impl MakeService for ConstructorFactory {
    type Service = BoxRunnable;
    type Error = AnyError;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        (self.constructor)(&self.config)
    }
}

#[derive(Clone)]
pub struct ServiceBuilder {
    constructors: HashMap<String, Constructor>,
    services: ServicesConfig,
}

impl fmt::Debug for ServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("services", &self.names())
            .field("dir", &self.services.dir)
            .finish()
    }
}

impl ServiceBuilder {
    pub fn new(services: ServicesConfig) -> Self {
        Self {
            constructors: HashMap::new(),
            services,
        }
    }

    /// A builder knowing the built-in workloads.
    pub fn with_builtins(services: ServicesConfig) -> Self {
        let mut builder = Self::new(services);
        builder.register(TestService::NAME, |c| Ok(Box::new(TestService::new(c)?)));
        builder.register(Heartbeat::NAME, |c| Ok(Box::new(Heartbeat::new(c)?)));
        builder
    }

    /// Register or replace the constructor for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&ServiceConfig) -> AnyResult<BoxRunnable> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn services(&self) -> &ServicesConfig {
        &self.services
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Load a service config from inside the service directory; no path
    /// means defaults.
    pub fn load_config(&self, path: Option<&Path>) -> AnyResult<ServiceConfig> {
        match path {
            Some(path) => parse_file(self.services.resolve(path)?),
            None => Ok(ServiceConfig::default()),
        }
    }

    pub fn build(&self, name: &str, config_path: Option<&Path>) -> AnyResult<BoxRunnable> {
        let config = self
            .load_config(config_path)
            .with_context(|| format!("loading config of service {name}"))?;
        self.build_with(name, config)
    }

    pub fn build_with(&self, name: &str, config: ServiceConfig) -> AnyResult<BoxRunnable> {
        let constructor = self
            .constructors
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown service {name:?}"))?;
        let extensions = config.extensions.clone();
        let mut factory = BoxFactory::new(ConstructorFactory {
            constructor,
            config: config.clone(),
        });
        for extension in extensions {
            debug!("wrapping service {name} with {extension:?}");
            factory = match extension {
                Extension::Looped => {
                    let layer = LoopedFactory::<BoxFactory>::layer::<ServiceConfig>();
                    BoxFactory::new(layer.layer(&config, factory))
                }
                Extension::SwallowErrors => {
                    let layer = SwallowErrors::<BoxFactory>::layer::<ServiceConfig>();
                    BoxFactory::new(layer.layer(&config, factory))
                }
            };
        }
        factory
            .make()
            .with_context(|| format!("building service {name}"))
    }
}
