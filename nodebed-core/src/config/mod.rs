//! Daemon configuration.
//!
//! A system-wide file describes the testbed (hub location, runtime tuning,
//! service directory); an optional per-node file overrides any subset of it;
//! the command line may finally override the node name. Validation runs once
//! on the merged result, before any socket is opened.
use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::Error;

mod parsers;

pub use parsers::{parse_file, parse_from_slice};

// Default iouring/epoll entries: 1k, the multiplexer is a single low-volume thread
const DEFAULT_ENTRIES: u32 = 1024;
const DEFAULT_PORT: u16 = 7700;
const DEFAULT_CONNECT_RETRIES: u32 = 5;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_port, DEFAULT_PORT, u16);
define_const!(default_hub_enabled, true, bool);
define_const!(default_connect_retries, DEFAULT_CONNECT_RETRIES, u32);
define_const!(default_connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS, u64);

fn default_node_name() -> String {
    "node".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default = "default_entries")]
    pub entries: u32,
    pub sqpoll_idle: Option<u32>,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    /// Pin the multiplexer thread to this core.
    pub cpu_affinity: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
            cpu_affinity: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port of the legacy line-command listener, disabled when absent.
    pub command_port: Option<u16>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            host: default_host(),
            port: default_port(),
            command_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HubConfig {
    /// This node hosts the hub sub-server.
    #[serde(default = "default_hub_enabled")]
    pub enabled: bool,
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            enabled: default_hub_enabled(),
            host: None,
            port: default_port(),
            connect_retries: default_connect_retries(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl HubConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServicesConfig {
    /// Base directory for relative service config paths.
    pub dir: Option<PathBuf>,
}

impl ServicesConfig {
    /// Resolve a peer-supplied config path. Only relative paths that stay
    /// inside the service directory are accepted.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, Error> {
        let confined = path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !confined || path.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "service config path {} leaves the service directory",
                path.display()
            )));
        }
        Ok(match &self.dir {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

/// Per-node overrides; every present field replaces the system value.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonOverlay {
    pub runtime: Option<RuntimeConfig>,
    #[serde(default)]
    pub node: NodeOverlay,
    #[serde(default)]
    pub hub: HubOverlay,
    #[serde(default)]
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NodeOverlay {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub command_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HubOverlay {
    pub enabled: Option<bool>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connect_retries: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
}

impl DaemonConfig {
    /// Load, merge and validate the daemon configuration.
    pub fn load(
        system_path: impl AsRef<Path>,
        node_path: Option<&Path>,
        node_name: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mut config: DaemonConfig = parse_file(system_path)?;
        if let Some(node_path) = node_path {
            let overlay: DaemonOverlay = parse_file(node_path)?;
            config.apply(overlay);
        }
        if let Some(name) = node_name {
            config.node.name = name.to_string();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overlay: DaemonOverlay) {
        let DaemonOverlay {
            runtime,
            node,
            hub,
            services,
        } = overlay;
        if let Some(runtime) = runtime {
            self.runtime = runtime;
        }
        if let Some(name) = node.name {
            self.node.name = name;
        }
        if let Some(host) = node.host {
            self.node.host = host;
        }
        if let Some(port) = node.port {
            self.node.port = port;
        }
        if node.command_port.is_some() {
            self.node.command_port = node.command_port;
        }
        if let Some(enabled) = hub.enabled {
            self.hub.enabled = enabled;
        }
        if hub.host.is_some() {
            self.hub.host = hub.host;
        }
        if let Some(port) = hub.port {
            self.hub.port = port;
        }
        if let Some(retries) = hub.connect_retries {
            self.hub.connect_retries = retries;
        }
        if let Some(timeout) = hub.connect_timeout_ms {
            self.hub.connect_timeout_ms = timeout;
        }
        if services.dir.is_some() {
            self.services.dir = services.dir;
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.node.name.trim().is_empty() {
            return Err(Error::Config("node.name must not be empty".into()));
        }
        if self.node.port == 0 {
            return Err(Error::Config("node.port must be between 1 and 65535".into()));
        }
        self.listen_addr()?;
        if let Some(command_port) = self.node.command_port {
            if command_port == 0 || command_port == self.node.port {
                return Err(Error::Config(format!(
                    "node.command_port {command_port} must be nonzero and differ from node.port"
                )));
            }
        }
        if !self.hub.enabled {
            if self.hub.port == 0 {
                return Err(Error::Config("hub.port must be between 1 and 65535".into()));
            }
            if self.hub_addr()?.is_none() {
                return Err(Error::Config(
                    "hub.host is required when this node does not host the hub".into(),
                ));
            }
        }
        if self.hub.connect_retries == 0 {
            return Err(Error::Config("hub.connect_retries must be at least 1".into()));
        }
        Ok(())
    }

    fn parse_ip(key: &str, host: &str) -> Result<IpAddr, Error> {
        host.parse()
            .map_err(|_| Error::Config(format!("{key} {host:?} is not an IP address")))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, Error> {
        let ip = Self::parse_ip("node.host", &self.node.host)?;
        Ok(SocketAddr::new(ip, self.node.port))
    }

    pub fn command_addr(&self) -> Result<Option<SocketAddr>, Error> {
        let ip = Self::parse_ip("node.host", &self.node.host)?;
        Ok(self.node.command_port.map(|port| SocketAddr::new(ip, port)))
    }

    /// Address of the remote hub; `None` when no hub host is configured.
    pub fn hub_addr(&self) -> Result<Option<SocketAddr>, Error> {
        match &self.hub.host {
            Some(host) => {
                let ip = Self::parse_ip("hub.host", host)?;
                Ok(Some(SocketAddr::new(ip, self.hub.port)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults_describe_a_standalone_hub() {
        let cfg = DaemonConfig::default();
        assert!(cfg.hub.enabled);
        assert_eq!(cfg.node.port, DEFAULT_PORT);
        cfg.validate().unwrap();
    }

    #[test]
    fn node_overlay_overrides_system_values() {
        let system = write(
            r#"
            [node]
            name = "base"
            port = 7000

            [hub]
            enabled = false
            host = "10.0.0.1"
            "#,
        );
        let node = write(
            r#"{"node": {"name": "n7", "command_port": 7001}, "hub": {"connect_retries": 9}}"#,
        );
        let cfg = DaemonConfig::load(system.path(), Some(node.path()), None).unwrap();
        assert_eq!(cfg.node.name, "n7");
        assert_eq!(cfg.node.port, 7000);
        assert_eq!(cfg.node.command_port, Some(7001));
        assert_eq!(cfg.hub.connect_retries, 9);
        assert_eq!(
            cfg.hub_addr().unwrap(),
            Some("10.0.0.1:7700".parse().unwrap())
        );
    }

    #[test]
    fn command_line_name_wins() {
        let system = write("[node]\nname = \"base\"\n");
        let cfg = DaemonConfig::load(system.path(), None, Some("cli-name")).unwrap();
        assert_eq!(cfg.node.name, "cli-name");
    }

    #[test]
    fn invalid_values_fail_fast() {
        let mut cfg = DaemonConfig::default();
        cfg.node.port = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = DaemonConfig::default();
        cfg.node.host = "not-an-ip".into();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = DaemonConfig::default();
        cfg.hub.enabled = false;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = DaemonConfig::default();
        cfg.node.command_port = Some(cfg.node.port);
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn out_of_range_port_is_a_parse_error() {
        let system = write("[node]\nport = 70000\n");
        assert!(DaemonConfig::load(system.path(), None, None).is_err());
    }

    #[test]
    fn relative_service_paths_resolve_against_the_service_dir() {
        let services = ServicesConfig {
            dir: Some(PathBuf::from("/etc/nodebed/services")),
        };
        assert_eq!(
            services.resolve(Path::new("beat.toml")).unwrap(),
            PathBuf::from("/etc/nodebed/services/beat.toml")
        );
        assert_eq!(
            services.resolve(Path::new("./edge/beat.toml")).unwrap(),
            PathBuf::from("/etc/nodebed/services/./edge/beat.toml")
        );
    }

    #[test]
    fn escaping_service_paths_are_rejected() {
        let services = ServicesConfig {
            dir: Some(PathBuf::from("/etc/nodebed/services")),
        };
        for path in ["/tmp/beat.toml", "../beat.toml", "edge/../../beat.toml", ""] {
            assert!(services.resolve(Path::new(path)).is_err(), "{path:?}");
        }
        assert!(ServicesConfig::default()
            .resolve(Path::new("/etc/passwd"))
            .is_err());
    }
}
