use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};

use anyhow::{anyhow, Result};
use clap::Parser;
use nodebed_core::config::{parse_file, DaemonConfig, NodeConfig};
use nodebed_services::client::{Launcher, DEFAULT_RETRIES};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

/// Ask a node daemon to launch a service.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Name of the service to launch
    #[clap(value_parser)]
    service: String,

    /// Service config, relative to the daemon's service directory
    #[clap(long, value_parser)]
    service_config: Option<PathBuf>,

    /// System config to read the daemon's address from
    #[clap(long, value_parser)]
    config: Option<PathBuf>,

    #[clap(long, value_parser)]
    host: Option<IpAddr>,

    #[clap(long, value_parser)]
    port: Option<u16>,

    #[clap(long, value_parser, default_value_t = DEFAULT_RETRIES)]
    retries: u32,

    #[clap(long, value_parser, default_value_t = 2000)]
    timeout_ms: u64,

    /// Use the line-command listener instead of the spawner protocol
    #[clap(long, action)]
    legacy: bool,
}

impl Args {
    fn daemon_addr(&self) -> Result<SocketAddr> {
        let node = match &self.config {
            Some(path) => parse_file::<DaemonConfig>(path)?.node,
            None => NodeConfig::default(),
        };
        let host = match self.host {
            Some(host) => host,
            None => match node.host.parse::<IpAddr>() {
                Ok(ip) if !ip.is_unspecified() => ip,
                _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
            },
        };
        let port = match (self.port, self.legacy) {
            (Some(port), _) => port,
            (None, false) => node.port,
            (None, true) => node
                .command_port
                .ok_or_else(|| anyhow!("--legacy needs --port or node.command_port"))?,
        };
        Ok(SocketAddr::new(host, port))
    }

    fn launch(&self) -> Result<()> {
        let addr = self.daemon_addr()?;
        let launcher = Launcher::new(addr)
            .with_retries(self.retries)
            .with_timeout(Duration::from_millis(self.timeout_ms));
        let config = self.service_config.as_deref();
        match self.legacy {
            true => launcher.launch_legacy(&self.service, config)?,
            false => launcher.launch(&self.service, config)?,
        }
        tracing::info!("{} launched on {addr}", self.service);
        Ok(())
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    match args.launch() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("launching {} failed: {e:#}", args.service);
            ExitCode::FAILURE
        }
    }
}
