use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use nodebed_core::config::DaemonConfig;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use crate::daemon::Daemon;

mod daemon;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the system config file
    #[clap(value_parser)]
    system_config: PathBuf,

    /// Per-node overrides applied on top of the system config
    #[clap(long, value_parser)]
    node_config: Option<PathBuf>,

    /// Overrides node.name
    #[clap(long, value_parser)]
    node_name: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = DaemonConfig::load(
        &args.system_config,
        args.node_config.as_deref(),
        args.node_name.as_deref(),
    )?;
    tracing::info!("starting node {}", config.node.name);

    Daemon::build(&config)?.run()?;
    tracing::info!("node {} stopped", config.node.name);
    Ok(())
}
