use std::{net::SocketAddr, sync::Arc, thread};

use anyhow::Context;
use nodebed_core::{
    cache::ConnectionCache,
    config::DaemonConfig,
    orchestrator::ThreadDispatcher,
    server::{ConnectionManager, Multiplexer, ProtocolRouter, ShutdownHandle},
    wire::{NodeId, ProtocolId},
    AnyResult,
};
use nodebed_services::{
    agent::Agent,
    builder::{ServiceBuilder, ServiceLauncher},
    client::AgentClient,
    command::CommandListener,
    hub::{Hub, HubQuery, LocalHub, RemoteHub, ServiceRegistrar},
    logging::LogServer,
    spawner::Spawner,
};
use signal_hook::{
    consts::signal::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::{info, warn};

/// Everything a node runs, wired together but not started yet.
pub struct Daemon {
    pub node_id: NodeId,
    manager: ConnectionManager,
}

impl Daemon {
    pub fn build(config: &DaemonConfig) -> AnyResult<Self> {
        let cache = Arc::new(ConnectionCache::new());
        let dispatcher = ThreadDispatcher::new();
        let builder = Arc::new(ServiceBuilder::with_builtins(config.services.clone()));
        info!("known services: {:?}", builder.names());
        let listen_addr = config.listen_addr()?;

        let mut router = ProtocolRouter::builder(cache.clone())
            .register(ProtocolId::Logging, Arc::new(LogServer::new(cache.clone())))
            .register(ProtocolId::Agent, Arc::new(Agent::new(cache.clone())?));
        let mut launcher = ServiceLauncher::new(builder, dispatcher.clone());

        let node_id = if config.hub.enabled {
            let hub = Arc::new(Hub::new(cache.clone())?);
            router = router.register(ProtocolId::Hub, hub.clone());
            cache.register_node(NodeId::HUB, Some(listen_addr));
            info!("node {} hosts the hub", config.node.name);

            // Own services are registered through an in-process session.
            let loopback = ProtocolRouter::builder(cache.clone())
                .register(ProtocolId::Hub, hub)
                .build();
            let local = LocalHub::new(Arc::new(loopback)).with_peer(listen_addr);
            launcher = launcher.with_registrar(ServiceRegistrar::new(local, NodeId::HUB));
            let report = announcement(config, listen_addr);
            if let Err(e) = cache.set_report(NodeId::HUB, report.into()) {
                warn!("could not store the hub's own report: {e}");
            }
            NodeId::HUB
        } else {
            match join_hub(config) {
                Some((hub, node_id)) => {
                    announce(&hub, node_id, announcement(config, listen_addr));
                    launcher = launcher.with_registrar(ServiceRegistrar::new(hub, node_id));
                    node_id
                }
                None => NodeId::UNASSIGNED,
            }
        };

        let router = router
            .register(ProtocolId::Spawn, Arc::new(Spawner::new(launcher.clone())?))
            .build();
        let multiplexer = Multiplexer::new(listen_addr, config.runtime.clone(), Arc::new(router));
        let mut manager = ConnectionManager::new(multiplexer, dispatcher);
        if let Some(addr) = config.command_addr()? {
            let listener = CommandListener::bind(addr, launcher)?;
            manager = manager.with_companion(listener);
        }
        Ok(Self { node_id, manager })
    }

    /// Bind, relay termination signals to the manager and serve until one
    /// arrives.
    pub fn run(mut self) -> AnyResult<()> {
        let addr = self.manager.bind()?;
        info!("node {} listening on {addr}", self.node_id);
        relay_signals(self.manager.shutdown_handle())?;
        self.manager.run()
    }
}

/// Ask the remote hub for a node id. `None` leaves the node unassigned.
fn join_hub(config: &DaemonConfig) -> Option<(RemoteHub, NodeId)> {
    let addr = match config.hub_addr() {
        Ok(Some(addr)) => addr,
        _ => {
            warn!("no hub address configured, node stays unassigned");
            return None;
        }
    };
    let hub = RemoteHub::new(addr, config.hub.connect_retries, config.hub.connect_timeout());
    match hub.request_node_id() {
        Ok(id) => {
            info!("hub at {addr} assigned node id {id}");
            Some((hub, id))
        }
        Err(e) => {
            warn!("could not get a node id from the hub at {addr}: {e:?}");
            None
        }
    }
}

fn announcement(config: &DaemonConfig, listen_addr: SocketAddr) -> Vec<u8> {
    serde_json::json!({
        "name": config.node.name,
        "listen": listen_addr.to_string(),
    })
    .to_string()
    .into_bytes()
}

/// Publish this node's first report through the hub's agent.
fn announce(hub: &RemoteHub, node_id: NodeId, report: Vec<u8>) {
    let result =
        AgentClient::connect(hub.addr(), node_id).and_then(|mut agent| agent.update(&report));
    match result {
        Ok(()) => info!("node {node_id} announced to the hub at {}", hub.addr()),
        Err(e) => warn!("node {node_id} could not announce itself: {e}"),
    }
}

fn relay_signals(shutdown: ShutdownHandle) -> AnyResult<()> {
    let mut signals =
        Signals::new([SIGINT, SIGTERM, SIGHUP]).context("installing signal handlers")?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                if shutdown.request() {
                    info!("signal {signal} received, shutting down");
                } else {
                    info!("signal {signal} received, shutdown already in progress");
                }
            }
        })?;
    Ok(())
}
