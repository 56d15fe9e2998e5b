//! Session-level server machinery: protocol routing, the per-session stage
//! machine, the socket multiplexer and the connection manager.
use std::{net::SocketAddr, sync::Arc};

use tracing::warn;

use crate::{
    cache::ConnectionCache,
    error::ProtocolError,
    stage::{Stage, Transition},
    wire::{NodeId, ProtocolId, SessionId, NET_ENUM_SIZE},
};

mod manager;
mod multiplexer;
mod runtime;
mod session;

pub use manager::{ConnectionManager, ShutdownHandle};
pub use multiplexer::{bind_listener, Multiplexer, StopHandle};
pub use runtime::RuntimeWrapper;
pub use session::{Feed, SessionMachine};

/// A protocol handler selected by the session header.
///
/// All callbacks for one session run on the multiplexer thread, in order.
/// Implementations are shared between sessions and must keep per-session
/// state keyed by [`SessionId`].
pub trait SubServer: Send + Sync {
    fn name(&self) -> &'static str;

    /// First stage after the session header.
    fn serv_init(&self, node_id: NodeId, session: SessionId) -> Stage;

    fn on_frame(
        &self,
        session: SessionId,
        stage: Stage,
        frame: &[u8],
    ) -> Result<Transition, ProtocolError>;

    /// Runs exactly once per session that reached `serv_init`.
    fn serv_close(&self, _session: SessionId) {}
}

/// Maps protocol ids to sub-servers. Built once, then shared read-only.
pub struct ProtocolRouter {
    servers: Vec<Option<Arc<dyn SubServer>>>,
    cache: Arc<ConnectionCache>,
}

impl ProtocolRouter {
    pub fn builder(cache: Arc<ConnectionCache>) -> RouterBuilder {
        RouterBuilder {
            servers: vec![None; NET_ENUM_SIZE],
            cache,
        }
    }

    /// Bounds-checked lookup. The reserved id never routes.
    pub fn route(&self, protocol_id: u16) -> Option<(ProtocolId, Arc<dyn SubServer>)> {
        let protocol = ProtocolId::from_u16(protocol_id)?;
        if protocol == ProtocolId::Reserved {
            return None;
        }
        let server = self.servers.get(protocol.index())?.clone()?;
        Some((protocol, server))
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    /// Open a session for a freshly accepted peer.
    pub fn open_session(self: &Arc<Self>, peer: SocketAddr) -> SessionMachine {
        SessionMachine::new(self.clone(), peer)
    }
}

pub struct RouterBuilder {
    servers: Vec<Option<Arc<dyn SubServer>>>,
    cache: Arc<ConnectionCache>,
}

impl RouterBuilder {
    /// Install `server` at the slot of `protocol`, replacing any previous one.
    pub fn register(mut self, protocol: ProtocolId, server: Arc<dyn SubServer>) -> Self {
        if protocol == ProtocolId::Reserved {
            warn!("refusing to route the reserved protocol id to {}", server.name());
            return self;
        }
        self.servers[protocol.index()] = Some(server);
        self
    }

    pub fn build(self) -> ProtocolRouter {
        ProtocolRouter {
            servers: self.servers,
            cache: self.cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl SubServer for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn serv_init(&self, _: NodeId, _: SessionId) -> Stage {
            Stage::new(1, 0)
        }

        fn on_frame(&self, _: SessionId, _: Stage, _: &[u8]) -> Result<Transition, ProtocolError> {
            Ok(Transition::close())
        }
    }

    #[test]
    fn lookups_are_bounds_checked() {
        let router = ProtocolRouter::builder(Arc::new(ConnectionCache::new()))
            .register(ProtocolId::Reserved, Arc::new(Named("reserved")))
            .register(ProtocolId::Hub, Arc::new(Named("old hub")))
            .register(ProtocolId::Hub, Arc::new(Named("hub")))
            .build();
        let (protocol, server) = router.route(1).unwrap();
        assert_eq!(protocol, ProtocolId::Hub);
        assert_eq!(server.name(), "hub");
        assert!(router.route(0).is_none());
        assert!(router.route(2).is_none());
        assert!(router.route(NET_ENUM_SIZE as u16).is_none());
        assert!(router.route(u16::MAX).is_none());
    }
}
