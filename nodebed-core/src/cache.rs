//! Shared connection state keyed by node id and session id.
//!
//! The cache is the only state touched both by the multiplexer thread and by
//! other threads (loopback hub queries, the daemon startup path), so every
//! operation takes the same mutex. Callers that need a read-modify-write
//! spanning several operations use [`ConnectionCache::with_lock`].
use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;

use crate::{
    error::CacheError,
    wire::{NodeId, ProtocolId, SessionId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub node_id: NodeId,
    pub addr: Option<SocketAddr>,
    pub services: BTreeSet<u32>,
    /// Latest state report pushed by the node's agent.
    pub report: Option<Bytes>,
}

impl NodeData {
    fn new(node_id: NodeId, addr: Option<SocketAddr>) -> Self {
        Self {
            node_id,
            addr,
            services: BTreeSet::new(),
            report: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionData {
    pub peer: SocketAddr,
    pub node_id: Option<NodeId>,
    pub protocol: Option<ProtocolId>,
}

#[derive(Debug, Default)]
pub struct CacheState {
    nodes: HashMap<NodeId, NodeData>,
    sessions: HashMap<SessionId, SessionData>,
    free_session_ids: BTreeSet<u32>,
    next_session_id: u32,
}

impl CacheState {
    pub fn open_session(&mut self, peer: SocketAddr) -> SessionId {
        let raw = match self.free_session_ids.pop_first() {
            Some(id) => id,
            None => {
                let id = self.next_session_id;
                self.next_session_id += 1;
                id
            }
        };
        let id = SessionId(raw);
        self.sessions.insert(
            id,
            SessionData {
                peer,
                node_id: None,
                protocol: None,
            },
        );
        id
    }

    pub fn close_session(&mut self, id: SessionId) -> Option<SessionData> {
        let data = self.sessions.remove(&id)?;
        self.free_session_ids.insert(id.0);
        Some(data)
    }

    pub fn session(&self, id: SessionId) -> Option<&SessionData> {
        self.sessions.get(&id)
    }

    pub fn set_session_protocol(
        &mut self,
        id: SessionId,
        protocol: ProtocolId,
    ) -> Result<(), CacheError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(CacheError::UnknownSession(id.0))?;
        session.protocol = Some(protocol);
        Ok(())
    }

    /// Bind a session to `node_id` and refresh the node's last known
    /// address to the session's peer.
    pub fn resolve_node(&mut self, id: SessionId, node_id: NodeId) -> Result<(), CacheError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(CacheError::UnknownSession(id.0))?;
        session.node_id = Some(node_id);
        let peer = session.peer;
        self.nodes
            .entry(node_id)
            .and_modify(|node| node.addr = Some(peer))
            .or_insert_with(|| NodeData::new(node_id, Some(peer)));
        Ok(())
    }

    pub fn register_node(&mut self, node_id: NodeId, addr: Option<SocketAddr>) {
        self.nodes
            .entry(node_id)
            .and_modify(|node| node.addr = addr.or(node.addr))
            .or_insert_with(|| NodeData::new(node_id, addr));
    }

    pub fn add_service(&mut self, node_id: NodeId, service_id: u32) -> Result<(), CacheError> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(CacheError::UnknownNode(node_id.0))?;
        node.services.insert(service_id);
        Ok(())
    }

    pub fn set_report(&mut self, node_id: NodeId, report: Bytes) -> Result<(), CacheError> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(CacheError::UnknownNode(node_id.0))?;
        node.report = Some(report);
        Ok(())
    }

    pub fn node(&self, node_id: NodeId) -> Option<&NodeData> {
        self.nodes.get(&node_id)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionCache {
    state: Mutex<CacheState>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the cache locked.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn open_session(&self, peer: SocketAddr) -> SessionId {
        self.lock().open_session(peer)
    }

    pub fn close_session(&self, id: SessionId) -> Option<SessionData> {
        self.lock().close_session(id)
    }

    pub fn session(&self, id: SessionId) -> Option<SessionData> {
        self.lock().session(id).cloned()
    }

    pub fn set_session_protocol(
        &self,
        id: SessionId,
        protocol: ProtocolId,
    ) -> Result<(), CacheError> {
        self.lock().set_session_protocol(id, protocol)
    }

    pub fn resolve_node(&self, id: SessionId, node_id: NodeId) -> Result<(), CacheError> {
        self.lock().resolve_node(id, node_id)
    }

    pub fn register_node(&self, node_id: NodeId, addr: Option<SocketAddr>) {
        self.lock().register_node(node_id, addr)
    }

    pub fn add_service(&self, node_id: NodeId, service_id: u32) -> Result<(), CacheError> {
        self.lock().add_service(node_id, service_id)
    }

    pub fn set_report(&self, node_id: NodeId, report: Bytes) -> Result<(), CacheError> {
        self.lock().set_report(node_id, report)
    }

    pub fn report(&self, node_id: NodeId) -> Option<Bytes> {
        self.lock().node(node_id).and_then(|n| n.report.clone())
    }

    pub fn node(&self, node_id: NodeId) -> Option<NodeData> {
        self.lock().node(node_id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn session_ids_are_reused_smallest_first() {
        let cache = ConnectionCache::new();
        let a = cache.open_session(addr(1));
        let b = cache.open_session(addr(2));
        let c = cache.open_session(addr(3));
        assert_eq!((a, b, c), (SessionId(0), SessionId(1), SessionId(2)));
        cache.close_session(c);
        cache.close_session(a);
        assert_eq!(cache.open_session(addr(4)), SessionId(0));
        assert_eq!(cache.open_session(addr(5)), SessionId(2));
        assert_eq!(cache.open_session(addr(6)), SessionId(3));
    }

    #[test]
    fn closing_twice_is_harmless() {
        let cache = ConnectionCache::new();
        let a = cache.open_session(addr(1));
        assert!(cache.close_session(a).is_some());
        assert!(cache.close_session(a).is_none());
        assert_eq!(cache.open_session(addr(2)), a);
        assert_eq!(cache.open_session(addr(3)), SessionId(1));
    }

    #[test]
    fn resolving_a_node_refreshes_its_address() {
        let cache = ConnectionCache::new();
        cache.register_node(NodeId(5), Some(addr(100)));
        cache.add_service(NodeId(5), 9).unwrap();
        let s = cache.open_session(addr(200));
        cache.resolve_node(s, NodeId(5)).unwrap();
        let node = cache.node(NodeId(5)).unwrap();
        assert_eq!(node.addr, Some(addr(200)));
        assert!(node.services.contains(&9));
        assert_eq!(cache.session(s).unwrap().node_id, Some(NodeId(5)));
    }

    #[test]
    fn unknown_nodes_and_sessions_are_errors() {
        let cache = ConnectionCache::new();
        assert_eq!(
            cache.add_service(NodeId(3), 1),
            Err(CacheError::UnknownNode(3))
        );
        assert_eq!(
            cache.resolve_node(SessionId(8), NodeId(3)),
            Err(CacheError::UnknownSession(8))
        );
    }

    #[test]
    fn with_lock_spans_several_operations() {
        let cache = ConnectionCache::new();
        let count = cache.with_lock(|state| {
            state.register_node(NodeId(2), None);
            state.add_service(NodeId(2), 2).unwrap();
            state.node(NodeId(2)).map(|n| n.services.len())
        });
        assert_eq!(count, Some(1));
        assert_eq!(cache.node_count(), 1);
    }
}
