//! Hub sub-server: allocates node ids and service ids for the testbed.
//!
//! Both requests are one-shot: the reply is the 4-byte id and the session
//! closes right after it.
use std::{
    io::{Read, Write},
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use nodebed_core::{
    cache::ConnectionCache,
    server::{ProtocolRouter, SubServer},
    stage::{Stage, Transition},
    table::{PayloadLen, ProtocolTable, Request, RequestReader, REQUEST_STAGE},
    wire::{
        decode_u32, encode_u32, NodeId, ProtocolId, RequestHeader, SessionHeader, SessionId,
        HUB_ENUM_SIZE, HUB_NODE_ID_REQ, HUB_SERVICE_ID_REQ,
    },
    AnyResult, ProtocolError,
};
use tracing::{debug, info, warn};

use crate::client::open_session;

#[derive(Debug)]
struct HubCounters {
    next_node: u32,
    next_service: u32,
}

impl Default for HubCounters {
    fn default() -> Self {
        Self {
            next_node: NodeId::FIRST_ASSIGNABLE.0,
            next_service: 2,
        }
    }
}

pub struct Hub {
    counters: Mutex<HubCounters>,
    cache: Arc<ConnectionCache>,
    requests: RequestReader<Hub>,
}

impl Hub {
    pub fn new(cache: Arc<ConnectionCache>) -> AnyResult<Self> {
        let table = ProtocolTable::new(HUB_ENUM_SIZE)
            .register(HUB_NODE_ID_REQ, PayloadLen::Fixed(0), Hub::on_node_id)?
            .register(HUB_SERVICE_ID_REQ, PayloadLen::Fixed(0), Hub::on_service_id)?;
        Ok(Self {
            counters: Mutex::new(HubCounters::default()),
            cache,
            requests: RequestReader::new(table),
        })
    }

    fn on_node_id(&self, session: SessionId, _: Request) -> Result<Transition, ProtocolError> {
        let peer = self
            .cache
            .session(session)
            .map(|s| s.peer)
            .ok_or(nodebed_core::CacheError::UnknownSession(session.0))?;
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let node_id = NodeId(counters.next_node);
        counters.next_node += 1;
        self.cache.register_node(node_id, Some(peer));
        drop(counters);
        info!("assigned node id {node_id} to {peer}");
        Ok(Transition::reply_and_close(encode_u32(node_id.0)))
    }

    fn on_service_id(&self, session: SessionId, _: Request) -> Result<Transition, ProtocolError> {
        let node_id = self
            .cache
            .session(session)
            .and_then(|s| s.node_id)
            .ok_or(ProtocolError::NodeUnresolved(session.0))?;
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let service_id = counters.next_service;
        self.cache.add_service(node_id, service_id)?;
        counters.next_service += 1;
        drop(counters);
        debug!("assigned service id {service_id} on node {node_id}");
        Ok(Transition::reply_and_close(encode_u32(service_id)))
    }
}

impl SubServer for Hub {
    fn name(&self) -> &'static str {
        "hub"
    }

    fn serv_init(&self, _node_id: NodeId, _session: SessionId) -> Stage {
        REQUEST_STAGE
    }

    fn on_frame(
        &self,
        session: SessionId,
        stage: Stage,
        frame: &[u8],
    ) -> Result<Transition, ProtocolError> {
        self.requests.on_frame(self, session, stage, frame)
    }

    fn serv_close(&self, session: SessionId) {
        self.requests.forget(session);
    }
}

/// Id allocation as seen by a node, wherever the hub lives.
pub trait HubQuery: Send + Sync {
    fn request_node_id(&self) -> AnyResult<NodeId>;

    fn request_service_id(&self, node_id: NodeId) -> AnyResult<u32>;
}

/// Records every service this node launches with the hub.
pub struct ServiceRegistrar {
    hub: Box<dyn HubQuery>,
    node_id: NodeId,
}

impl ServiceRegistrar {
    pub fn new(hub: impl HubQuery + 'static, node_id: NodeId) -> Self {
        Self {
            hub: Box::new(hub),
            node_id,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Ask the hub for a service id for `service`. Failures are logged and
    /// leave the service running unregistered.
    pub fn register(&self, service: &str) -> Option<u32> {
        match self.hub.request_service_id(self.node_id) {
            Ok(id) => {
                info!("{service} registered as service {id} on node {}", self.node_id);
                Some(id)
            }
            Err(e) => {
                warn!("{service} could not be registered with the hub: {e:?}");
                None
            }
        }
    }
}

fn hub_request(node_id: NodeId, request_id: u16) -> BytesMut {
    let mut buf = BytesMut::new();
    SessionHeader::new(ProtocolId::Hub, node_id).encode(&mut buf);
    RequestHeader::new(request_id, 0).encode(&mut buf);
    buf
}

/// Queries the hub hosted by this process through a transient in-memory
/// session, byte for byte what a socket client would send.
pub struct LocalHub {
    router: Arc<ProtocolRouter>,
    peer: SocketAddr,
}

impl LocalHub {
    pub fn new(router: Arc<ProtocolRouter>) -> Self {
        Self {
            router,
            peer: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = peer;
        self
    }

    fn query(&self, node_id: NodeId, request_id: u16) -> AnyResult<u32> {
        let mut session = self.router.open_session(self.peer);
        let feed = session.feed(&hub_request(node_id, request_id));
        session.close();
        let mut reply = BytesMut::new();
        for chunk in feed.replies {
            reply.put_slice(&chunk);
        }
        if reply.is_empty() {
            bail!("hub refused request {request_id} for node {node_id}");
        }
        Ok(decode_u32(&reply)?)
    }
}

impl HubQuery for LocalHub {
    fn request_node_id(&self) -> AnyResult<NodeId> {
        self.query(NodeId::UNASSIGNED, HUB_NODE_ID_REQ).map(NodeId)
    }

    fn request_service_id(&self, node_id: NodeId) -> AnyResult<u32> {
        self.query(node_id, HUB_SERVICE_ID_REQ)
    }
}

/// Queries a hub on another node over TCP.
#[derive(Debug, Clone)]
pub struct RemoteHub {
    addr: SocketAddr,
    retries: u32,
    timeout: Duration,
}

impl RemoteHub {
    pub fn new(addr: SocketAddr, retries: u32, timeout: Duration) -> Self {
        Self {
            addr,
            retries,
            timeout,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn query(&self, node_id: NodeId, request_id: u16) -> AnyResult<u32> {
        let mut stream = open_session(
            self.addr,
            ProtocolId::Hub,
            node_id,
            self.retries,
            self.timeout,
        )?;
        let mut buf = BytesMut::new();
        RequestHeader::new(request_id, 0).encode(&mut buf);
        stream.write_all(&buf)?;
        let mut reply = [0u8; 4];
        stream
            .read_exact(&mut reply)
            .map_err(|e| anyhow!("hub at {} did not answer: {e}", self.addr))?;
        Ok(u32::from_be_bytes(reply))
    }
}

impl HubQuery for RemoteHub {
    fn request_node_id(&self) -> AnyResult<NodeId> {
        self.query(NodeId::UNASSIGNED, HUB_NODE_ID_REQ).map(NodeId)
    }

    fn request_service_id(&self, node_id: NodeId) -> AnyResult<u32> {
        self.query(node_id, HUB_SERVICE_ID_REQ)
    }
}
