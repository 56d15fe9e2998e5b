//! Agent sub-server: nodes push their latest state report and read back the
//! reports of other nodes. Sessions stay open across requests.
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use nodebed_core::{
    cache::ConnectionCache,
    server::SubServer,
    stage::{Stage, Transition},
    table::{PayloadLen, ProtocolTable, Request, RequestReader, REQUEST_STAGE},
    wire::{
        encode_status, NodeId, SessionId, ACK, AGENT_ENUM_SIZE, AGENT_SENSE_REQ, AGENT_UPDATE_REQ,
        LENGTH_PREFIX_LEN,
    },
    AnyResult, ProtocolError,
};
use tracing::debug;

pub struct Agent {
    cache: Arc<ConnectionCache>,
    requests: RequestReader<Agent>,
}

impl Agent {
    pub fn new(cache: Arc<ConnectionCache>) -> AnyResult<Self> {
        let table = ProtocolTable::new(AGENT_ENUM_SIZE)
            .register(AGENT_UPDATE_REQ, PayloadLen::Param, Agent::on_update)?
            .register(AGENT_SENSE_REQ, PayloadLen::Fixed(0), Agent::on_sense)?;
        Ok(Self {
            cache,
            requests: RequestReader::new(table),
        })
    }

    fn on_update(&self, session: SessionId, req: Request) -> Result<Transition, ProtocolError> {
        let node_id = self
            .cache
            .session(session)
            .and_then(|s| s.node_id)
            .ok_or(ProtocolError::NodeUnresolved(session.0))?;
        debug!("node {node_id} reported {} bytes", req.payload.len());
        self.cache.set_report(node_id, req.payload)?;
        Ok(Transition::reply_and_next(encode_status(ACK), REQUEST_STAGE))
    }

    /// `param` names the node whose report is wanted.
    fn on_sense(&self, _session: SessionId, req: Request) -> Result<Transition, ProtocolError> {
        let report = self.cache.report(NodeId(req.param)).unwrap_or_default();
        let mut reply = BytesMut::with_capacity(LENGTH_PREFIX_LEN + report.len());
        reply.put_u32(report.len() as u32);
        reply.put_slice(&report);
        Ok(Transition::reply_and_next(reply.freeze(), REQUEST_STAGE))
    }
}

impl SubServer for Agent {
    fn name(&self) -> &'static str {
        "agent"
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
