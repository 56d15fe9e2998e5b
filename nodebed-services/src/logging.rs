//! Remote logging: nodes ship log records to a collector, which re-emits them
//! through the local `tracing` subscriber.
use std::{
    io::Write,
    net::{SocketAddr, TcpStream},
    sync::Arc,
};

use bytes::{BufMut, BytesMut};
use nodebed_core::{
    cache::ConnectionCache,
    server::SubServer,
    stage::{Stage, Transition},
    wire::{checked_frame_len, decode_u32, NodeId, ProtocolId, SessionId, LENGTH_PREFIX_LEN},
    ProtocolError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::client::{open_session, LaunchError, DEFAULT_RETRIES, DEFAULT_TIMEOUT};

const STEP_LENGTH: u16 = 0;
const STEP_RECORD: u16 = 1;
const LENGTH_STAGE: Stage = Stage::new(LENGTH_PREFIX_LEN, STEP_LENGTH);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One log line as it travels on the wire (JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    #[serde(alias = "target")]
    pub logger: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<u32>,
}

impl LogRecord {
    pub fn new(level: LogLevel, logger: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            logger: logger.into(),
            message: message.into(),
            node: None,
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(frame).map_err(|e| ProtocolError::Record(e.to_string()))
    }

    fn emit(&self, fallback_node: Option<NodeId>) {
        let node = self.node.or(fallback_node.map(|n| n.0)).unwrap_or(0);
        let logger = self.logger.as_str();
        let message = self.message.as_str();
        match self.level {
            LogLevel::Trace => trace!(target: "nodebed::remote", node, logger, "{message}"),
            LogLevel::Debug => debug!(target: "nodebed::remote", node, logger, "{message}"),
            LogLevel::Info => info!(target: "nodebed::remote", node, logger, "{message}"),
            LogLevel::Warn => warn!(target: "nodebed::remote", node, logger, "{message}"),
            LogLevel::Error => error!(target: "nodebed::remote", node, logger, "{message}"),
        }
    }
}

/// Collector side of the logging protocol: a stream of length-prefixed
/// records until the peer hangs up.
pub struct LogServer {
    cache: Arc<ConnectionCache>,
}

impl LogServer {
    pub fn new(cache: Arc<ConnectionCache>) -> Self {
        Self { cache }
    }
}

impl SubServer for LogServer {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn serv_init(&self, _node_id: NodeId, _session: SessionId) -> Stage {
        LENGTH_STAGE
    }

    fn on_frame(
        &self,
        session: SessionId,
        stage: Stage,
        frame: &[u8],
    ) -> Result<Transition, ProtocolError> {
        match stage.step {
            STEP_LENGTH => {
                let len = checked_frame_len(decode_u32(frame)?)?;
                if len == 0 {
                    return Ok(Transition::next(LENGTH_STAGE));
                }
                Ok(Transition::next(Stage::new(len, STEP_RECORD)))
            }
            STEP_RECORD => {
                let record = LogRecord::decode(frame)?;
                let node = self.cache.session(session).and_then(|s| s.node_id);
                record.emit(node);
                Ok(Transition::next(LENGTH_STAGE))
            }
            step => Err(ProtocolError::UnexpectedStep(step)),
        }
    }
}

/// Sending side: one long-lived logging session.
pub struct LogClient {
    stream: TcpStream,
    node: NodeId,
}

impl LogClient {
    pub fn connect(addr: SocketAddr, node: NodeId) -> Result<Self, LaunchError> {
        let stream = open_session(
            addr,
            ProtocolId::Logging,
            node,
            DEFAULT_RETRIES,
            DEFAULT_TIMEOUT,
        )?;
        Ok(Self { stream, node })
    }

    pub fn send(&mut self, record: &LogRecord) -> Result<(), LaunchError> {
        let mut record = record.clone();
        if record.node.is_none() && self.node.is_assigned() {
            record.node = Some(self.node.0);
        }
        let body = serde_json::to_vec(&record)
            .map_err(|e| LaunchError::InvalidArgument(e.to_string()))?;
        let len = u32::try_from(body.len())
            .ok()
            .filter(|&l| checked_frame_len(l).is_ok())
            .ok_or_else(|| {
                LaunchError::InvalidArgument(format!("record of {} bytes", body.len()))
            })?;
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
        buf.put_u32(len);
        buf.put_slice(&body);
        self.stream.write_all(&buf)?;
        Ok(())
    }
}
