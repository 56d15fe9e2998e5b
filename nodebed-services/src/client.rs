//! Blocking clients for the daemon's binary protocols.
//!
//! These run outside the multiplexer (the launcher binary, remote hub
//! queries, tests), so they use plain std sockets with timeouts.
use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    path::Path,
    thread,
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use nodebed_core::wire::{
    checked_frame_len, decode_status, NodeId, ProtocolId, RequestHeader, SessionHeader, ACK,
    AGENT_SENSE_REQ, AGENT_UPDATE_REQ, NACK, SPAWNER_LAUNCH_SERVICE, STATUS_LEN,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::command::{encode_command, Command};

pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("could not reach {addr} after {attempts} attempts")]
    Unreachable {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("daemon refused to launch {0}")]
    Rejected(String),
    #[error("unexpected reply {0:?}")]
    UnexpectedReply(String),
    #[error("{0} is not valid for the wire format")]
    InvalidArgument(String),
}

/// Connect with a per-attempt timeout, retrying `retries` times in total.
pub fn connect_with_retries(
    addr: SocketAddr,
    retries: u32,
    timeout: Duration,
) -> Result<TcpStream, LaunchError> {
    let attempts = retries.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(e) => {
                debug!("connect to {addr} attempt {attempt}/{attempts} failed: {e}");
                last = Some(e);
                if attempt < attempts {
                    thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }
    Err(LaunchError::Unreachable {
        addr,
        attempts,
        source: last.unwrap_or_else(|| io::Error::from(io::ErrorKind::TimedOut)),
    })
}

/// Open a session: connect and send the session header.
pub fn open_session(
    addr: SocketAddr,
    protocol: ProtocolId,
    node_id: NodeId,
    retries: u32,
    timeout: Duration,
) -> Result<TcpStream, LaunchError> {
    let mut stream = connect_with_retries(addr, retries, timeout)?;
    let mut header = BytesMut::new();
    SessionHeader::new(protocol, node_id).encode(&mut header);
    stream.write_all(&header)?;
    Ok(stream)
}

fn wire_len(what: &str, len: usize) -> Result<u32, LaunchError> {
    u32::try_from(len)
        .ok()
        .filter(|&l| checked_frame_len(l).is_ok())
        .ok_or_else(|| LaunchError::InvalidArgument(format!("{what} of {len} bytes")))
}

/// Encode a complete spawn request, session header included.
pub fn encode_launch(service: &str, config: Option<&str>) -> Result<Bytes, LaunchError> {
    let config = config.unwrap_or("");
    let mut buf = BytesMut::new();
    SessionHeader::new(ProtocolId::Spawn, NodeId::UNASSIGNED).encode(&mut buf);
    RequestHeader::new(SPAWNER_LAUNCH_SERVICE, wire_len("service name", service.len())?)
        .encode(&mut buf);
    buf.put_slice(service.as_bytes());
    buf.put_u32(wire_len("config path", config.len())?);
    buf.put_slice(config.as_bytes());
    Ok(buf.freeze())
}

/// Asks a node daemon to launch services.
#[derive(Debug, Clone)]
pub struct Launcher {
    addr: SocketAddr,
    retries: u32,
    timeout: Duration,
}

impl Launcher {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn config_str(config: Option<&Path>) -> Result<Option<&str>, LaunchError> {
        config
            .map(|p| {
                p.to_str()
                    .ok_or_else(|| LaunchError::InvalidArgument(p.display().to_string()))
            })
            .transpose()
    }

    /// Launch over the binary spawner protocol.
    pub fn launch(&self, service: &str, config: Option<&Path>) -> Result<(), LaunchError> {
        let request = encode_launch(service, Self::config_str(config)?)?;
        let mut stream = connect_with_retries(self.addr, self.retries, self.timeout)?;
        stream.write_all(&request)?;
        let mut status = [0u8; STATUS_LEN];
        stream.read_exact(&mut status)?;
        match decode_status(&status) {
            Ok(ACK) => Ok(()),
            Ok(NACK) => Err(LaunchError::Rejected(service.to_string())),
            Ok(other) => Err(LaunchError::UnexpectedReply(format!("status {other}"))),
            Err(e) => Err(LaunchError::UnexpectedReply(e.to_string())),
        }
    }

    /// Launch over the line-command listener.
    pub fn launch_legacy(&self, service: &str, config: Option<&Path>) -> Result<(), LaunchError> {
        let command = Command::Spawn {
            service: service.to_string(),
            config: Self::config_str(config)?.map(Into::into),
        };
        let line = encode_command(&command)
            .ok_or_else(|| LaunchError::InvalidArgument(format!("service {service:?}")))?;
        let mut stream = connect_with_retries(self.addr, self.retries, self.timeout)?;
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"E\n")?;
        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        reader.read_line(&mut reply)?;
        match reply.trim_end() {
            "OK" => Ok(()),
            "ERR" => Err(LaunchError::Rejected(service.to_string())),
            other => {
                warn!("unexpected reply from {}: {other:?}", self.addr);
                Err(LaunchError::UnexpectedReply(other.to_string()))
            }
        }
    }
}

/// Agent session: push this node's report, read other nodes' reports.
pub struct AgentClient {
    stream: TcpStream,
}

impl AgentClient {
    pub fn connect(addr: SocketAddr, node_id: NodeId) -> Result<Self, LaunchError> {
        let stream = open_session(
            addr,
            ProtocolId::Agent,
            node_id,
            DEFAULT_RETRIES,
            DEFAULT_TIMEOUT,
        )?;
        Ok(Self { stream })
    }

    pub fn update(&mut self, report: &[u8]) -> Result<(), LaunchError> {
        let mut buf = BytesMut::new();
        RequestHeader::new(AGENT_UPDATE_REQ, wire_len("report", report.len())?).encode(&mut buf);
        buf.put_slice(report);
        self.stream.write_all(&buf)?;
        let mut status = [0u8; STATUS_LEN];
        self.stream.read_exact(&mut status)?;
        match decode_status(&status) {
            Ok(ACK) => Ok(()),
            Ok(other) => Err(LaunchError::UnexpectedReply(format!("status {other}"))),
            Err(e) => Err(LaunchError::UnexpectedReply(e.to_string())),
        }
    }

    /// Latest report of `node`; empty when it never reported.
    pub fn sense(&mut self, node: NodeId) -> Result<Bytes, LaunchError> {
        let mut buf = BytesMut::new();
        RequestHeader::new(AGENT_SENSE_REQ, node.0).encode(&mut buf);
        self.stream.write_all(&buf)?;
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len)?;
        let len = checked_frame_len(u32::from_be_bytes(len))
            .map_err(|e| LaunchError::UnexpectedReply(e.to_string()))?;
        let mut report = vec![0u8; len];
        self.stream.read_exact(&mut report)?;
        Ok(report.into())
    }
}
