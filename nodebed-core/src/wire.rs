//! Binary wire format shared by the daemon and its clients.
//!
//! Everything is big-endian. A session always starts with a [`SessionHeader`];
//! what follows depends on the sub-server selected by its protocol id.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use derive_more::{Display, From, Into};

use crate::error::ProtocolError;

pub const SESSION_HEADER_LEN: usize = 6;
pub const REQUEST_HEADER_LEN: usize = 6;
pub const LENGTH_PREFIX_LEN: usize = 4;
pub const STATUS_LEN: usize = 2;

/// Upper bound for every variable-length frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub const ACK: u16 = 17;
pub const NACK: u16 = 19;

pub const HUB_RESERVED: u16 = 0;
pub const HUB_NODE_ID_REQ: u16 = 1;
pub const HUB_SERVICE_ID_REQ: u16 = 2;
pub const HUB_ENUM_SIZE: usize = 3;

pub const AGENT_RESERVED: u16 = 0;
pub const AGENT_UPDATE_REQ: u16 = 1;
pub const AGENT_SENSE_REQ: u16 = 2;
pub const AGENT_ENUM_SIZE: usize = 3;

pub const SPAWNER_RESERVED: u16 = 0;
pub const SPAWNER_LAUNCH_SERVICE: u16 = 1;
pub const SPAWNER_ENUM_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const UNASSIGNED: NodeId = NodeId(0);
    pub const HUB: NodeId = NodeId(1);
    pub const FIRST_ASSIGNABLE: NodeId = NodeId(2);

    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into)]
pub struct SessionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ProtocolId {
    Reserved = 0,
    Hub = 1,
    Logging = 2,
    Agent = 3,
    Spawn = 4,
}

pub const NET_ENUM_SIZE: usize = 5;

impl ProtocolId {
    pub const ALL: [ProtocolId; NET_ENUM_SIZE] = [
        ProtocolId::Reserved,
        ProtocolId::Hub,
        ProtocolId::Logging,
        ProtocolId::Agent,
        ProtocolId::Spawn,
    ];

    pub fn from_u16(raw: u16) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn index(self) -> usize {
        self as u16 as usize
    }
}

fn ensure_len(frame: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if frame.len() < expected {
        return Err(ProtocolError::Truncated {
            expected,
            got: frame.len(),
        });
    }
    Ok(())
}

/// First frame of every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeader {
    pub protocol_id: u16,
    pub node_id: NodeId,
}

impl SessionHeader {
    pub fn new(protocol: ProtocolId, node_id: NodeId) -> Self {
        Self {
            protocol_id: protocol as u16,
            node_id,
        }
    }

    pub fn decode(mut frame: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(frame, SESSION_HEADER_LEN)?;
        Ok(Self {
            protocol_id: frame.get_u16(),
            node_id: NodeId(frame.get_u32()),
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.protocol_id);
        dst.put_u32(self.node_id.0);
    }
}

/// Request frame used by the hub, agent and spawner sub-servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub request_id: u16,
    pub param: u32,
}

impl RequestHeader {
    pub fn new(request_id: u16, param: u32) -> Self {
        Self { request_id, param }
    }

    pub fn decode(mut frame: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(frame, REQUEST_HEADER_LEN)?;
        Ok(Self {
            request_id: frame.get_u16(),
            param: frame.get_u32(),
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.request_id);
        dst.put_u32(self.param);
    }
}

pub fn encode_u32(value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(value);
    buf.freeze()
}

pub fn decode_u32(mut frame: &[u8]) -> Result<u32, ProtocolError> {
    ensure_len(frame, 4)?;
    Ok(frame.get_u32())
}

pub fn encode_status(status: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(STATUS_LEN);
    buf.put_u16(status);
    buf.freeze()
}

pub fn decode_status(mut frame: &[u8]) -> Result<u16, ProtocolError> {
    ensure_len(frame, STATUS_LEN)?;
    Ok(frame.get_u16())
}

/// Validate a length announced by the peer before committing to read it.
pub fn checked_frame_len(len: u32) -> Result<usize, ProtocolError> {
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(len)
}
