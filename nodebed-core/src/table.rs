//! Request dispatch tables for sub-servers speaking the request-header framing.
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use bytes::Bytes;

use crate::{
    error::ProtocolError,
    stage::{Stage, Transition},
    wire::{checked_frame_len, RequestHeader, SessionId, REQUEST_HEADER_LEN},
};

/// Step tags shared by every table-driven sub-server. Sub-servers may define
/// further steps starting at [`STEP_CUSTOM`].
pub const STEP_REQUEST: u16 = 0;
pub const STEP_PAYLOAD: u16 = 1;
pub const STEP_CUSTOM: u16 = 16;

pub const REQUEST_STAGE: Stage = Stage::new(REQUEST_HEADER_LEN, STEP_REQUEST);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLen {
    Fixed(usize),
    /// Payload length is the `param` field of the request header.
    Param,
}

/// A fully decoded request: header plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_id: u16,
    pub param: u32,
    pub payload: Bytes,
}

pub type RequestHandler<H> = fn(&H, SessionId, Request) -> Result<Transition, ProtocolError>;

pub struct RequestDescriptor<H> {
    pub request_id: u16,
    pub payload: PayloadLen,
    pub handler: RequestHandler<H>,
}

impl<H> Clone for RequestDescriptor<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for RequestDescriptor<H> {}

/// Fixed-size table indexed by request id.
pub struct ProtocolTable<H> {
    entries: Vec<Option<RequestDescriptor<H>>>,
}

impl<H> ProtocolTable<H> {
    pub fn new(size: usize) -> Self {
        Self {
            entries: vec![None; size],
        }
    }

    /// Assign the descriptor at index `request_id`.
    ///
    /// Ids outside the table are a programming error in the sub-server and
    /// reported to the caller instead of growing the table.
    pub fn register(
        mut self,
        request_id: u16,
        payload: PayloadLen,
        handler: RequestHandler<H>,
    ) -> Result<Self, ProtocolError> {
        let slot = self
            .entries
            .get_mut(request_id as usize)
            .ok_or(ProtocolError::UnknownRequest(request_id))?;
        *slot = Some(RequestDescriptor {
            request_id,
            payload,
            handler,
        });
        Ok(self)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, request_id: u16) -> Option<&RequestDescriptor<H>> {
        self.entries.get(request_id as usize).and_then(Option::as_ref)
    }

    /// Decode a request header and look its descriptor up.
    pub fn resolve(
        &self,
        frame: &[u8],
    ) -> Result<(RequestHeader, RequestDescriptor<H>), ProtocolError> {
        let header = RequestHeader::decode(frame)?;
        let desc = self
            .get(header.request_id)
            .copied()
            .ok_or(ProtocolError::UnknownRequest(header.request_id))?;
        Ok((header, desc))
    }

    /// Payload size the descriptor expects for this header.
    pub fn payload_len(
        desc: &RequestDescriptor<H>,
        header: &RequestHeader,
    ) -> Result<usize, ProtocolError> {
        match desc.payload {
            PayloadLen::Fixed(n) => Ok(n),
            PayloadLen::Param => checked_frame_len(header.param),
        }
    }
}

/// Session-scoped memory for a request whose payload is still being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub header: RequestHeader,
}

/// Drives the two generic steps of a table-driven sub-server: the request
/// header, then the payload announced by its descriptor.
///
/// Sub-servers call [`RequestReader::on_frame`] for [`STEP_REQUEST`] and
/// [`STEP_PAYLOAD`] and handle their own steps from [`STEP_CUSTOM`] on.
pub struct RequestReader<H> {
    table: ProtocolTable<H>,
    pending: Mutex<HashMap<SessionId, PendingRequest>>,
}

impl<H> RequestReader<H> {
    pub fn new(table: ProtocolTable<H>) -> Self {
        Self {
            table,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &ProtocolTable<H> {
        &self.table
    }

    pub fn on_frame(
        &self,
        owner: &H,
        session: SessionId,
        stage: Stage,
        frame: &[u8],
    ) -> Result<Transition, ProtocolError> {
        match stage.step {
            STEP_REQUEST => {
                let (header, desc) = self.table.resolve(frame)?;
                let len = ProtocolTable::payload_len(&desc, &header)?;
                if len == 0 {
                    return (desc.handler)(owner, session, request(header, Bytes::new()));
                }
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(session, PendingRequest { header });
                Ok(Transition::next(Stage::new(len, STEP_PAYLOAD)))
            }
            STEP_PAYLOAD => {
                let pending = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&session)
                    .ok_or(ProtocolError::UnexpectedStep(STEP_PAYLOAD))?;
                let header = pending.header;
                let desc = self
                    .table
                    .get(header.request_id)
                    .copied()
                    .ok_or(ProtocolError::UnknownRequest(header.request_id))?;
                (desc.handler)(
                    owner,
                    session,
                    request(header, Bytes::copy_from_slice(frame)),
                )
            }
            step => Err(ProtocolError::UnexpectedStep(step)),
        }
    }

    /// Drop whatever the session left half-read.
    pub fn forget(&self, session: SessionId) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session);
    }
}

fn request(header: RequestHeader, payload: Bytes) -> Request {
    Request {
        request_id: header.request_id,
        param: header.param,
        payload,
    }
}
