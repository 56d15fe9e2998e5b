use std::{io, net::SocketAddr};

use thiserror::Error;

pub type AnyError = anyhow::Error;
pub type AnyResult<T> = anyhow::Result<T>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Io error: {0}")]
    Io(#[from] io::Error),
    #[error("address {addr} is already in use")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("permission denied binding {addr}")]
    Permission {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Faults raised while decoding or handling one session's frames.
///
/// Every variant is local to a single session: the multiplexer logs it and
/// closes that session only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame too short: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("unknown request id {0}")]
    UnknownRequest(u16),
    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
    #[error("session {0} has no resolved node id")]
    NodeUnresolved(u32),
    #[error("unexpected stage step {0}")]
    UnexpectedStep(u16),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("malformed record: {0}")]
    Record(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("node {0} is not registered")]
    UnknownNode(u32),
    #[error("session {0} is not open")]
    UnknownSession(u32),
}
