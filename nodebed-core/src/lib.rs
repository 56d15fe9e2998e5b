mod error;
pub use error::{AnyError, AnyResult, CacheError, Error, ProtocolError, Result};

pub mod cache;
pub mod config;
pub mod orchestrator;
pub mod sampler;
pub mod server;
pub mod stage;
pub mod table;
pub mod util;
pub mod wire;
