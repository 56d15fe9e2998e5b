//! Sub-servers, the service builder and the clients of a nodebed daemon.
//!
//! - [`hub`], [`logging`], [`agent`], [`spawner`]: [`SubServer`] implementations routed by
//!   protocol id.
//! - [`builder`]: turns a service name plus config into a dispatchable runnable and launches it.
//! - [`command`]: the line-oriented launch listener.
//! - [`client`]: blocking clients used by the launcher and by remote hub queries.
//!
//! [`SubServer`]: nodebed_core::server::SubServer
pub mod agent;
pub mod builder;
pub mod client;
pub mod command;
pub mod hub;
pub mod logging;
pub mod spawner;
