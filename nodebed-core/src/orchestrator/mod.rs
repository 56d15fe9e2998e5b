//! Thread lifecycle management for services and other long-running work.
//!
//! - [`Runnable`]: the `start`/`stop` contract every dispatched unit honors.
//! - [`Interrupt`]: the interruptible wait a runnable blocks on between work cycles.
//! - [`ThreadDispatcher`]: spawns each runnable on its own OS thread, tracks the live ones and
//!   tears all of them down in two phases (signal everyone, then join everyone).
mod dispatcher;
mod runnable;

pub use dispatcher::ThreadDispatcher;
pub use runnable::{Interrupt, Runnable};
