//! Connection management for the backhaul gateway
//!
//! Provides the close-once, line-oriented wrapper over a TCP stream used by
//! listeners, tunnel sessions, and the virtual-host multiplexer, plus the
//! tee-capturing reader the multiplexer uses to peek at a connection
//! without consuming bytes from its eventual recipient.

pub mod connection;
pub mod shared;

pub use connection::{ConnError, Connection};
pub use shared::SharedConnection;
