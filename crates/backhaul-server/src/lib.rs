//! Tunnel session management for the backhaul gateway
//!
//! Owns the gateway-side runtime state of every tunneled service: the
//! service registry, per-service listeners (bound ports or vhost routes),
//! the work-connection pool and its refill protocol, and the handoff of
//! accepted public connections to pooled work connections.

pub mod config;
pub mod joiner;
pub mod listener;
pub mod registry;
pub mod service;
pub mod udp;

pub use config::ServiceConfig;
pub use joiner::{PassthroughJoiner, StreamJoiner};
pub use listener::{RouteListener, ServiceListener, TcpPortListener};
pub use registry::{ServiceRegistry, VhostTables};
pub use service::{ProxyService, ServiceStatus};

use std::time::Duration;
use thiserror::Error;

/// Service-layer errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Conn(#[from] backhaul_connection::ConnError),

    #[error("Vhost error: {0}")]
    Vhost(#[from] backhaul_vhost::VhostError),

    #[error("Protocol error: {0}")]
    Proto(#[from] backhaul_proto::ProtoError),

    #[error("Failed to bind {addr}: {reason}")]
    BindError { addr: String, reason: String },

    #[error("Service {0} needs at least one custom domain or a subdomain")]
    MissingDomains(String),

    #[error("Service {0} needs an explicit listen port")]
    MissingPort(String),

    #[error("Service {0} is already registered and running")]
    NameConflict(String),

    #[error("Service {0} is not registered")]
    NotFound(String),

    #[error("Service {0} has not been started")]
    NotStarted(String),

    #[error("Service {0} is closed")]
    Closed(String),

    #[error("No work connection for {name} within {timeout:?}")]
    WorkConnTimeout { name: String, timeout: Duration },

    #[error("Listener closed")]
    ListenerClosed,
}
