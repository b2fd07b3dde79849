//! Virtual-host multiplexing for HTTP and HTTPS tunnels
//!
//! One shared public listener serves many tunneled services: each incoming
//! connection is peeked at just long enough to learn its Host (or SNI) and
//! path, dispatched to the registered route with the longest matching
//! location, and replayed byte-for-byte to whichever service accepts it.
//! Wildcard domains (`*.example.com`) catch single-level subdomains that
//! have no exact route.

pub mod http;
pub mod mux;
pub mod routes;
pub mod sni;

pub use http::{peek_http_request, rewrite_host_header, RequestHead};
pub use mux::VhostMux;
pub use routes::{RouteHandle, RouteTable};
pub use sni::peek_tls_sni;

use thiserror::Error;

/// Virtual-host errors
#[derive(Debug, Error)]
pub enum VhostError {
    #[error("Connection error: {0}")]
    Conn(#[from] backhaul_connection::ConnError),

    #[error("Route already registered for {domain}{location}")]
    RouteConflict { domain: String, location: String },

    #[error("Route closed")]
    RouteClosed,

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Host header not found")]
    MissingHost,

    #[error("SNI extraction failed")]
    SniExtractionFailed,
}
