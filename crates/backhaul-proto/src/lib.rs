//! Protocol types for the backhaul gateway
//!
//! Defines the newline-delimited JSON control protocol spoken between the
//! gateway and agents, the UDP relay envelope, and the service type enum
//! shared by every other crate in the workspace.

pub mod messages;
pub mod udp;

pub use messages::{ControlMessage, ControlResponse, ServiceAnnouncement};
pub use udp::UdpEnvelope;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown service type: {0}")]
    UnknownServiceType(String),

    #[error("Invalid base64 payload: {0}")]
    InvalidPayload(#[from] base64::DecodeError),

    #[error("Invalid address {addr}: {reason}")]
    InvalidAddr { addr: String, reason: String },
}

/// Kind of tunneled service
///
/// Raw types (`Tcp`, `Udp`) get their own bound listener on an explicit
/// port; vhost types (`Http`, `Https`) share the multiplexed listener and
/// are dispatched by host and path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Tcp,
    Udp,
    Http,
    Https,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Tcp => "tcp",
            ServiceType::Udp => "udp",
            ServiceType::Http => "http",
            ServiceType::Https => "https",
        }
    }

    /// Whether this service is exposed through the virtual-host multiplexer
    /// instead of a dedicated bound port.
    pub fn is_vhost(&self) -> bool {
        matches!(self, ServiceType::Http | ServiceType::Https)
    }
}

impl std::str::FromStr for ServiceType {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ServiceType::Tcp),
            "udp" => Ok(ServiceType::Udp),
            "http" => Ok(ServiceType::Http),
            "https" => Ok(ServiceType::Https),
            other => Err(ProtoError::UnknownServiceType(other.to_string())),
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
