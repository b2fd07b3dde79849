//! Control protocol message types
//!
//! Messages travel over the control connection as newline-delimited JSON:
//! one message per line, tagged by `type`. The gateway never assumes more
//! than one message per line and never splits a message across lines.

use crate::{ProtoError, ServiceType};
use serde::{Deserialize, Serialize};

/// A service registration carried by a `NewService` message.
///
/// Sent by an agent when it opens its control connection (one per service),
/// or at runtime in privilege mode to create a service that has no static
/// configuration on the gateway side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceAnnouncement {
    pub proxy_name: String,
    pub proxy_type: ServiceType,
    #[serde(default)]
    pub privilege_mode: bool,
    /// Unix timestamp the auth key was computed over
    pub timestamp: i64,
    /// `hash(name + token + timestamp)`; verified by the credential
    /// collaborator before this message reaches the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privilege_key: Option<String>,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_gzip: bool,
    #[serde(default)]
    pub pool_count: usize,
    /// Explicit listen port, raw tcp/udp services only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_header_rewrite: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_pwd: Option<String>,
}

/// Main control protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Register a service on a fresh control connection
    NewService(ServiceAnnouncement),

    /// Liveness probe on an established control connection
    Heartbeat { proxy_name: String, timestamp: i64 },

    /// Work-connection coordination. The gateway sends this on the control
    /// connection to request one more work connection; the agent answers by
    /// dialing a new connection whose first line is the same message with
    /// `auth_key` set, so the gateway can hand it to the right service pool.
    NewWorkConn {
        proxy_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_key: Option<String>,
    },
}

impl ControlMessage {
    /// Serialize into exactly one `\n`-terminated line.
    pub fn to_line(&self) -> Result<String, ProtoError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse a single line (trailing newline tolerated).
    pub fn from_line(line: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(line.trim_end_matches(['\r', '\n']))?)
    }
}

/// Reply sent by the gateway on the control connection.
///
/// `code` 0 means accepted; anything else carries a reason in `msg`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlResponse {
    pub code: i64,
    pub msg: String,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            code: 0,
            msg: String::new(),
        }
    }

    pub fn error(code: i64, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn to_line(&self) -> Result<String, ProtoError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(line.trim_end_matches(['\r', '\n']))?)
    }
}
