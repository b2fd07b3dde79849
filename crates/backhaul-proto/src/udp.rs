//! UDP relay envelope
//!
//! UDP services have no stream to hand to a work connection, so each
//! datagram crosses the (TCP) work channel wrapped in a one-line JSON
//! envelope: base64 payload plus the source and destination addresses the
//! relay needs to route the reply.

use crate::ProtoError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// One relayed datagram.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UdpEnvelope {
    /// base64-encoded datagram payload
    pub content: String,
    /// "ip:port" of the public client the datagram came from
    pub src: String,
    /// "ip:port" the datagram was addressed to
    pub dst: String,
}

impl UdpEnvelope {
    pub fn wrap(payload: &[u8], src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            content: BASE64.encode(payload),
            src: src.to_string(),
            dst: dst.to_string(),
        }
    }

    /// Decode the payload bytes.
    pub fn payload(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(BASE64.decode(&self.content)?)
    }

    pub fn src_addr(&self) -> Result<SocketAddr, ProtoError> {
        parse_addr(&self.src)
    }

    pub fn dst_addr(&self) -> Result<SocketAddr, ProtoError> {
        parse_addr(&self.dst)
    }

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

fn parse_addr(addr: &str) -> Result<SocketAddr, ProtoError> {
    addr.parse().map_err(|e: std::net::AddrParseError| ProtoError::InvalidAddr {
        addr: addr.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "203.0.113.9:50123".parse().unwrap(),
            "127.0.0.1:7000".parse().unwrap(),
        )
    }

    #[test]
    fn test_round_trip() {
        let (src, dst) = addrs();
        let payload = b"\x00\x01\xffhello\n\r\x80".to_vec();

        let env = UdpEnvelope::wrap(&payload, src, dst);
        let line = env.to_line().unwrap();
        assert!(line.ends_with('\n'));

        let back = UdpEnvelope::from_line(&line).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.payload().unwrap(), payload);
        assert_eq!(back.src_addr().unwrap(), src);
        assert_eq!(back.dst_addr().unwrap(), dst);
    }

    #[test]
    fn test_empty_payload() {
        let (src, dst) = addrs();
        let env = UdpEnvelope::wrap(&[], src, dst);
        let back = UdpEnvelope::from_line(&env.to_line().unwrap()).unwrap();
        assert_eq!(back.payload().unwrap(), Vec::<u8>::new());
        assert_eq!(back.src, src.to_string());
        assert_eq!(back.dst, dst.to_string());
    }

    #[test]
    fn test_newline_heavy_payload_stays_one_line() {
        let (src, dst) = addrs();
        let payload = vec![b'\n'; 64];
        let env = UdpEnvelope::wrap(&payload, src, dst);
        let line = env.to_line().unwrap();
        // base64 keeps the framing byte-safe
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(UdpEnvelope::from_line(&line).unwrap().payload().unwrap(), payload);
    }

    #[test]
    fn test_bad_content_rejected() {
        let env = UdpEnvelope {
            content: "not base64!!!".to_string(),
            src: "127.0.0.1:1".to_string(),
            dst: "127.0.0.1:2".to_string(),
        };
        assert!(env.payload().is_err());
    }

    #[test]
    fn test_bad_addr_rejected() {
        let env = UdpEnvelope {
            content: String::new(),
            src: "nowhere".to_string(),
            dst: "127.0.0.1:2".to_string(),
        };
        assert!(env.src_addr().is_err());
        assert!(env.dst_addr().is_ok());
    }
}
