//! Service configuration records
//!
//! One `ServiceConfig` per tunneled service, built either from parsed
//! static configuration or from an inbound privilege-mode registration
//! message. Validation runs at load time; a service that fails it is
//! reported and never started, without affecting its siblings.

use crate::ServiceError;
use backhaul_proto::{ServiceAnnouncement, ServiceType};
use serde::{Deserialize, Serialize};

/// Gateway-side registration record for one tunneled service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    pub service_type: ServiceType,
    /// Shared secret the agent's auth key is derived from
    pub auth_token: String,
    /// Bind address for raw tcp/udp listeners
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Explicit listen port; vhost services inherit the shared port instead
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_gzip: bool,
    /// Target number of pre-opened idle work connections
    #[serde(default)]
    pub pool_count: usize,
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub subdomain: Option<String>,
    /// URL path prefixes this service claims on its domains
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub host_header_rewrite: Option<String>,
    #[serde(default)]
    pub http_user: Option<String>,
    #[serde(default)]
    pub http_pwd: Option<String>,
    /// Created at runtime by a privilege-mode agent rather than from
    /// static configuration; removed from the table when closed
    #[serde(default)]
    pub privileged: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

impl ServiceConfig {
    /// Build a privilege-mode record from a registration message.
    pub fn from_announcement(ann: &ServiceAnnouncement, auth_token: &str) -> Self {
        Self {
            name: ann.proxy_name.clone(),
            service_type: ann.proxy_type,
            auth_token: auth_token.to_string(),
            bind_addr: default_bind_addr(),
            listen_port: ann.remote_port.unwrap_or(0),
            use_encryption: ann.use_encryption,
            use_gzip: ann.use_gzip,
            pool_count: ann.pool_count,
            custom_domains: ann.custom_domains.clone(),
            subdomain: ann.subdomain.clone(),
            locations: ann.locations.clone(),
            host_header_rewrite: ann.host_header_rewrite.clone(),
            http_user: ann.http_user.clone(),
            http_pwd: ann.http_pwd.clone(),
            privileged: true,
        }
    }

    /// Load-time validation.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.service_type.is_vhost() {
            if self.custom_domains.is_empty() && self.subdomain.is_none() {
                return Err(ServiceError::MissingDomains(self.name.clone()));
            }
        } else if self.listen_port == 0 {
            return Err(ServiceError::MissingPort(self.name.clone()));
        }
        Ok(())
    }

    /// Locations with the catch-all default applied.
    pub fn effective_locations(&self) -> Vec<String> {
        if self.locations.is_empty() {
            vec![String::new()]
        } else {
            self.locations.clone()
        }
    }

    /// All vhost domains this service claims: custom domains plus the
    /// subdomain composed onto the gateway's base domain.
    pub fn vhost_domains(&self, subdomain_host: &str) -> Vec<String> {
        let mut domains = self.custom_domains.clone();
        if let Some(sub) = &self.subdomain {
            if !sub.is_empty() && !subdomain_host.is_empty() {
                domains.push(format!("{}.{}", sub, subdomain_host));
            }
        }
        domains
    }

    /// Identity comparison used by reload to decide whether a running
    /// service must be torn down. Runtime state (status, pool, listeners)
    /// and cosmetic fields are deliberately excluded.
    pub fn same_identity(&self, other: &ServiceConfig) -> bool {
        self.name == other.name
            && self.auth_token == other.auth_token
            && self.service_type == other.service_type
            && self.bind_addr == other.bind_addr
            && self.listen_port == other.listen_port
            && self.host_header_rewrite == other.host_header_rewrite
            && self.custom_domains == other.custom_domains
            && self.effective_locations() == other.effective_locations()
    }
}
