//! Route table with wildcard fallback and per-route accept queues
//!
//! Routes are keyed by domain; each domain keeps its entries sorted by
//! location in descending lexicographic order so the longest (most
//! specific) prefix is tried first. Lookup is exact on the domain; when
//! nothing matches, the leftmost label is replaced with `*` and the lookup
//! retried exactly once, so `c.a.b.com` can fall back to `*.a.b.com`.

use crate::VhostError;
use backhaul_connection::Connection;
use bytes::BytesMut;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

/// Pending connections per route before dispatch tasks start dropping.
const ROUTE_BACKLOG: usize = 64;

/// A connection that passed routing, together with the bytes the
/// multiplexer consumed to route it.
pub(crate) struct MuxedConn {
    pub conn: Connection,
    pub head: BytesMut,
}

struct RouteEntry {
    name: String,
    location: String,
    tx: mpsc::Sender<MuxedConn>,
}

/// Shared domain → ordered-routes index.
///
/// Cheap to clone; lookups take a read guard on one shard only, writes
/// happen on route add/remove.
#[derive(Clone, Default)]
pub struct RouteTable {
    domains: Arc<DashMap<String, Vec<RouteEntry>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route and return the handle its owner accepts on.
    ///
    /// `location` is a path prefix; the empty string is the catch-all.
    /// `rewrite_host` is applied to the peeked request head at accept time
    /// (HTTP only; HTTPS heads are opaque TLS records).
    pub fn register(
        &self,
        name: &str,
        domain: &str,
        location: &str,
        rewrite_host: Option<String>,
    ) -> Result<RouteHandle, VhostError> {
        let domain = domain.to_ascii_lowercase();
        let location = location.to_ascii_lowercase();
        let (tx, rx) = mpsc::channel(ROUTE_BACKLOG);

        let mut entries = self.domains.entry(domain.clone()).or_default();
        if entries.iter().any(|e| e.location == location) {
            return Err(VhostError::RouteConflict {
                domain,
                location,
            });
        }

        let entry = RouteEntry {
            name: name.to_string(),
            location: location.clone(),
            tx,
        };
        // descending lexicographic: longest/most-specific prefix first
        let pos = entries
            .iter()
            .position(|e| e.location < location)
            .unwrap_or(entries.len());
        entries.insert(pos, entry);
        drop(entries);

        debug!(name = %name, domain = %domain, location = %location, "registered vhost route");

        Ok(RouteHandle {
            table: self.clone(),
            name: name.to_string(),
            domain,
            location,
            rewrite_host,
            rx: Mutex::new(rx),
        })
    }

    /// Find the route for `(host, path)` and return a sender for its queue.
    ///
    /// `host` may carry a port suffix; both host and path are matched
    /// case-insensitively. Returns `None` when neither the exact domain nor
    /// its single-level wildcard has a matching location.
    pub(crate) fn lookup(&self, host: &str, path: &str) -> Option<(String, mpsc::Sender<MuxedConn>)> {
        let domain = normalize_host(host);
        let path = path.to_ascii_lowercase();

        if let Some(found) = self.lookup_domain(&domain, &path) {
            return Some(found);
        }

        // single-level wildcard fallback, tried once
        if let Some(wildcard) = parent_wildcard(&domain) {
            trace!(host = %domain, wildcard = %wildcard, "trying wildcard fallback");
            return self.lookup_domain(&wildcard, &path);
        }

        None
    }

    fn lookup_domain(&self, domain: &str, path: &str) -> Option<(String, mpsc::Sender<MuxedConn>)> {
        let entries = self.domains.get(domain)?;
        entries
            .iter()
            .find(|e| path.starts_with(&e.location))
            .map(|e| (e.name.clone(), e.tx.clone()))
    }

    /// Remove a route. In-flight dispatch tasks that already cloned the
    /// sender may still deliver one connection; the closed queue rejects it
    /// and the connection is dropped (best-effort, as accepted).
    pub fn unregister(&self, domain: &str, location: &str) {
        let domain = domain.to_ascii_lowercase();
        let location = location.to_ascii_lowercase();

        let mut empty = false;
        if let Some(mut entries) = self.domains.get_mut(&domain) {
            entries.retain(|e| e.location != location);
            empty = entries.is_empty();
        }
        if empty {
            self.domains.remove_if(&domain, |_, v| v.is_empty());
        }
        debug!(domain = %domain, location = %location, "unregistered vhost route");
    }

    /// Number of registered routes across all domains.
    pub fn len(&self) -> usize {
        self.domains.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accept side of one registered route.
///
/// Behaves like a listener: `accept` yields the next public connection
/// routed here, with the peeked bytes already pushed back (rewritten when
/// the route carries a host-rewrite target), so callers read the request
/// from the first byte as if no multiplexer existed.
pub struct RouteHandle {
    table: RouteTable,
    name: String,
    domain: String,
    location: String,
    rewrite_host: Option<String>,
    rx: Mutex<mpsc::Receiver<MuxedConn>>,
}

impl RouteHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub async fn accept(&self) -> Result<Connection, VhostError> {
        let muxed = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(VhostError::RouteClosed)?;
        let MuxedConn { conn, head } = muxed;

        let head = match &self.rewrite_host {
            Some(target) => match crate::http::rewrite_host_header(&head, target) {
                Ok(rewritten) => rewritten,
                Err(e) => {
                    // routed fine but not rewritable: pass through untouched
                    warn!(route = %self.name, "host rewrite failed: {}", e);
                    head.to_vec()
                }
            },
            None => head.to_vec(),
        };

        conn.unread(&head).await;
        Ok(conn)
    }

    /// Deregister the route and close its queue. Connections already queued
    /// are dropped with the receiver.
    pub async fn close(&self) {
        self.table.unregister(&self.domain, &self.location);
        self.rx.lock().await.close();
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.split(':').next().unwrap_or(host);
    host.to_ascii_lowercase()
}

/// `api.example.com` → `*.example.com`; `None` when the host is too short
/// for a single-level wildcard to exist.
fn parent_wildcard(host: &str) -> Option<String> {
    let first_dot = host.find('.')?;
    let parent = &host[first_dot + 1..];
    if !parent.contains('.') {
        return None;
    }
    Some(format!("*.{}", parent))
}
