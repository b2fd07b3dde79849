//! Shared-listener dispatch loop
//!
//! One `VhostMux` owns one public listener and fans accepted connections
//! out to registered routes. Each raw connection gets its own handling
//! task: inspect within a bounded handshake window, look the route up,
//! hand the connection (and the bytes consumed to route it) to the route's
//! queue. Misses, malformed handshakes, and deadline overruns all end the
//! same way: the connection is closed and nobody upstream hears about it.

use crate::routes::{MuxedConn, RouteTable};
use crate::{http, sni};
use backhaul_connection::{Connection, SharedConnection};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxProtocol {
    Http,
    Https,
}

/// Virtual-host multiplexer over one shared listener.
pub struct VhostMux {
    table: RouteTable,
    protocol: MuxProtocol,
    handshake_timeout: Duration,
}

impl VhostMux {
    /// Multiplexer that routes by Host header and path.
    pub fn http(table: RouteTable, handshake_timeout: Duration) -> Self {
        Self {
            table,
            protocol: MuxProtocol::Http,
            handshake_timeout,
        }
    }

    /// Multiplexer that routes by TLS SNI, without terminating TLS.
    pub fn https(table: RouteTable, handshake_timeout: Duration) -> Self {
        Self {
            table,
            protocol: MuxProtocol::Https,
            handshake_timeout,
        }
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Run the dispatch loop until `shutdown` fires.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        debug!(
            addr = ?listener.local_addr().ok(),
            protocol = ?self.protocol,
            "vhost multiplexer listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("vhost multiplexer shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            trace!(peer = %peer, "mux accepted connection");
                            let table = self.table.clone();
                            let protocol = self.protocol;
                            let deadline = self.handshake_timeout;
                            tokio::spawn(async move {
                                handle_connection(table, protocol, deadline, stream).await;
                            });
                        }
                        Err(e) => {
                            warn!("vhost accept failed: {}", e);
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    table: RouteTable,
    protocol: MuxProtocol,
    deadline: Duration,
    stream: tokio::net::TcpStream,
) {
    let conn = Connection::from_stream(stream);
    let mut shared = SharedConnection::new(conn);

    // the whole routing handshake must fit in the deadline
    let inspected = timeout(deadline, async {
        match protocol {
            MuxProtocol::Http => {
                let head = http::peek_http_request(&mut shared).await?;
                Ok((head.host, head.path))
            }
            MuxProtocol::Https => {
                let sni = sni::peek_tls_sni(&mut shared).await?;
                Ok::<_, crate::VhostError>((sni, String::new()))
            }
        }
    })
    .await;

    let (host, path) = match inspected {
        Ok(Ok(parsed)) => parsed,
        Ok(Err(e)) => {
            trace!("unroutable connection: {}", e);
            let (conn, _) = shared.into_parts();
            conn.close().await;
            return;
        }
        Err(_) => {
            trace!("routing handshake deadline exceeded");
            let (conn, _) = shared.into_parts();
            conn.close().await;
            return;
        }
    };

    match table.lookup(&host, &path) {
        None => {
            debug!(host = %host, path = %path, "no vhost route");
            let (conn, _) = shared.into_parts();
            conn.close().await;
        }
        Some((name, tx)) => {
            trace!(host = %host, path = %path, route = %name, "dispatching");
            let (conn, head) = shared.into_parts();
            if let Err(rejected) = tx.send(MuxedConn { conn, head }).await {
                // route closed between lookup and delivery
                rejected.0.conn.close().await;
            }
        }
    }
}
