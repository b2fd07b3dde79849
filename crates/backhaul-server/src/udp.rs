//! UDP relay worker
//!
//! A udp service binds a datagram socket instead of accepting streams.
//! Datagrams are wrapped in the newline-delimited JSON envelope and pumped
//! over one work connection; replies come back as envelopes addressed to
//! the original client. When the work connection dies, the next datagram
//! pulls a fresh one through the normal pool path.

use crate::service::ProxyService;
use backhaul_connection::Connection;
use backhaul_proto::UdpEnvelope;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Largest datagram the relay will wrap.
const MAX_DATAGRAM: usize = 65536;

pub(crate) async fn run_relay(
    svc: Arc<ProxyService>,
    socket: UdpSocket,
    shutdown: CancellationToken,
) {
    let socket = Arc::new(socket);
    let local = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(service = %svc.name(), "udp relay has no local address: {}", e);
            return;
        }
    };
    debug!(service = %svc.name(), addr = %local, "udp relay listening");

    let mut work: Option<Arc<Connection>> = None;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(service = %svc.name(), "udp recv failed: {}", e);
                    break;
                }
            }
        };

        if let Some(conn) = &work {
            if conn.is_closed() {
                work = None;
            }
        }
        let conn = match &work {
            Some(conn) => conn.clone(),
            None => match svc.get_work_conn().await {
                Ok(conn) => {
                    let conn = Arc::new(conn);
                    tokio::spawn(reply_pump(
                        svc.clone(),
                        socket.clone(),
                        conn.clone(),
                        shutdown.clone(),
                    ));
                    work = Some(conn.clone());
                    conn
                }
                Err(e) => {
                    // same policy as a stream handoff miss: drop and move on
                    debug!(service = %svc.name(), "dropping datagram: {}", e);
                    continue;
                }
            },
        };

        let envelope = UdpEnvelope::wrap(&buf[..n], peer, local);
        match envelope.to_line() {
            Ok(line) => {
                if conn.write_line(&line).await.is_err() {
                    conn.close().await;
                    work = None;
                }
            }
            Err(e) => warn!(service = %svc.name(), "udp envelope encode failed: {}", e),
        }
    }
    trace!(service = %svc.name(), "udp relay ended");
}

/// Drain reply envelopes from one work connection back onto the socket.
async fn reply_pump(
    svc: Arc<ProxyService>,
    socket: Arc<UdpSocket>,
    work: Arc<Connection>,
    shutdown: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = work.read_line() => line,
        };
        match line {
            Ok(Some(line)) => match UdpEnvelope::from_line(&line) {
                Ok(envelope) => match (envelope.payload(), envelope.dst_addr()) {
                    (Ok(payload), Ok(dst)) => {
                        if let Err(e) = socket.send_to(&payload, dst).await {
                            warn!(service = %svc.name(), "udp send failed: {}", e);
                        }
                    }
                    _ => warn!(service = %svc.name(), "unroutable udp envelope"),
                },
                Err(e) => warn!(service = %svc.name(), "udp envelope decode failed: {}", e),
            },
            Ok(None) | Err(_) => break,
        }
    }
    work.close().await;
    trace!(service = %svc.name(), "udp reply pump ended");
}
