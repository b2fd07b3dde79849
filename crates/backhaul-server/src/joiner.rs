//! Stream joiner seam
//!
//! Once a public connection has been paired with a work connection, both
//! ends go to a `StreamJoiner`. The production joiner applies the payload
//! cipher/compressor the service config asks for; that machinery lives
//! outside this crate, behind this trait. The passthrough implementation
//! here moves bytes verbatim and is what the registry wires by default.

use crate::config::ServiceConfig;
use async_trait::async_trait;
use backhaul_connection::Connection;
use tracing::debug;

#[async_trait]
pub trait StreamJoiner: Send + Sync {
    /// Relay between `public` and `work` until both directions reach EOF.
    /// `record` asks the joiner to count traffic for the dashboard.
    async fn join(&self, public: Connection, work: Connection, cfg: &ServiceConfig, record: bool);
}

/// Byte-for-byte relay with half-close propagation.
pub struct PassthroughJoiner;

#[async_trait]
impl StreamJoiner for PassthroughJoiner {
    async fn join(&self, public: Connection, work: Connection, cfg: &ServiceConfig, _record: bool) {
        let (sent, received) = tokio::join!(pump(&public, &work), pump(&work, &public));
        debug!(
            service = %cfg.name,
            sent = sent,
            received = received,
            "relay finished"
        );
    }
}

/// Copy from `src` into `dst` until EOF or error, then propagate the EOF by
/// closing `dst`'s write side. The opposite direction keeps draining.
async fn pump(src: &Connection, dst: &Connection) -> u64 {
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if dst.write(&buf[..n]).await.is_err() {
                    break;
                }
                total += n as u64;
            }
        }
    }
    dst.close().await;
    total
}
