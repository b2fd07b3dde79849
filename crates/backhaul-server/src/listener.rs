//! Listener abstraction for tunnel sessions
//!
//! A session manager accepts public connections from either a bound TCP
//! port or a route inside the shared virtual-host multiplexer. Both look
//! the same through `ServiceListener`, so the session code has exactly one
//! accept loop.

use crate::ServiceError;
use async_trait::async_trait;
use backhaul_connection::Connection;
use backhaul_vhost::{RouteHandle, VhostError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[async_trait]
pub trait ServiceListener: Send + Sync {
    /// Block for the next public connection. `ServiceError::ListenerClosed`
    /// means the listener is gone and the accept loop should end.
    async fn accept(&self) -> Result<Connection, ServiceError>;

    /// Stop accepting. Idempotent.
    async fn close(&self);
}

/// Dedicated bound TCP port for one raw service.
#[derive(Debug)]
pub struct TcpPortListener {
    inner: TcpListener,
    closed: CancellationToken,
}

impl TcpPortListener {
    pub async fn bind(addr: &str, port: u16) -> Result<Self, ServiceError> {
        let inner = TcpListener::bind((addr, port))
            .await
            .map_err(|e| ServiceError::BindError {
                addr: format!("{}:{}", addr, port),
                reason: e.to_string(),
            })?;
        debug!(addr = ?inner.local_addr().ok(), "tcp listener bound");
        Ok(Self {
            inner,
            closed: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.local_addr().ok()
    }
}

#[async_trait]
impl ServiceListener for TcpPortListener {
    async fn accept(&self) -> Result<Connection, ServiceError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(ServiceError::ListenerClosed),
            accepted = self.inner.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!(peer = %peer, "accepted public connection");
                    Ok(Connection::from_stream(stream))
                }
                Err(e) => {
                    trace!("accept failed: {}", e);
                    Err(ServiceError::ListenerClosed)
                }
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// One (domain, location) route inside the shared multiplexer, worn as a
/// listener.
pub struct RouteListener {
    handle: RouteHandle,
}

impl RouteListener {
    pub fn new(handle: RouteHandle) -> Self {
        Self { handle }
    }

    pub fn domain(&self) -> &str {
        self.handle.domain()
    }
}

#[async_trait]
impl ServiceListener for RouteListener {
    async fn accept(&self) -> Result<Connection, ServiceError> {
        match self.handle.accept().await {
            Ok(conn) => Ok(conn),
            Err(VhostError::RouteClosed) => Err(ServiceError::ListenerClosed),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) {
        self.handle.close().await;
    }
}
