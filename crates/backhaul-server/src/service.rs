//! Per-service tunnel session manager
//!
//! One `ProxyService` owns a tunneled service's listeners, its reference to
//! the agent's control connection, and its pool of ready work connections.
//! Accepted public connections are paired with pooled work connections and
//! handed to the stream joiner; when the pool runs low, "need more" signals
//! flow back to the agent as `NewWorkConn` control messages.

use crate::config::ServiceConfig;
use crate::joiner::StreamJoiner;
use crate::listener::{RouteListener, ServiceListener, TcpPortListener};
use crate::registry::{ServiceRegistry, VhostTables};
use crate::ServiceError;
use backhaul_connection::Connection;
use backhaul_proto::{ControlMessage, ServiceType};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Queue slack on top of the configured pool size, so a burst of agent
/// deliveries right after a drain does not get dropped.
const POOL_SLACK: usize = 10;

/// Cadence of the pool-replenishment task.
const REFILL_INTERVAL: Duration = Duration::from_secs(2);

/// Default bound on how long a handoff waits for a work connection.
pub const DEFAULT_WORK_CONN_TIMEOUT: Duration = Duration::from_secs(10);

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Registered, not accepting
    Idle,
    /// Listeners live
    Working,
    /// Terminal
    Closed,
}

impl ServiceStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServiceStatus::Idle,
            1 => ServiceStatus::Working,
            _ => ServiceStatus::Closed,
        }
    }
}

/// Pool and signal queues, reallocated on every `init`.
#[derive(Clone)]
struct Channels {
    work_tx: mpsc::Sender<Connection>,
    work_rx: Arc<Mutex<mpsc::Receiver<Connection>>>,
    need_tx: mpsc::Sender<()>,
    need_rx: Arc<Mutex<mpsc::Receiver<()>>>,
}

struct Inner {
    channels: Option<Channels>,
    listeners: Vec<Arc<dyn ServiceListener>>,
    control: Option<Arc<Connection>>,
    shutdown: CancellationToken,
}

pub struct ProxyService {
    cfg: ServiceConfig,
    joiner: Arc<dyn StreamJoiner>,
    work_conn_timeout: Duration,
    registered_at: DateTime<Utc>,
    status: AtomicU8,
    inner: Mutex<Inner>,
    /// Back-reference so a privilege-created service can drop itself from
    /// the table when closed
    registry: std::sync::Mutex<Weak<ServiceRegistry>>,
}

impl std::fmt::Debug for ProxyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyService")
            .field("name", &self.cfg.name)
            .field("type", &self.cfg.service_type)
            .field("status", &self.status())
            .finish()
    }
}

impl ProxyService {
    pub fn new(cfg: ServiceConfig, joiner: Arc<dyn StreamJoiner>) -> Self {
        Self {
            cfg,
            joiner,
            work_conn_timeout: DEFAULT_WORK_CONN_TIMEOUT,
            registered_at: Utc::now(),
            status: AtomicU8::new(ServiceStatus::Idle as u8),
            inner: Mutex::new(Inner {
                channels: None,
                listeners: Vec::new(),
                control: None,
                shutdown: CancellationToken::new(),
            }),
            registry: std::sync::Mutex::new(Weak::new()),
        }
    }

    pub fn with_work_conn_timeout(mut self, timeout: Duration) -> Self {
        self.work_conn_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.cfg
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn attach_registry(&self, registry: &Arc<ServiceRegistry>) {
        if let Ok(mut slot) = self.registry.lock() {
            *slot = Arc::downgrade(registry);
        }
    }

    /// (Re)allocate the pool and signal queues and reset to Idle.
    ///
    /// Called by `start` and by reload before a service is handed back to a
    /// re-registering agent; any tasks from a previous life are cancelled.
    pub async fn init(&self) {
        let capacity = self.cfg.pool_count + POOL_SLACK;
        let (work_tx, work_rx) = mpsc::channel(capacity);
        let (need_tx, need_rx) = mpsc::channel(capacity);

        let mut inner = self.inner.lock().await;
        inner.shutdown.cancel();
        inner.shutdown = CancellationToken::new();
        inner.channels = Some(Channels {
            work_tx,
            work_rx: Arc::new(Mutex::new(work_rx)),
            need_tx,
            need_rx: Arc::new(Mutex::new(need_rx)),
        });
        inner.listeners.clear();
        inner.control = None;
        self.status
            .store(ServiceStatus::Idle as u8, Ordering::SeqCst);
        trace!(service = %self.cfg.name, capacity, "service initialized");
    }

    /// Bind the control connection, create listeners, and go Working.
    pub async fn start(
        self: &Arc<Self>,
        control: Arc<Connection>,
        tables: &VhostTables,
    ) -> Result<(), ServiceError> {
        self.init().await;

        let mut inner = self.inner.lock().await;
        inner.control = Some(control.clone());
        let shutdown = inner.shutdown.clone();
        let channels = match inner.channels.clone() {
            Some(c) => c,
            None => return Err(ServiceError::NotStarted(self.cfg.name.clone())),
        };

        if let Err(e) = self.create_listeners(&mut inner, tables, &shutdown).await {
            for listener in inner.listeners.drain(..) {
                listener.close().await;
            }
            inner.control = None;
            return Err(e);
        }

        for listener in &inner.listeners {
            tokio::spawn(accept_loop(
                self.clone(),
                listener.clone(),
                shutdown.clone(),
            ));
        }
        if self.cfg.pool_count > 0 {
            tokio::spawn(pool_manager(self.clone(), channels.clone(), shutdown.clone()));
        }
        tokio::spawn(need_drain(self.clone(), control, channels, shutdown));
        drop(inner);

        self.status
            .store(ServiceStatus::Working as u8, Ordering::SeqCst);
        info!(
            service = %self.cfg.name,
            kind = %self.cfg.service_type,
            pool = self.cfg.pool_count,
            "service started"
        );
        Ok(())
    }

    async fn create_listeners(
        self: &Arc<Self>,
        inner: &mut Inner,
        tables: &VhostTables,
        shutdown: &CancellationToken,
    ) -> Result<(), ServiceError> {
        match self.cfg.service_type {
            ServiceType::Tcp => {
                let listener =
                    TcpPortListener::bind(&self.cfg.bind_addr, self.cfg.listen_port).await?;
                inner.listeners.push(Arc::new(listener));
            }
            ServiceType::Udp => {
                let socket = UdpSocket::bind((self.cfg.bind_addr.as_str(), self.cfg.listen_port))
                    .await
                    .map_err(|e| ServiceError::BindError {
                        addr: format!("{}:{}", self.cfg.bind_addr, self.cfg.listen_port),
                        reason: e.to_string(),
                    })?;
                tokio::spawn(crate::udp::run_relay(
                    self.clone(),
                    socket,
                    shutdown.clone(),
                ));
            }
            ServiceType::Http => {
                for domain in self.cfg.vhost_domains(&tables.subdomain_host) {
                    for location in self.cfg.effective_locations() {
                        let handle = tables.http.register(
                            &self.cfg.name,
                            &domain,
                            &location,
                            self.cfg.host_header_rewrite.clone(),
                        )?;
                        inner.listeners.push(Arc::new(RouteListener::new(handle)));
                    }
                }
            }
            ServiceType::Https => {
                for domain in self.cfg.vhost_domains(&tables.subdomain_host) {
                    let handle = tables.https.register(&self.cfg.name, &domain, "", None)?;
                    inner.listeners.push(Arc::new(RouteListener::new(handle)));
                }
            }
        }
        Ok(())
    }

    /// Pull a ready work connection, requesting one from the agent when the
    /// pool is empty. Pooled connections are liveness-probed; dead ones are
    /// discarded and the wait retried under the same overall deadline. On
    /// timeout the caller drops its pending public connection.
    pub async fn get_work_conn(&self) -> Result<Connection, ServiceError> {
        if self.status() == ServiceStatus::Closed {
            return Err(ServiceError::Closed(self.cfg.name.clone()));
        }
        let (channels, token) = {
            let inner = self.inner.lock().await;
            match &inner.channels {
                Some(c) => (c.clone(), inner.shutdown.clone()),
                None => return Err(ServiceError::NotStarted(self.cfg.name.clone())),
            }
        };
        let deadline = Instant::now() + self.work_conn_timeout;

        loop {
            let immediate = channels.work_rx.lock().await.try_recv();
            let conn = match immediate {
                Ok(conn) => conn,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(ServiceError::Closed(self.cfg.name.clone()));
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    // tell the agent we need one, then wait for delivery
                    let _ = channels.need_tx.try_send(());
                    let remaining = deadline
                        .checked_duration_since(Instant::now())
                        .filter(|d| !d.is_zero())
                        .ok_or_else(|| ServiceError::WorkConnTimeout {
                            name: self.cfg.name.clone(),
                            timeout: self.work_conn_timeout,
                        })?;
                    let mut rx = channels.work_rx.lock().await;
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(ServiceError::Closed(self.cfg.name.clone()));
                        }
                        received = timeout(remaining, rx.recv()) => match received {
                            Err(_) => {
                                return Err(ServiceError::WorkConnTimeout {
                                    name: self.cfg.name.clone(),
                                    timeout: self.work_conn_timeout,
                                });
                            }
                            Ok(None) => {
                                return Err(ServiceError::Closed(self.cfg.name.clone()));
                            }
                            Ok(Some(conn)) => conn,
                        },
                    }
                }
            };

            // Only pooled connections can have idled long enough to die
            // unnoticed; a freshly dialed one is probed by its first use.
            if self.cfg.pool_count > 0 && conn.check_closed().await {
                debug!(service = %self.cfg.name, "discarding dead pooled work connection");
                conn.close().await;
                continue;
            }
            return Ok(conn);
        }
    }

    /// Accept a work connection delivered by the agent. Never blocks: when
    /// the pool is full the connection is surplus capacity, closed and
    /// forgotten.
    pub async fn register_work_conn(&self, conn: Connection) {
        let tx = {
            let inner = self.inner.lock().await;
            inner.channels.as_ref().map(|c| c.work_tx.clone())
        };
        let Some(tx) = tx else {
            conn.close().await;
            return;
        };
        match tx.try_send(conn) {
            Ok(()) => trace!(service = %self.cfg.name, "work connection pooled"),
            Err(mpsc::error::TrySendError::Full(conn)) => {
                debug!(service = %self.cfg.name, "pool full, dropping surplus work connection");
                conn.close().await;
            }
            Err(mpsc::error::TrySendError::Closed(conn)) => {
                conn.close().await;
            }
        }
    }

    /// Tear the service down. Idempotent; late calls and late queue pushes
    /// are no-ops. Privilege-created services also leave the table.
    pub async fn close(&self) {
        let prev = self
            .status
            .swap(ServiceStatus::Closed as u8, Ordering::SeqCst);
        if prev == ServiceStatus::Closed as u8 {
            return;
        }

        let (listeners, control, shutdown) = {
            let mut inner = self.inner.lock().await;
            inner.channels = None;
            (
                std::mem::take(&mut inner.listeners),
                inner.control.take(),
                inner.shutdown.clone(),
            )
        };

        shutdown.cancel();
        for listener in &listeners {
            listener.close().await;
        }
        if let Some(control) = control {
            control.close().await;
        }
        info!(service = %self.cfg.name, "service closed");

        if self.cfg.privileged {
            let registry = self
                .registry
                .lock()
                .ok()
                .and_then(|slot| slot.upgrade());
            if let Some(registry) = registry {
                registry.remove(&self.cfg.name).await;
            }
        }
    }

    /// Identity comparison for reload decisions; runtime state (status,
    /// pool, listeners) never participates.
    pub fn compare(&self, other: &ProxyService) -> bool {
        self.cfg.same_identity(&other.cfg)
    }

    /// Whether this service is bound to the given control connection.
    pub async fn uses_control(&self, control: &Arc<Connection>) -> bool {
        let inner = self.inner.lock().await;
        inner
            .control
            .as_ref()
            .map(|c| Arc::ptr_eq(c, control))
            .unwrap_or(false)
    }
}

async fn accept_loop(
    svc: Arc<ProxyService>,
    listener: Arc<dyn ServiceListener>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    if svc.status() != ServiceStatus::Working {
                        conn.close().await;
                        continue;
                    }
                    let svc = svc.clone();
                    tokio::spawn(async move { svc.handoff(conn).await });
                }
                // accept failure means the listener is gone
                Err(_) => break,
            }
        }
    }
    trace!(service = %svc.name(), "accept loop ended");
}

impl ProxyService {
    async fn handoff(self: Arc<Self>, public: Connection) {
        match self.get_work_conn().await {
            Ok(work) => {
                trace!(service = %self.cfg.name, peer = ?public.peer_addr(), "pairing public connection");
                self.joiner.join(public, work, &self.cfg, true).await;
            }
            Err(e) => {
                warn!(service = %self.cfg.name, "dropping public connection: {}", e);
                public.close().await;
            }
        }
    }
}

async fn pool_manager(svc: Arc<ProxyService>, channels: Channels, shutdown: CancellationToken) {
    let target = svc.cfg.pool_count;
    let mut tick = tokio::time::interval(REFILL_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                let in_pool = channels.work_tx.max_capacity() - channels.work_tx.capacity();
                if in_pool >= target {
                    continue;
                }
                let want = refill_step(in_pool, target).min(target - in_pool);
                let mut sent = 0;
                for _ in 0..want {
                    if channels.need_tx.try_send(()).is_err() {
                        break;
                    }
                    sent += 1;
                }
                if sent > 0 {
                    trace!(service = %svc.name(), in_pool, requested = sent, "pool refill");
                }
            }
        }
    }
    trace!(service = %svc.name(), "pool manager ended");
}

/// Graduated refill: aggressive when near-empty, gentle when near-full, so
/// recovery is quick without a thundering herd of connection requests.
fn refill_step(in_pool: usize, target: usize) -> usize {
    let pct = in_pool * 100 / target;
    if pct < 20 {
        target * 4 / 5 + 1
    } else if pct < 50 {
        target / 4 + 1
    } else if pct < 80 {
        target / 5 + 1
    } else {
        target / 10 + 1
    }
}

/// Turn queued "need more" signals into `NewWorkConn` messages on the
/// control connection.
async fn need_drain(
    svc: Arc<ProxyService>,
    control: Arc<Connection>,
    channels: Channels,
    shutdown: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = shutdown.cancelled() => break,
            signal = async { channels.need_rx.lock().await.recv().await } => signal,
        };
        match signal {
            None => break,
            Some(()) => {
                let msg = ControlMessage::NewWorkConn {
                    proxy_name: svc.name().to_string(),
                    auth_key: None,
                };
                let line = match msg.to_line() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(service = %svc.name(), "encoding NewWorkConn failed: {}", e);
                        continue;
                    }
                };
                if let Err(e) = control.write_line(&line).await {
                    warn!(service = %svc.name(), "control connection write failed: {}", e);
                    break;
                }
                trace!(service = %svc.name(), "requested work connection from agent");
            }
        }
    }
}
