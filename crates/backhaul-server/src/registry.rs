//! Service registry
//!
//! The one table of every registered service, owned explicitly and passed
//! by reference to whatever needs it (control handler, reload, dashboard
//! readers); no ambient global. The lock is held for lookup, insert, and
//! delete only, never across I/O or a service's own lifecycle calls.

use crate::config::ServiceConfig;
use crate::joiner::StreamJoiner;
use crate::service::{ProxyService, ServiceStatus, DEFAULT_WORK_CONN_TIMEOUT};
use crate::ServiceError;
use backhaul_connection::Connection;
use backhaul_proto::ServiceAnnouncement;
use backhaul_vhost::RouteTable;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// The shared vhost route tables services register into, plus the base
/// domain that subdomain registrations compose onto.
pub struct VhostTables {
    pub http: RouteTable,
    pub https: RouteTable,
    pub subdomain_host: String,
}

pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<ProxyService>>>,
    tables: VhostTables,
    joiner: Arc<dyn StreamJoiner>,
    work_conn_timeout: Duration,
}

impl ServiceRegistry {
    pub fn new(subdomain_host: impl Into<String>, joiner: Arc<dyn StreamJoiner>) -> Arc<Self> {
        Self::with_work_conn_timeout(subdomain_host, joiner, DEFAULT_WORK_CONN_TIMEOUT)
    }

    pub fn with_work_conn_timeout(
        subdomain_host: impl Into<String>,
        joiner: Arc<dyn StreamJoiner>,
        work_conn_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            services: RwLock::new(HashMap::new()),
            tables: VhostTables {
                http: RouteTable::new(),
                https: RouteTable::new(),
                subdomain_host: subdomain_host.into(),
            },
            joiner,
            work_conn_timeout,
        })
    }

    /// Route table backing the shared HTTP listener.
    pub fn http_table(&self) -> RouteTable {
        self.tables.http.clone()
    }

    /// Route table backing the shared HTTPS listener.
    pub fn https_table(&self) -> RouteTable {
        self.tables.https.clone()
    }

    /// Register a service from validated configuration. The service starts
    /// Idle; it goes Working when its agent shows up and `start_service`
    /// runs. A name already registered and not Closed is a conflict.
    pub async fn insert(
        self: &Arc<Self>,
        cfg: ServiceConfig,
    ) -> Result<Arc<ProxyService>, ServiceError> {
        cfg.validate()?;
        let name = cfg.name.clone();
        let svc = Arc::new(
            ProxyService::new(cfg, self.joiner.clone())
                .with_work_conn_timeout(self.work_conn_timeout),
        );
        svc.attach_registry(self);

        let mut services = self.services.write().await;
        if let Some(existing) = services.get(&name) {
            if existing.status() != ServiceStatus::Closed {
                return Err(ServiceError::NameConflict(name));
            }
        }
        services.insert(name.clone(), svc.clone());
        drop(services);

        debug!(service = %name, "service registered");
        Ok(svc)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ProxyService>> {
        self.services.read().await.get(name).cloned()
    }

    /// Drop the table entry. Does not touch the service's own lifecycle;
    /// callers that want teardown close the service first.
    pub async fn remove(&self, name: &str) -> Option<Arc<ProxyService>> {
        let removed = self.services.write().await.remove(name);
        if removed.is_some() {
            debug!(service = %name, "service removed from table");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.services.read().await.len()
    }

    pub async fn service_names(&self) -> Vec<String> {
        self.services.read().await.keys().cloned().collect()
    }

    /// Bring a registered service up on the given control connection.
    pub async fn start_service(
        &self,
        name: &str,
        control: Arc<Connection>,
    ) -> Result<Arc<ProxyService>, ServiceError> {
        let svc = self
            .get(name)
            .await
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        if svc.status() == ServiceStatus::Working {
            return Err(ServiceError::NameConflict(name.to_string()));
        }
        svc.start(control, &self.tables).await?;
        Ok(svc)
    }

    /// Create and start a service from a privilege-mode registration. The
    /// announcement's credentials are verified by the caller before this
    /// runs; a name held by a live service is a conflict.
    pub async fn register_privileged(
        self: &Arc<Self>,
        ann: &ServiceAnnouncement,
        auth_token: &str,
        control: Arc<Connection>,
    ) -> Result<Arc<ProxyService>, ServiceError> {
        let cfg = ServiceConfig::from_announcement(ann, auth_token);
        let name = cfg.name.clone();
        let svc = self.insert(cfg).await?;
        match svc.start(control, &self.tables).await {
            Ok(()) => {
                info!(service = %name, "privileged service online");
                Ok(svc)
            }
            Err(e) => {
                // a failed start must not squat on the name
                svc.close().await;
                self.remove(&name).await;
                Err(e)
            }
        }
    }

    /// Hand an inbound work connection to the service its greeting names.
    pub async fn deliver_work_conn(
        &self,
        proxy_name: &str,
        conn: Connection,
    ) -> Result<(), ServiceError> {
        match self.get(proxy_name).await {
            Some(svc) => {
                svc.register_work_conn(conn).await;
                Ok(())
            }
            None => {
                conn.close().await;
                Err(ServiceError::NotFound(proxy_name.to_string()))
            }
        }
    }

    /// Tear down everything bound to a control connection that went away.
    /// Privilege-created services remove themselves from the table as part
    /// of closing; static services stay registered for the reconnect.
    pub async fn close_control(&self, control: &Arc<Connection>) {
        let snapshot: Vec<Arc<ProxyService>> =
            self.services.read().await.values().cloned().collect();
        for svc in snapshot {
            if svc.uses_control(control).await {
                info!(service = %svc.name(), "control connection lost, closing service");
                svc.close().await;
            }
        }
    }

    /// Apply a new configuration set. Services whose identity is unchanged
    /// keep running untouched; changed ones are torn down and re-registered
    /// Idle; services absent from the new set are closed and dropped.
    /// Privilege-created services are never part of static configuration
    /// and pass through reloads unharmed.
    pub async fn reload(self: &Arc<Self>, new_cfgs: Vec<ServiceConfig>) {
        let snapshot: HashMap<String, Arc<ProxyService>> = self.services.read().await.clone();

        let mut kept = HashSet::new();
        for cfg in new_cfgs {
            if let Err(e) = cfg.validate() {
                warn!("skipping invalid service config: {}", e);
                continue;
            }
            kept.insert(cfg.name.clone());

            match snapshot.get(&cfg.name) {
                Some(existing) if existing.config().same_identity(&cfg) => {
                    debug!(service = %cfg.name, "unchanged across reload");
                }
                Some(existing) => {
                    info!(service = %cfg.name, "identity changed, recreating");
                    existing.close().await;
                    self.remove(&cfg.name).await;
                    if let Err(e) = self.insert(cfg).await {
                        warn!("re-registration failed: {}", e);
                    }
                }
                None => {
                    if let Err(e) = self.insert(cfg).await {
                        warn!("registration failed: {}", e);
                    }
                }
            }
        }

        for (name, svc) in snapshot {
            if !kept.contains(&name) && !svc.config().privileged {
                info!(service = %name, "dropped by reload");
                svc.close().await;
                self.remove(&name).await;
            }
        }
    }

    /// Close every service. Used on gateway shutdown.
    pub async fn close_all(&self) {
        let snapshot: Vec<Arc<ProxyService>> =
            self.services.read().await.values().cloned().collect();
        for svc in snapshot {
            svc.close().await;
        }
        self.services.write().await.clear();
    }
}
