//! The service registry.
//!
//! Built once from configuration, in dependency order, and immutable
//! afterwards. It answers the upward queries (status, logs, exec) and
//! routes container lifecycle events to the owning service.

mod events;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::container::{
    ContainerRuntime, ExecOutput, InteractiveSession, LineStream, LogSince, LogTail, RuntimeEvent,
    normalize_name,
};
use crate::error::{ConfigError, Error, StatusError};
use crate::service::{
    Service, ServiceDescriptor, ServiceOptions, ServiceSummary, StatusReport, build_service,
};

pub use events::{EVENT_BACKOFF_INITIAL, EVENT_BACKOFF_MAX};

/// One row of [`ServiceRegistry::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl ServiceStatus {
    fn from_result(service: &str, result: Result<StatusReport, StatusError>) -> Self {
        match result {
            Ok(report) => Self {
                service: service.to_string(),
                status: report.text,
                detail: report.detail,
            },
            Err(e) => Self::error(service, &e),
        }
    }

    fn error(service: &str, err: &dyn std::fmt::Display) -> Self {
        Self {
            service: service.to_string(),
            status: format!("Error: {}", err),
            detail: None,
        }
    }
}

/// Owns every service.
pub struct ServiceRegistry {
    /// Dependency order.
    services: Vec<Arc<Service>>,
    by_name: HashMap<String, usize>,
    runtime: Arc<dyn ContainerRuntime>,
    status_timeout: Duration,
    cancel: CancellationToken,
}

impl ServiceRegistry {
    /// Build from loaded configuration.
    pub fn from_config(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        Self::build(
            config.services.clone(),
            runtime,
            &config.service_options(),
            config.settings.status_timeout,
            cancel,
        )
    }

    /// Build every service. A service can only see the peers it declared,
    /// and those are always built first.
    pub fn build(
        descriptors: Vec<ServiceDescriptor>,
        runtime: Arc<dyn ContainerRuntime>,
        options: &ServiceOptions,
        status_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let ordered = dependency_order(descriptors)?;

        let mut services: Vec<Arc<Service>> = Vec::with_capacity(ordered.len());
        let mut by_name = HashMap::new();
        for descriptor in ordered {
            let peers: BTreeMap<String, Arc<Service>> = descriptor
                .peers()
                .filter_map(|peer| {
                    by_name
                        .get(peer)
                        .map(|&i: &usize| (peer.to_string(), services[i].clone()))
                })
                .collect();
            let name = descriptor.name.clone();
            let service = build_service(descriptor, runtime.clone(), peers, options, &cancel)?;
            by_name.insert(name, services.len());
            services.push(Arc::new(service));
        }

        tracing::info!(services = services.len(), "Service registry built");
        Ok(Self {
            services,
            by_name,
            runtime,
            status_timeout,
            cancel,
        })
    }

    /// Services in dependency order.
    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter().map(|s| s.descriptor())
    }

    pub fn summaries(&self) -> Vec<ServiceSummary> {
        self.services().map(ServiceSummary::from).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.by_name.get(name).map(|&i| self.services[i].clone())
    }

    fn require(&self, name: &str) -> Result<Arc<Service>, Error> {
        self.get_service(name).ok_or_else(|| Error::ServiceNotFound {
            name: name.to_string(),
        })
    }

    /// Status of one service, bounded by the per-query timeout.
    pub async fn status_of(&self, name: &str) -> Result<StatusReport, Error> {
        let service = self.require(name)?;
        let timeout = self.status_timeout;
        match tokio::time::timeout(timeout, service.status()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StatusError::Timeout {
                service: name.to_string(),
                timeout,
            }
            .into()),
        }
    }

    /// Status of every service, queried concurrently.
    ///
    /// Always one row per service, in dependency order. A failure or a query
    /// that outlives the timeout renders as `Error: <message>`.
    pub async fn get_status(&self) -> Vec<ServiceStatus> {
        let timeout = self.status_timeout;
        let tasks: Vec<(String, JoinHandle<ServiceStatus>)> = self
            .services
            .iter()
            .map(|service| {
                let service = service.clone();
                let name = service.name().to_string();
                let task = tokio::spawn(async move {
                    let name = service.name();
                    match tokio::time::timeout(timeout, service.status()).await {
                        Ok(result) => ServiceStatus::from_result(name, result),
                        Err(_) => {
                            tracing::warn!(service = %name, "Status query timed out after {:?}", timeout);
                            let err = StatusError::Timeout {
                                service: name.to_string(),
                                timeout,
                            };
                            ServiceStatus::error(name, &err)
                        }
                    }
                });
                (name, task)
            })
            .collect();

        let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;
        names
            .iter()
            .zip(joined)
            .map(|(name, res)| match res {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!(service = %name, "Status task failed: {}", e);
                    ServiceStatus::error(name, &e)
                }
            })
            .collect()
    }

    /// One-shot log read.
    pub async fn logs(&self, name: &str, since: LogSince, tail: LogTail) -> Result<Vec<String>, Error> {
        let service = self.require(name)?;
        Ok(service.container().logs(since, tail).await?)
    }

    /// Follow a service's logs until `cancel` fires or the stream is dropped.
    pub fn follow_logs(&self, name: &str, cancel: CancellationToken) -> Result<LineStream, Error> {
        let service = self.require(name)?;
        Ok(service.container().follow_logs(cancel))
    }

    pub async fn exec(&self, name: &str, cmd: &[String]) -> Result<ExecOutput, Error> {
        let service = self.require(name)?;
        Ok(service.exec(cmd).await?)
    }

    pub async fn exec_interactive(&self, name: &str, cmd: &[String]) -> Result<InteractiveSession, Error> {
        let service = self.require(name)?;
        Ok(service.exec_interactive(cmd).await?)
    }

    /// Route one runtime event to its service. Events for containers we do
    /// not manage are ignored.
    pub async fn dispatch(&self, event: &RuntimeEvent) {
        let Some(service) = self.owner_of(event) else {
            tracing::trace!(container = %event.container_id, kind = ?event.kind, "Ignoring event for unmanaged container");
            return;
        };
        service.on_event(&event.kind).await;
    }

    fn owner_of(&self, event: &RuntimeEvent) -> Option<&Arc<Service>> {
        if let Some(name) = &event.container_name {
            let name = normalize_name(name);
            if let Some(service) = self.services.iter().find(|s| s.descriptor().container == name) {
                return Some(service);
            }
        }
        self.services.iter().find(|s| {
            s.container()
                .snapshot()
                .is_some_and(|snap| snap.id == event.container_id)
        })
    }

    /// Re-inspect every container, reconciling events that were missed.
    pub async fn refresh_all(&self) {
        let refreshes = self.services.iter().map(|service| async move {
            if let Err(e) = service.container().refresh().await {
                tracing::warn!(service = %service.name(), "Failed to refresh container: {}", e);
            }
        });
        futures::future::join_all(refreshes).await;
    }

    /// Start the event dispatch loop. It ends when the registry's token is
    /// cancelled.
    pub fn spawn_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(events::run(self.clone(), self.runtime.clone(), self.cancel.clone()))
    }

    /// Stop every background task.
    pub async fn close(&self) {
        for service in self.services.iter().rev() {
            service.close().await;
        }
        self.cancel.cancel();
        tracing::info!("Service registry closed");
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("status_timeout", &self.status_timeout)
            .finish()
    }
}

/// Order services so every one comes after the peers it declared.
///
/// Declaration order breaks ties. Duplicate names, unknown peers and cycles
/// are configuration errors.
pub fn dependency_order(
    descriptors: Vec<ServiceDescriptor>,
) -> Result<Vec<ServiceDescriptor>, ConfigError> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, d) in descriptors.iter().enumerate() {
        if index.insert(d.name.as_str(), i).is_some() {
            return Err(ConfigError::InvalidService {
                service: d.name.clone(),
                message: "declared more than once".to_string(),
            });
        }
    }

    let mut pending: Vec<usize> = vec![0; descriptors.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];
    for (i, d) in descriptors.iter().enumerate() {
        let peers: BTreeSet<&str> = d.peers().collect();
        for peer in peers {
            let &p = index.get(peer).ok_or_else(|| ConfigError::InvalidService {
                service: d.name.clone(),
                message: format!("depends on unknown service '{}'", peer),
            })?;
            pending[i] += 1;
            dependents[p].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..descriptors.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(descriptors.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &dependent in &dependents[i] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < descriptors.len() {
        let stuck: Vec<&str> = (0..descriptors.len())
            .filter(|&i| pending[i] > 0)
            .map(|i| descriptors[i].name.as_str())
            .collect();
        return Err(ConfigError::DependencyCycle(stuck.join(", ")));
    }

    let mut slots: Vec<Option<ServiceDescriptor>> = descriptors.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::container::{EventKind, LifecycleState};
    use crate::service::{ModeProbe, ServiceKind};
    use crate::testing::FakeRuntime;

    fn arby(name: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(name, format!("testnet_{}_1", name), ServiceKind::Arby)
    }

    fn registry(runtime: &Arc<FakeRuntime>, descriptors: Vec<ServiceDescriptor>) -> ServiceRegistry {
        ServiceRegistry::build(
            descriptors,
            runtime.clone(),
            &ServiceOptions::default(),
            Duration::from_secs(10),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_dependency_order_keeps_declaration_order() {
        let mut b = arby("b");
        b.depends_on = vec!["c".to_string()];
        let ordered = dependency_order(vec![arby("a"), b, arby("c")]).unwrap();
        let names: Vec<_> = ordered.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_dependency_errors() {
        let mut a = arby("a");
        a.depends_on = vec!["b".to_string()];
        let mut b = arby("b");
        b.depends_on = vec!["a".to_string()];
        assert!(matches!(
            dependency_order(vec![a.clone(), b]),
            Err(ConfigError::DependencyCycle(_))
        ));

        assert!(matches!(
            dependency_order(vec![a]),
            Err(ConfigError::InvalidService { .. })
        ));

        assert!(matches!(
            dependency_order(vec![arby("x"), arby("x")]),
            Err(ConfigError::InvalidService { .. })
        ));
    }

    #[test]
    fn test_mode_probe_peer_is_a_dependency() {
        let mut geth = ServiceDescriptor::new("geth", "testnet_geth_1", ServiceKind::Geth);
        geth.mode_probe = Some(ModeProbe {
            peer: "connext".to_string(),
            env: "CONNEXT_ETH_PROVIDER_URL".to_string(),
            native_host: "http://geth:8545".to_string(),
            light_endpoints: vec![],
        });
        let connext = ServiceDescriptor::new("connext", "testnet_connext_1", ServiceKind::Connext);
        let ordered = dependency_order(vec![geth, connext]).unwrap();
        assert_eq!(ordered[0].name, "connext");
    }

    #[tokio::test]
    async fn test_get_status_one_row_per_service() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_container("testnet_a_1", LifecycleState::Running, &[]);
        runtime.add_container("testnet_b_1", LifecycleState::Exited, &[]);
        runtime.add_container("testnet_c_1", LifecycleState::Running, &[]);
        runtime.fail_inspect("testnet_c_1", "daemon hiccup");
        let reg = registry(&runtime, vec![arby("a"), arby("b"), arby("c"), arby("d")]);

        let statuses = reg.get_status().await;
        let rows: Vec<(&str, &str)> = statuses
            .iter()
            .map(|s| (s.service.as_str(), s.status.as_str()))
            .collect();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], ("a", "Ready"));
        assert_eq!(rows[1], ("b", "Container exited"));
        assert!(rows[2].1.starts_with("Error: "));
        assert!(rows[2].1.contains("daemon hiccup"));
        assert_eq!(rows[3], ("d", "Container missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_service_does_not_block_others() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_container("testnet_a_1", LifecycleState::Running, &[]);
        runtime.add_container("testnet_b_1", LifecycleState::Running, &[]);
        runtime.hang_inspect("testnet_b_1");
        let reg = registry(&runtime, vec![arby("a"), arby("b")]);

        let statuses = reg.get_status().await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].status, "Ready");
        assert!(statuses[1].status.starts_with("Error: "));
        assert!(statuses[1].status.contains("timed out"));

        let err = reg.status_of("b").await.unwrap_err();
        assert!(matches!(err, Error::Status(StatusError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let runtime = Arc::new(FakeRuntime::new());
        let reg = registry(&runtime, vec![arby("a")]);
        assert!(matches!(
            reg.status_of("nope").await,
            Err(Error::ServiceNotFound { .. })
        ));
        assert!(reg.logs("nope", LogSince::Beginning, LogTail::All).await.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_name_then_id() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_container("testnet_a_1", LifecycleState::Running, &[]);
        let reg = registry(&runtime, vec![arby("a"), arby("b")]);
        let a = reg.get_service("a").unwrap();
        assert!(a.container().snapshot().is_none());

        reg.dispatch(&RuntimeEvent {
            kind: EventKind::Start,
            container_id: "ignored".to_string(),
            container_name: Some("/testnet_a_1".to_string()),
        })
        .await;
        let id = a.container().snapshot().unwrap().id;

        reg.dispatch(&RuntimeEvent {
            kind: EventKind::Destroy,
            container_id: id,
            container_name: None,
        })
        .await;
        assert!(a.container().snapshot().is_none());
    }

    #[tokio::test]
    async fn test_peers_limited_to_declared() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut b = arby("b");
        b.depends_on = vec!["a".to_string()];
        let reg = registry(&runtime, vec![arby("a"), b, arby("c")]);
        let b = reg.get_service("b").unwrap();
        assert!(b.peer("a").is_some());
        assert!(b.peer("c").is_none());
        let names: Vec<_> = reg.services().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
