//! Service wrappers.
//!
//! A [`Service`] composes one container, an optional backend health probe,
//! an optional log watcher, and read access to the peers it declared. Its
//! status is derived in a fixed order:
//!
//! 1. Resolve the mode (native, external, light), via a peer if configured.
//! 2. Not running: the container state decides ("Container missing",
//!    "Disabled", "Container exited", ...). No RPC call is made.
//! 3. Running: the probe runs under the call timeout.
//! 4. Probe errors go through the transient-error table; an unreachable
//!    backend shows log-derived progress or "Waiting for <name> to come
//!    up..."; anything else propagates.

pub mod descriptor;
pub mod factory;
pub mod mode;
pub mod probes;
pub mod status;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::container::{
    ContainerHandle, EventKind, ExecOutput, InteractiveSession, LineStream, LogSince, LogTail,
};
use crate::error::{ContainerError, RpcError, StatusError};
use crate::watcher::{LogWatcher, SyncProgress};

pub use descriptor::{Mode, ModeProbe, RpcSettings, ServiceDescriptor, ServiceKind, ServiceSummary};
pub use factory::{ServiceOptions, build_service};
pub use mode::classify_mode;
pub use status::StatusReport;

/// What a probe may consult besides its own client.
#[derive(Debug, Clone, Copy)]
pub struct ProbeContext<'a> {
    pub service: &'a str,
    pub call_timeout: Duration,
    /// Log-derived progress, for services with a watcher.
    pub progress: Option<SyncProgress>,
}

/// Anything that can report a status.
#[async_trait]
pub trait StatusProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn status(&self) -> Result<StatusReport, StatusError>;
}

/// Log access for a service.
#[async_trait]
pub trait LogProvider: Send + Sync {
    async fn logs(&self, since: LogSince, tail: LogTail) -> Result<Vec<String>, ContainerError>;

    fn follow_logs(&self, cancel: CancellationToken) -> LineStream;
}

/// Backend-specific health check, called only while the container runs.
#[async_trait]
pub trait RpcHealthProbe: Send + Sync {
    async fn probe(&self, ctx: &ProbeContext<'_>) -> Result<StatusReport, RpcError>;

    /// The container died or was destroyed.
    async fn on_container_stopped(&self) {}

    async fn close(&self) {}
}

/// One backend service.
pub struct Service {
    descriptor: ServiceDescriptor,
    container: ContainerHandle,
    probe: Option<Box<dyn RpcHealthProbe>>,
    watcher: Option<LogWatcher>,
    /// Only the services this one declared.
    peers: BTreeMap<String, Arc<Service>>,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl Service {
    pub fn new(
        descriptor: ServiceDescriptor,
        container: ContainerHandle,
        probe: Option<Box<dyn RpcHealthProbe>>,
        watcher: Option<LogWatcher>,
        peers: BTreeMap<String, Arc<Service>>,
        call_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            descriptor,
            container,
            probe,
            watcher,
            peers,
            call_timeout,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn container(&self) -> &ContainerHandle {
        &self.container
    }

    pub fn progress(&self) -> Option<SyncProgress> {
        self.watcher.as_ref().map(LogWatcher::progress)
    }

    /// A declared peer.
    pub fn peer(&self, name: &str) -> Option<&Arc<Service>> {
        self.peers.get(name)
    }

    /// Effective mode. A mode probe overrides the configured mode.
    pub async fn mode(&self) -> Result<Mode, StatusError> {
        let Some(probe) = &self.descriptor.mode_probe else {
            return Ok(self.descriptor.mode);
        };
        let dependency = |reason: String| StatusError::Dependency {
            service: self.descriptor.name.clone(),
            peer: probe.peer.clone(),
            reason,
        };

        let peer = self
            .peers
            .get(&probe.peer)
            .ok_or_else(|| dependency("not a declared dependency".to_string()))?;
        let value = peer
            .container
            .getenv(&probe.env)
            .await
            .map_err(|e| dependency(e.to_string()))?
            .ok_or_else(|| dependency(format!("{} is not set", probe.env)))?;

        Ok(classify_mode(&value, &probe.native_host, &probe.light_endpoints))
    }

    /// Derive the current status.
    pub async fn status(&self) -> Result<StatusReport, StatusError> {
        let mode = self.mode().await?;
        match mode {
            Mode::External => return Ok(StatusReport::new(status::READY_EXTERNAL)),
            Mode::Light => return Ok(StatusReport::new(status::READY_LIGHT)),
            Mode::Native => {}
        }

        let state = self.container.status().await?;
        if !state.is_running() {
            return Ok(StatusReport::new(status::container_state_text(
                state,
                self.descriptor.disabled,
                mode == Mode::Native,
            )));
        }

        let Some(probe) = &self.probe else {
            return Ok(StatusReport::ready());
        };

        let ctx = ProbeContext {
            service: &self.descriptor.name,
            call_timeout: self.call_timeout,
            progress: self.progress(),
        };
        match probe.probe(&ctx).await {
            Ok(report) => Ok(report),
            Err(e) => self.on_probe_error(e),
        }
    }

    fn on_probe_error(&self, err: RpcError) -> Result<StatusReport, StatusError> {
        let message = err.to_string();
        if let Some(condition) = status::classify(&message) {
            return Ok(StatusReport::new(condition.text()));
        }
        if err.is_unreachable() {
            tracing::debug!(service = %self.descriptor.name, "Backend not reachable yet: {}", message);
            return Ok(match self.progress() {
                Some(p) if p.has_progress() => StatusReport::new(p.syncing_text()),
                _ => StatusReport::new(status::waiting_for(&self.descriptor.name)),
            });
        }
        Err(StatusError::Rpc(err))
    }

    /// React to a container lifecycle event.
    pub async fn on_event(&self, kind: &EventKind) {
        let name = &self.descriptor.name;
        match kind {
            EventKind::Create | EventKind::Start => {
                tracing::debug!(service = %name, ?kind, "Container event");
                if let Err(e) = self.container.refresh().await {
                    tracing::error!(service = %name, "Failed to inspect container after {:?}: {}", kind, e);
                }
            }
            EventKind::Die => {
                tracing::debug!(service = %name, "Container died");
                if let Err(e) = self.container.refresh().await {
                    tracing::error!(service = %name, "Failed to inspect container after die: {}", e);
                }
                if let Some(probe) = &self.probe {
                    probe.on_container_stopped().await;
                }
            }
            EventKind::Destroy => {
                tracing::debug!(service = %name, "Container destroyed");
                self.container.clear();
                if let Some(probe) = &self.probe {
                    probe.on_container_stopped().await;
                }
            }
            EventKind::Other(_) => {}
        }
    }

    pub async fn exec(&self, cmd: &[String]) -> Result<ExecOutput, ContainerError> {
        self.container.exec(cmd).await
    }

    pub async fn exec_interactive(&self, cmd: &[String]) -> Result<InteractiveSession, ContainerError> {
        self.container.exec_interactive(cmd).await
    }

    /// Stop background work: the dial loop, the log watcher and every
    /// session started through this service.
    pub async fn close(&self) {
        if let Some(probe) = &self.probe {
            probe.close().await;
        }
        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.descriptor.name)
            .field("kind", &self.descriptor.kind)
            .field("container", &self.container)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl StatusProvider for Service {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    async fn status(&self) -> Result<StatusReport, StatusError> {
        Service::status(self).await
    }
}

#[async_trait]
impl LogProvider for Service {
    async fn logs(&self, since: LogSince, tail: LogTail) -> Result<Vec<String>, ContainerError> {
        self.container.logs(since, tail).await
    }

    fn follow_logs(&self, cancel: CancellationToken) -> LineStream {
        self.container.follow_logs(cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::container::LifecycleState;
    use crate::testing::{FakeRuntime, StubProbe};
    use crate::watcher::PatternSet;

    fn service(
        runtime: &Arc<FakeRuntime>,
        descriptor: ServiceDescriptor,
        probe: Option<StubProbe>,
        peers: BTreeMap<String, Arc<Service>>,
    ) -> Service {
        let cancel = CancellationToken::new();
        let container = ContainerHandle::new(descriptor.container.clone(), runtime.clone(), cancel.clone());
        Service::new(
            descriptor,
            container,
            probe.map(|p| Box::new(p) as Box<dyn RpcHealthProbe>),
            None,
            peers,
            Duration::from_secs(3),
            cancel,
        )
    }

    fn bitcoind() -> ServiceDescriptor {
        ServiceDescriptor::new("bitcoind", "testnet_bitcoind_1", ServiceKind::Bitcoind)
    }

    #[tokio::test]
    async fn test_no_probe_when_not_running() {
        let runtime = Arc::new(FakeRuntime::new());
        let probe = StubProbe::ready();
        let calls = probe.calls();
        let svc = service(&runtime, bitcoind(), Some(probe), BTreeMap::new());

        assert_eq!(svc.status().await.unwrap().text, "Container missing");

        for state in [
            LifecycleState::Created,
            LifecycleState::Exited,
            LifecycleState::Paused,
            LifecycleState::Dead,
        ] {
            runtime.add_container("testnet_bitcoind_1", state, &[]);
            let text = svc.status().await.unwrap().text;
            assert_eq!(text, format!("Container {}", state));
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        runtime.set_state("testnet_bitcoind_1", LifecycleState::Running);
        assert_eq!(svc.status().await.unwrap().text, "Ready");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_only_when_native() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut d = bitcoind();
        d.disabled = true;
        let svc = service(&runtime, d, None, BTreeMap::new());
        assert_eq!(svc.status().await.unwrap().text, "Disabled");
    }

    #[tokio::test]
    async fn test_transient_errors_classified() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_container("testnet_xud_1", LifecycleState::Running, &[]);
        let d = ServiceDescriptor::new("xud", "testnet_xud_1", ServiceKind::Xud);

        let svc = service(&runtime, d.clone(), Some(StubProbe::failing("xud is locked")), BTreeMap::new());
        assert_eq!(
            svc.status().await.unwrap().text,
            "Wallet locked. Unlock with xucli unlock."
        );

        let svc = service(&runtime, d.clone(), Some(StubProbe::failing("xud is starting")), BTreeMap::new());
        assert_eq!(svc.status().await.unwrap().text, "Starting...");

        let svc = service(&runtime, d, Some(StubProbe::failing("unexpected eof")), BTreeMap::new());
        let err = svc.status().await.unwrap_err();
        assert_eq!(err.to_string(), "unexpected eof");
    }

    #[tokio::test]
    async fn test_unreachable_backend_waits() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_container("testnet_bitcoind_1", LifecycleState::Running, &[]);
        let svc = service(&runtime, bitcoind(), Some(StubProbe::no_client()), BTreeMap::new());
        assert_eq!(
            svc.status().await.unwrap().text,
            "Waiting for bitcoind to come up..."
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_shows_log_progress() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_container("testnet_lndbtc_1", LifecycleState::Running, &[]);
        runtime.push_logs(
            "testnet_lndbtc_1",
            &[
                "[INF] BTCN: Syncing to block height 3000 from peer 10.0.0.7:18333",
                "[INF] BTCN: Fetching set of checkpointed cfheaders filters from height=1000, hash=00aa",
            ],
        );
        let cancel = CancellationToken::new();
        let container = ContainerHandle::new("testnet_lndbtc_1", runtime.clone(), cancel.clone());
        container.refresh().await.unwrap();
        let watcher = LogWatcher::spawn(container.clone(), PatternSet::neutrino(false), cancel.clone());
        let mut progress = watcher.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            progress.wait_for(|p| p.current == 1000 && p.total == 3000),
        )
        .await
        .unwrap()
        .unwrap();

        let svc = Service::new(
            ServiceDescriptor::new("lndbtc", "testnet_lndbtc_1", ServiceKind::Lnd),
            container,
            Some(Box::new(StubProbe::no_client())),
            Some(watcher),
            BTreeMap::new(),
            Duration::from_secs(3),
            cancel,
        );
        assert_eq!(svc.status().await.unwrap().text, "Syncing 33.33% (1000/3000)");
        svc.close().await;
    }

    #[tokio::test]
    async fn test_mode_resolved_through_peer() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_container("testnet_lndbtc_1", LifecycleState::Running, &["BITCOIND_HOST=10.0.0.5"]);

        let lnd = Arc::new(service(
            &runtime,
            ServiceDescriptor::new("lndbtc", "testnet_lndbtc_1", ServiceKind::Lnd),
            None,
            BTreeMap::new(),
        ));
        let mut d = bitcoind();
        d.mode_probe = Some(ModeProbe {
            peer: "lndbtc".to_string(),
            env: "BITCOIND_HOST".to_string(),
            native_host: "bitcoind".to_string(),
            light_endpoints: vec!["neutrino".to_string()],
        });
        let peers = BTreeMap::from([("lndbtc".to_string(), lnd)]);
        let svc = service(&runtime, d.clone(), Some(StubProbe::ready()), peers.clone());

        assert_eq!(svc.mode().await.unwrap(), Mode::External);
        assert_eq!(svc.status().await.unwrap().text, "Ready (connected to external)");

        runtime.set_env("testnet_lndbtc_1", &["BITCOIND_HOST=neutrino"]);
        peers["lndbtc"].container().refresh().await.unwrap();
        assert_eq!(svc.status().await.unwrap().text, "Ready (light mode)");

        runtime.set_env("testnet_lndbtc_1", &["BITCOIND_HOST=bitcoind"]);
        peers["lndbtc"].container().refresh().await.unwrap();
        assert_eq!(svc.mode().await.unwrap(), Mode::Native);
        assert_eq!(svc.status().await.unwrap().text, "Container missing");

        // Undeclared peer is a dependency error, not a status.
        let orphan = service(&runtime, d, None, BTreeMap::new());
        assert!(matches!(
            orphan.status().await.unwrap_err(),
            StatusError::Dependency { .. }
        ));
    }

    #[tokio::test]
    async fn test_destroy_clears_snapshot_and_invalidates() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_container("testnet_bitcoind_1", LifecycleState::Running, &[]);
        let probe = StubProbe::ready();
        let stopped = probe.stopped();
        let svc = service(&runtime, bitcoind(), Some(probe), BTreeMap::new());

        svc.on_event(&EventKind::Start).await;
        assert!(svc.container().snapshot().is_some());

        svc.on_event(&EventKind::Destroy).await;
        assert!(svc.container().snapshot().is_none());
        assert_eq!(stopped.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
