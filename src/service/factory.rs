//! Wires a descriptor to its container, probe and log watcher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::container::{ContainerHandle, ContainerRuntime};
use crate::error::ConfigError;
use crate::rpc::{
    HttpHealthDialer, JsonRpcAuth, JsonRpcDialer, LndDialer, RetryPolicy, RpcClient,
    TcpProbeDialer, XudDialer,
};
use crate::service::probes::{
    BoltzProbe, ChainDaemonProbe, ConnextProbe, GethProbe, LndProbe, XudProbe,
};
use crate::service::{RpcHealthProbe, Service, ServiceDescriptor, ServiceKind};
use crate::watcher::{LogWatcher, PatternSet};

const DEFAULT_XUD_CLI: &str = "xucli";
const CONNEXT_HEALTH_PATH: &str = "/health";

/// Settings shared by every service of one registry.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub network: String,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            network: "testnet".to_string(),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(3),
        }
    }
}

impl ServiceOptions {
    fn simnet(&self) -> bool {
        self.network == "simnet"
    }
}

fn invalid(descriptor: &ServiceDescriptor, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidService {
        service: descriptor.name.clone(),
        message: message.into(),
    }
}

fn port(descriptor: &ServiceDescriptor) -> Result<u16, ConfigError> {
    descriptor
        .rpc
        .port
        .or_else(|| descriptor.kind.default_port())
        .ok_or_else(|| invalid(descriptor, "rpc.port is required"))
}

/// Check the kind-specific control settings without building anything.
pub fn validate_rpc(descriptor: &ServiceDescriptor) -> Result<(), ConfigError> {
    let rpc = &descriptor.rpc;
    match descriptor.kind {
        ServiceKind::Bitcoind | ServiceKind::Litecoind => {
            port(descriptor)?;
            if rpc.username.is_some() != rpc.password.is_some() {
                return Err(invalid(
                    descriptor,
                    "rpc.username and rpc.password must be set together",
                ));
            }
        }
        ServiceKind::Geth | ServiceKind::Connext => {
            port(descriptor)?;
        }
        ServiceKind::Lnd => {
            port(descriptor)?;
            if rpc.tls_cert.is_none() {
                return Err(invalid(descriptor, "rpc.tls_cert is required"));
            }
            if rpc.macaroon.is_none() {
                return Err(invalid(descriptor, "rpc.macaroon is required"));
            }
        }
        ServiceKind::Boltz => {
            if rpc.ports.is_empty() {
                return Err(invalid(descriptor, "rpc.ports needs at least one chain"));
            }
        }
        ServiceKind::Xud
        | ServiceKind::Arby
        | ServiceKind::Webui
        | ServiceKind::Proxy
        | ServiceKind::Generic => {}
    }
    Ok(())
}

fn json_rpc_auth(descriptor: &ServiceDescriptor) -> JsonRpcAuth {
    let rpc = &descriptor.rpc;
    match (&rpc.username, &rpc.password, &rpc.cookie_file) {
        (Some(username), Some(password), _) => JsonRpcAuth::Basic {
            username: username.clone(),
            password: password.clone(),
        },
        (_, _, Some(cookie)) => JsonRpcAuth::CookieFile(cookie.clone()),
        _ => JsonRpcAuth::None,
    }
}

/// Build one service.
///
/// `peers` must hold every service `descriptor` declared. All background
/// work (dial loops, log watcher, followed logs) is bound to a child of
/// `cancel`.
pub fn build_service(
    descriptor: ServiceDescriptor,
    runtime: Arc<dyn ContainerRuntime>,
    peers: BTreeMap<String, Arc<Service>>,
    options: &ServiceOptions,
    cancel: &CancellationToken,
) -> Result<Service, ConfigError> {
    validate_rpc(&descriptor)?;

    let token = cancel.child_token();
    let container = ContainerHandle::new(descriptor.container.clone(), runtime, token.clone());
    let rpc = &descriptor.rpc;
    let name = descriptor.name.as_str();

    let mut watcher = None;
    let probe: Option<Box<dyn RpcHealthProbe>> = match descriptor.kind {
        ServiceKind::Bitcoind | ServiceKind::Litecoind => {
            let dialer = JsonRpcDialer::new(
                &rpc.host,
                port(&descriptor)?,
                json_rpc_auth(&descriptor),
                options.call_timeout,
            );
            Some(Box::new(ChainDaemonProbe::new(RpcClient::spawn(
                name,
                dialer,
                container.clone(),
                options.retry,
                token.clone(),
            ))))
        }
        ServiceKind::Geth => {
            let dialer = JsonRpcDialer::new(
                &rpc.host,
                port(&descriptor)?,
                JsonRpcAuth::None,
                options.call_timeout,
            );
            Some(Box::new(GethProbe::new(RpcClient::spawn(
                name,
                dialer,
                container.clone(),
                options.retry,
                token.clone(),
            ))))
        }
        ServiceKind::Lnd => {
            let (Some(cert), Some(macaroon)) = (&rpc.tls_cert, &rpc.macaroon) else {
                return Err(invalid(&descriptor, "rpc.tls_cert and rpc.macaroon are required"));
            };
            let dialer = LndDialer::new(
                &rpc.host,
                port(&descriptor)?,
                cert.clone(),
                macaroon.clone(),
                options.call_timeout,
            );
            watcher = Some(LogWatcher::spawn(
                container.clone(),
                PatternSet::neutrino(options.simnet()),
                token.clone(),
            ));
            Some(Box::new(LndProbe::new(
                RpcClient::spawn(name, dialer, container.clone(), options.retry, token.clone()),
                container.clone(),
            )))
        }
        ServiceKind::Xud => {
            let cli = rpc.cli.clone().unwrap_or_else(|| DEFAULT_XUD_CLI.to_string());
            let dialer = XudDialer::new(container.clone(), cli, rpc.tls_cert.clone());
            Some(Box::new(XudProbe::new(RpcClient::spawn(
                name,
                dialer,
                container.clone(),
                options.retry,
                token.clone(),
            ))))
        }
        ServiceKind::Connext => {
            let dialer = HttpHealthDialer::new(
                &rpc.host,
                port(&descriptor)?,
                CONNEXT_HEALTH_PATH,
                options.call_timeout,
            );
            Some(Box::new(ConnextProbe::new(RpcClient::spawn(
                name,
                dialer,
                container.clone(),
                options.retry,
                token.clone(),
            ))))
        }
        ServiceKind::Boltz => {
            let chains = rpc
                .ports
                .iter()
                .map(|(chain, port)| {
                    let client = RpcClient::spawn(
                        format!("{}/{}", name, chain),
                        TcpProbeDialer::new(&rpc.host, *port),
                        container.clone(),
                        options.retry,
                        token.clone(),
                    );
                    (chain.clone(), client)
                })
                .collect();
            Some(Box::new(BoltzProbe::new(chains)))
        }
        ServiceKind::Arby | ServiceKind::Webui | ServiceKind::Proxy | ServiceKind::Generic => None,
    };

    tracing::debug!(
        service = %descriptor.name,
        kind = %descriptor.kind,
        container = %descriptor.container,
        probe = probe.is_some(),
        "Service built"
    );

    Ok(Service::new(
        descriptor,
        container,
        probe,
        watcher,
        peers,
        options.call_timeout,
        token,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use crate::container::LifecycleState;
    use crate::testing::FakeRuntime;

    fn build(runtime: &Arc<FakeRuntime>, d: ServiceDescriptor) -> Result<Service, ConfigError> {
        build_service(
            d,
            runtime.clone(),
            BTreeMap::new(),
            &ServiceOptions::default(),
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_lnd_requires_credentials() {
        let runtime = Arc::new(FakeRuntime::new());
        let d = ServiceDescriptor::new("lndbtc", "testnet_lndbtc_1", ServiceKind::Lnd);
        let err = build(&runtime, d).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidService { ref service, .. } if service == "lndbtc"));
    }

    #[tokio::test]
    async fn test_lnd_gets_log_watcher() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut d = ServiceDescriptor::new("lndbtc", "testnet_lndbtc_1", ServiceKind::Lnd);
        d.rpc.tls_cert = Some(PathBuf::from("/nonexistent/tls.cert"));
        d.rpc.macaroon = Some(PathBuf::from("/nonexistent/admin.macaroon"));
        let svc = build(&runtime, d).unwrap();
        assert!(svc.progress().is_some());
        assert_eq!(svc.status().await.unwrap().text, "Container missing");
        svc.close().await;
    }

    #[tokio::test]
    async fn test_boltz_requires_chain_ports() {
        let runtime = Arc::new(FakeRuntime::new());
        let d = ServiceDescriptor::new("boltz", "testnet_boltz_1", ServiceKind::Boltz);
        assert!(build(&runtime, d).is_err());
    }

    #[tokio::test]
    async fn test_half_basic_auth_rejected() {
        let mut d = ServiceDescriptor::new("bitcoind", "testnet_bitcoind_1", ServiceKind::Bitcoind);
        d.rpc.username = Some("xu".to_string());
        assert!(validate_rpc(&d).is_err());
        d.rpc.username = None;
        assert!(validate_rpc(&d).is_ok());
    }

    #[tokio::test]
    async fn test_container_only_kind_ready_when_running() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_container("testnet_arby_1", LifecycleState::Running, &[]);
        let d = ServiceDescriptor::new("arby", "testnet_arby_1", ServiceKind::Arby);
        let svc = build(&runtime, d).unwrap();
        assert!(svc.progress().is_none());
        assert_eq!(svc.status().await.unwrap().text, "Ready");

        runtime.set_state("testnet_arby_1", LifecycleState::Exited);
        assert_eq!(svc.status().await.unwrap().text, "Container exited");
    }

    #[tokio::test]
    async fn test_running_chain_daemon_waits_for_rpc() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_container("testnet_bitcoind_1", LifecycleState::Running, &[]);
        let mut d = ServiceDescriptor::new("bitcoind", "testnet_bitcoind_1", ServiceKind::Bitcoind);
        d.rpc.host = "127.0.0.1".to_string();
        d.rpc.port = Some(1);
        let svc = build(&runtime, d).unwrap();
        // Right after start no client has been published.
        assert_eq!(
            svc.status().await.unwrap().text,
            "Waiting for bitcoind to come up..."
        );
        svc.close().await;
    }
}
