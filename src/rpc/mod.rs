//! Lazily established backend control-plane clients.
//!
//! Every backend kind has a [`Dialer`] that knows how to load credentials and
//! open a typed client. [`RpcClient`] owns one dial loop per connection:
//!
//! ```text
//!   Uninitialized ──spawn──▶ Dialing ──connected──▶ Connected
//!        ▲                     │  ▲                     │
//!        │          retry/back-off │     invalidate()   │
//!        │                     ▼  │◀────────────────────┘
//!        │             PermanentlyFailed (only with max_attempts)
//!        └──────── close() ──▶ Closed
//! ```
//!
//! Readers never wait for the loop: until a client is published they get
//! [`RpcError::NoClientYet`].

pub mod health;
pub mod jsonrpc;
pub mod lnd;
pub mod xud;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock, watch};
use tokio_util::sync::CancellationToken;

use crate::container::ContainerHandle;
use crate::error::RpcError;

pub use health::{HttpHealthClient, HttpHealthDialer, TcpProbe, TcpProbeDialer};
pub use jsonrpc::{BlockchainInfo, EthSyncing, JsonRpcAuth, JsonRpcClient, JsonRpcDialer};
pub use lnd::{LndClient, LndDialer, LndInfo};
pub use xud::{XucliClient, XudDialer, XudInfo};

/// Knows how to reach one backend endpoint.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Client: Send + Sync + 'static;
    type Credentials: Send + 'static;

    /// Human-readable endpoint for logs and errors.
    fn endpoint(&self) -> String;

    /// Load whatever the backend requires to authenticate. Missing material
    /// is [`RpcError::CredentialsUnavailable`] and is retried.
    async fn load_credentials(&self) -> Result<Self::Credentials, RpcError>;

    /// Open a client. Called only once the container is observed running,
    /// and bounded by [`RetryPolicy::connect_timeout`].
    async fn dial(&self, credentials: Self::Credentials) -> Result<Self::Client, RpcError>;
}

/// Timing of the dial loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Back-off after a failed credential load or connect.
    pub retry_delay: Duration,
    /// Upper bound on one connect attempt.
    pub connect_timeout: Duration,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(3),
            max_attempts: None,
        }
    }
}

/// Observable state of a dial loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    Uninitialized,
    Dialing { attempt: u32 },
    Connected,
    PermanentlyFailed { attempts: u32 },
    Closed,
}

/// A backend client that connects in the background.
pub struct RpcClient<D: Dialer> {
    shared: Arc<Shared<D>>,
}

struct Shared<D: Dialer> {
    service: String,
    dialer: D,
    container: ContainerHandle,
    policy: RetryPolicy,
    client: RwLock<Option<Arc<D::Client>>>,
    state: watch::Sender<RpcState>,
    invalidated: Notify,
    cancel: CancellationToken,
}

impl<D: Dialer> RpcClient<D> {
    /// Create the client and start its dial loop.
    ///
    /// The loop runs until `cancel` fires, [`close`](Self::close) is called,
    /// the client is dropped, or the retry ceiling is reached.
    pub fn spawn(
        service: impl Into<String>,
        dialer: D,
        container: ContainerHandle,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(RpcState::Uninitialized);
        let shared = Arc::new(Shared {
            service: service.into(),
            dialer,
            container,
            policy,
            client: RwLock::new(None),
            state,
            invalidated: Notify::new(),
            cancel: cancel.child_token(),
        });

        tokio::spawn(dial_loop(shared.clone()));

        Self { shared }
    }

    pub fn endpoint(&self) -> String {
        self.shared.dialer.endpoint()
    }

    pub fn state(&self) -> RpcState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RpcState> {
        self.shared.state.subscribe()
    }

    /// The published client, without waiting.
    pub async fn client(&self) -> Result<Arc<D::Client>, RpcError> {
        if let Some(client) = self.shared.client.read().await.as_ref() {
            return Ok(client.clone());
        }
        Err(match self.state() {
            RpcState::PermanentlyFailed { attempts } => RpcError::PermanentlyFailed { attempts },
            RpcState::Closed => RpcError::Closed,
            _ => RpcError::NoClientYet,
        })
    }

    /// Run one call against the published client under `timeout`.
    pub async fn call<T, F, Fut>(&self, timeout: Duration, f: F) -> Result<T, RpcError>
    where
        F: FnOnce(Arc<D::Client>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let client = self.client().await?;
        tokio::time::timeout(timeout, f(client))
            .await
            .map_err(|_| RpcError::Timeout(timeout))?
    }

    /// Drop the published client and dial again once the container is
    /// running. No-op unless currently connected.
    pub async fn invalidate(&self) {
        let mut client = self.shared.client.write().await;
        if client.take().is_some() {
            tracing::info!(service = %self.shared.service, "RPC connection invalidated");
            self.shared.invalidated.notify_one();
        }
    }

    /// Stop the dial loop for good.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        *self.shared.client.write().await = None;
        self.shared.state.send_replace(RpcState::Closed);
    }
}

impl<D: Dialer> Drop for RpcClient<D> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl<D: Dialer> std::fmt::Debug for RpcClient<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("service", &self.shared.service)
            .field("endpoint", &self.shared.dialer.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

enum Step {
    Retry,
    Stop,
}

async fn dial_loop<D: Dialer>(shared: Arc<Shared<D>>) {
    let service = shared.service.clone();
    let mut failures: u32 = 0;

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        shared
            .state
            .send_replace(RpcState::Dialing { attempt: failures + 1 });

        let result = attempt(&shared).await;
        match result {
            Ok(client) => {
                failures = 0;
                *shared.client.write().await = Some(Arc::new(client));
                shared.state.send_replace(RpcState::Connected);
                tracing::info!(service = %service, endpoint = %shared.dialer.endpoint(), "RPC client connected");

                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = shared.invalidated.notified() => {
                        tracing::debug!(service = %service, "Redialing after invalidation");
                        continue;
                    }
                }
            }
            Err(None) => break,
            Err(Some(e)) => {
                failures += 1;
                tracing::debug!(service = %service, attempt = failures, "RPC dial failed: {}", e);
                match back_off(&shared, failures).await {
                    Step::Retry => continue,
                    Step::Stop => break,
                }
            }
        }
    }

    if !shared.cancel.is_cancelled() {
        return;
    }
    *shared.client.write().await = None;
    shared.state.send_if_modified(|state| {
        if matches!(state, RpcState::PermanentlyFailed { .. } | RpcState::Closed) {
            return false;
        }
        *state = RpcState::Closed;
        true
    });
    tracing::debug!(service = %service, "RPC dial loop stopped");
}

/// One pass through credentials, gate and connect. `Err(None)` means the
/// loop was cancelled.
async fn attempt<D: Dialer>(shared: &Shared<D>) -> Result<D::Client, Option<RpcError>> {
    let credentials = shared.dialer.load_credentials().await.map_err(Some)?;

    shared
        .container
        .wait_until_running(&shared.cancel)
        .await
        .map_err(|_| None)?;

    let timeout = shared.policy.connect_timeout;
    tokio::select! {
        _ = shared.cancel.cancelled() => Err(None),
        res = tokio::time::timeout(timeout, shared.dialer.dial(credentials)) => match res {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => Err(Some(e)),
            Err(_) => Err(Some(RpcError::ConnectFailed {
                endpoint: shared.dialer.endpoint(),
                reason: format!("connect timed out after {timeout:?}"),
            })),
        },
    }
}

async fn back_off<D: Dialer>(shared: &Shared<D>, failures: u32) -> Step {
    if let Some(max) = shared.policy.max_attempts
        && failures >= max
    {
        tracing::warn!(
            service = %shared.service,
            endpoint = %shared.dialer.endpoint(),
            "Giving up on RPC connection after {} attempts",
            failures
        );
        shared
            .state
            .send_replace(RpcState::PermanentlyFailed { attempts: failures });
        return Step::Stop;
    }

    tokio::select! {
        _ = shared.cancel.cancelled() => Step::Stop,
        _ = tokio::time::sleep(shared.policy.retry_delay) => Step::Retry,
    }
}
