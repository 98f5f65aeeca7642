//! Test doubles for the container runtime and backend dialers.
//!
//! Provides:
//! - [`FakeRuntime`]: an in-memory [`ContainerRuntime`] with scriptable
//!   containers, logs, exec responses and lifecycle events
//! - [`StubDialer`]: a [`Dialer`] whose credential loads and dials can be
//!   made to fail or hang, with call counters
//! - [`StubProbe`]: an [`RpcHealthProbe`] returning a fixed outcome
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dockwatch::container::LifecycleState;
//! use dockwatch::testing::FakeRuntime;
//!
//! let runtime = Arc::new(FakeRuntime::new());
//! runtime.add_container("testnet_bitcoind_1", LifecycleState::Running, &[]);
//! runtime.push_logs("testnet_bitcoind_1", &["Bitcoin Core starting"]);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::container::{
    ContainerRuntime, ContainerSnapshot, EventKind, EventStream, ExecAttach, ExecOutput,
    LifecycleState, LineStream, LogOptions, LogTail, RuntimeEvent,
};
use crate::error::{ContainerError, RpcError};
use crate::rpc::Dialer;
use crate::service::{ProbeContext, RpcHealthProbe, StatusReport};

const LOG_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct FakeContainer {
    id: String,
    state: LifecycleState,
    env: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    logs: Vec<(DateTime<Utc>, String)>,
    live: broadcast::Sender<String>,
    exec: ExecOutput,
    inspect_error: Option<String>,
    hang_inspect: bool,
}

impl FakeContainer {
    fn snapshot(&self, name: &str) -> ContainerSnapshot {
        ContainerSnapshot {
            id: self.id.clone(),
            name: name.to_string(),
            state: self.state,
            env: self.env.clone(),
            started_at: self.started_at,
        }
    }
}

#[derive(Clone)]
enum FakeEvent {
    Event(RuntimeEvent),
    Error(String),
}

/// In-memory container runtime.
///
/// Containers are keyed by name. A container that was never added (or was
/// removed) behaves like a real missing container: inspect, logs and exec
/// return [`ContainerError::NotFound`].
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    events: broadcast::Sender<FakeEvent>,
    next_id: AtomicU32,
    inspects: AtomicU32,
    event_subscriptions: AtomicU32,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            containers: Mutex::new(HashMap::new()),
            events,
            next_id: AtomicU32::new(1),
            inspects: AtomicU32::new(0),
            event_subscriptions: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, FakeContainer>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with<R>(&self, name: &str, f: impl FnOnce(&mut FakeContainer) -> R) -> R {
        let mut containers = self.lock();
        let container = containers
            .get_mut(name)
            .unwrap_or_else(|| panic!("FakeRuntime: container '{name}' was never added"));
        f(container)
    }

    /// Add a container, or replace the state and environment of an existing
    /// one (its logs are kept).
    pub fn add_container(&self, name: &str, state: LifecycleState, env: &[&str]) {
        let env: Vec<String> = env.iter().map(|e| e.to_string()).collect();
        let started_at = state.is_running().then(Utc::now);
        let mut containers = self.lock();
        if let Some(existing) = containers.get_mut(name) {
            existing.state = state;
            existing.env = env;
            existing.started_at = started_at.or(existing.started_at);
            return;
        }
        let id = format!("{:012x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (live, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        containers.insert(
            name.to_string(),
            FakeContainer {
                id,
                state,
                env,
                started_at,
                logs: Vec::new(),
                live,
                exec: ExecOutput {
                    output: String::new(),
                    exit_code: 0,
                },
                inspect_error: None,
                hang_inspect: false,
            },
        );
    }

    pub fn remove_container(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Change the lifecycle state. Entering `running` stamps a new start time.
    pub fn set_state(&self, name: &str, state: LifecycleState) {
        self.with(name, |c| {
            if state.is_running() && !c.state.is_running() {
                c.started_at = Some(Utc::now());
            }
            c.state = state;
        });
    }

    pub fn set_env(&self, name: &str, env: &[&str]) {
        self.with(name, |c| c.env = env.iter().map(|e| e.to_string()).collect());
    }

    /// Make inspect fail with a non-"not found" runtime error.
    pub fn fail_inspect(&self, name: &str, reason: &str) {
        self.with(name, |c| c.inspect_error = Some(reason.to_string()));
    }

    /// Make inspect never return.
    pub fn hang_inspect(&self, name: &str) {
        self.with(name, |c| c.hang_inspect = true);
    }

    /// Append log lines; followers see them live.
    pub fn push_logs(&self, name: &str, lines: &[&str]) {
        self.with(name, |c| {
            let now = Utc::now();
            for line in lines {
                c.logs.push((now, line.to_string()));
                let _ = c.live.send(line.to_string());
            }
        });
    }

    pub fn set_exec_response(&self, name: &str, output: &str, exit_code: i64) {
        self.with(name, |c| {
            c.exec = ExecOutput {
                output: output.to_string(),
                exit_code,
            }
        });
    }

    /// Publish a lifecycle event. A removed container's event carries its
    /// name in place of the id.
    pub fn emit(&self, name: &str, kind: EventKind) {
        let id = self
            .lock()
            .get(name)
            .map(|c| c.id.clone())
            .unwrap_or_else(|| name.to_string());
        let _ = self.events.send(FakeEvent::Event(RuntimeEvent {
            kind,
            container_id: id,
            container_name: Some(name.to_string()),
        }));
    }

    /// Publish an error on every open event stream.
    pub fn fail_events(&self, reason: &str) {
        let _ = self.events.send(FakeEvent::Error(reason.to_string()));
    }

    pub fn inspect_count(&self) -> u32 {
        self.inspects.load(Ordering::SeqCst)
    }

    pub fn event_subscriptions(&self) -> u32 {
        self.event_subscriptions.load(Ordering::SeqCst)
    }

    fn not_found(name: &str) -> ContainerError {
        ContainerError::NotFound {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect(&self, name: &str) -> Result<ContainerSnapshot, ContainerError> {
        self.inspects.fetch_add(1, Ordering::SeqCst);
        let hang = {
            let containers = self.lock();
            let container = containers.get(name).ok_or_else(|| Self::not_found(name))?;
            if let Some(reason) = &container.inspect_error {
                return Err(ContainerError::Runtime {
                    name: name.to_string(),
                    reason: reason.clone(),
                });
            }
            if !container.hang_inspect {
                return Ok(container.snapshot(name));
            }
            true
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        Err(Self::not_found(name))
    }

    async fn logs(&self, name: &str, options: LogOptions) -> Result<LineStream, ContainerError> {
        let containers = self.lock();
        let container = containers.get(name).ok_or_else(|| Self::not_found(name))?;

        let since = options.since.as_unix();
        let mut stored: Vec<String> = container
            .logs
            .iter()
            .filter(|(at, _)| at.timestamp() >= since)
            .map(|(_, line)| line.clone())
            .collect();
        if let LogTail::Lines(n) = options.tail {
            let skip = stored.len().saturating_sub(n);
            stored.drain(..skip);
        }
        let stored = futures::stream::iter(stored.into_iter().map(Ok));

        if !options.follow {
            return Ok(Box::pin(stored));
        }
        let live = BroadcastStream::new(container.live.subscribe())
            .filter_map(|line| async move { line.ok().map(Ok) });
        Ok(Box::pin(stored.chain(live)))
    }

    async fn exec(&self, name: &str, _cmd: &[String]) -> Result<ExecOutput, ContainerError> {
        let containers = self.lock();
        let container = containers.get(name).ok_or_else(|| Self::not_found(name))?;
        Ok(container.exec.clone())
    }

    /// Attach an echo session: everything written comes back as output.
    async fn exec_attach(&self, name: &str, _cmd: &[String]) -> Result<ExecAttach, ContainerError> {
        if !self.lock().contains_key(name) {
            return Err(Self::not_found(name));
        }
        let (client, mut server) = tokio::io::duplex(1024);
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match server.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(ExecAttach {
            id: format!("exec-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            output: Box::pin(ReceiverStream::new(rx)),
            input: Box::pin(client),
        })
    }

    async fn events(&self) -> Result<EventStream, ContainerError> {
        self.event_subscriptions.fetch_add(1, Ordering::SeqCst);
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(|item| async move {
            match item {
                Ok(FakeEvent::Event(event)) => Some(Ok(event)),
                Ok(FakeEvent::Error(reason)) => Some(Err(ContainerError::Runtime {
                    name: "events".to_string(),
                    reason,
                })),
                Err(_) => None,
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Call counters shared between a [`StubDialer`] and the test.
#[derive(Debug, Clone, Default)]
pub struct StubCounters {
    credential_loads: Arc<AtomicU32>,
    dials: Arc<AtomicU32>,
}

impl StubCounters {
    pub fn credential_loads(&self) -> u32 {
        self.credential_loads.load(Ordering::SeqCst)
    }

    pub fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

/// Client handed out by [`StubDialer`]. `id` is the dial number.
#[derive(Debug)]
pub struct StubClient {
    pub id: u32,
}

/// A scriptable [`Dialer`].
///
/// The first `fail_credentials` loads fail with
/// [`RpcError::CredentialsUnavailable`], the first `fail_dials` dials fail
/// with [`RpcError::ConnectFailed`], and the first `hang_dials` dials never
/// return.
#[derive(Debug, Default)]
pub struct StubDialer {
    fail_credentials: u32,
    fail_dials: u32,
    hang_dials: u32,
    counters: StubCounters,
}

impl StubDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_credentials(mut self, n: u32) -> Self {
        self.fail_credentials = n;
        self
    }

    pub fn fail_dials(mut self, n: u32) -> Self {
        self.fail_dials = n;
        self
    }

    pub fn hang_dials(mut self, n: u32) -> Self {
        self.hang_dials = n;
        self
    }

    pub fn counters(&self) -> StubCounters {
        self.counters.clone()
    }
}

#[async_trait]
impl Dialer for StubDialer {
    type Client = StubClient;
    type Credentials = ();

    fn endpoint(&self) -> String {
        "stub://backend".to_string()
    }

    async fn load_credentials(&self) -> Result<(), RpcError> {
        let n = self.counters.credential_loads.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_credentials {
            return Err(RpcError::CredentialsUnavailable {
                reason: format!("credential load {n} failed"),
            });
        }
        Ok(())
    }

    async fn dial(&self, _credentials: ()) -> Result<StubClient, RpcError> {
        let n = self.counters.dials.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.hang_dials {
            futures::future::pending::<()>().await;
        }
        if n <= self.hang_dials.saturating_add(self.fail_dials) {
            return Err(RpcError::ConnectFailed {
                endpoint: self.endpoint(),
                reason: format!("dial {n} refused"),
            });
        }
        Ok(StubClient { id: n })
    }
}

enum StubOutcome {
    Report(StatusReport),
    Backend(String),
    NoClient,
    Hang,
}

/// An [`RpcHealthProbe`] with a fixed outcome.
pub struct StubProbe {
    outcome: StubOutcome,
    calls: Arc<AtomicU32>,
    stopped: Arc<AtomicU32>,
}

impl StubProbe {
    fn with(outcome: StubOutcome) -> Self {
        Self {
            outcome,
            calls: Arc::new(AtomicU32::new(0)),
            stopped: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Always "Ready".
    pub fn ready() -> Self {
        Self::with(StubOutcome::Report(StatusReport::ready()))
    }

    pub fn reporting(text: &str) -> Self {
        Self::with(StubOutcome::Report(StatusReport::new(text)))
    }

    /// Fails with backend error text.
    pub fn failing(message: &str) -> Self {
        Self::with(StubOutcome::Backend(message.to_string()))
    }

    /// Fails as if no client was published yet.
    pub fn no_client() -> Self {
        Self::with(StubOutcome::NoClient)
    }

    /// Never answers.
    pub fn hanging() -> Self {
        Self::with(StubOutcome::Hang)
    }

    /// Number of probe calls.
    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }

    /// Number of container-stopped notifications.
    pub fn stopped(&self) -> Arc<AtomicU32> {
        self.stopped.clone()
    }
}

#[async_trait]
impl RpcHealthProbe for StubProbe {
    async fn probe(&self, _ctx: &ProbeContext<'_>) -> Result<StatusReport, RpcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.outcome {
            StubOutcome::Report(report) => Ok(report.clone()),
            StubOutcome::Backend(message) => Err(RpcError::Backend {
                code: None,
                message: message.clone(),
            }),
            StubOutcome::NoClient => Err(RpcError::NoClientYet),
            StubOutcome::Hang => {
                futures::future::pending::<()>().await;
                Err(RpcError::Closed)
            }
        }
    }

    async fn on_container_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::container::LogSince;

    #[tokio::test]
    async fn test_fake_runtime_missing_container() {
        let runtime = FakeRuntime::new();
        let err = runtime.inspect("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(runtime.inspect_count(), 1);
    }

    #[tokio::test]
    async fn test_follow_sees_stored_then_live_lines() {
        let runtime = FakeRuntime::new();
        runtime.add_container("c", LifecycleState::Running, &[]);
        runtime.push_logs("c", &["one"]);
        let mut lines = runtime
            .logs(
                "c",
                LogOptions {
                    since: LogSince::Beginning,
                    tail: LogTail::All,
                    follow: true,
                },
            )
            .await
            .unwrap();
        runtime.push_logs("c", &["two"]);
        assert_eq!(lines.next().await.unwrap().unwrap(), "one");
        assert_eq!(lines.next().await.unwrap().unwrap(), "two");
    }

    #[tokio::test]
    async fn test_stub_dialer_scripts_failures() {
        let dialer = StubDialer::new().fail_credentials(1).fail_dials(1);
        assert!(dialer.load_credentials().await.is_err());
        assert!(dialer.load_credentials().await.is_ok());
        assert!(dialer.dial(()).await.is_err());
        assert_eq!(dialer.dial(()).await.unwrap().id, 2);
        assert_eq!(dialer.counters().dials(), 2);
    }
}
