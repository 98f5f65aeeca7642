//! Per-container handle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::container::exec::InteractiveSession;
use crate::container::{
    ContainerRuntime, ContainerSnapshot, ExecOutput, LifecycleState, LineStream, LogOptions,
    LogSince, LogTail,
};
use crate::error::ContainerError;

/// How often a waiter re-inspects the container when no event arrives.
const OBSERVE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Back-off before reopening a followed log stream that failed.
const FOLLOW_RETRY_DELAY: Duration = Duration::from_secs(3);

const FOLLOW_BUFFER: usize = 256;

/// Query, exec and log access to one named container.
///
/// The last observed [`ContainerSnapshot`] lives in a `watch` channel: writers
/// replace it wholesale, readers clone it out, and waiters use it as the
/// "observed" / "running" gate. Cloning the handle is cheap and shares the
/// snapshot.
#[derive(Clone)]
pub struct ContainerHandle {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    runtime: Arc<dyn ContainerRuntime>,
    snapshot: watch::Sender<Option<ContainerSnapshot>>,
    cancel: CancellationToken,
}

impl ContainerHandle {
    /// Create a handle. Nothing is inspected until the first refresh.
    ///
    /// `cancel` bounds every background task the handle starts (followed
    /// logs, interactive sessions).
    pub fn new(
        name: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
        cancel: CancellationToken,
    ) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                runtime,
                snapshot,
                cancel,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Last observed snapshot, if the container has been seen.
    pub fn snapshot(&self) -> Option<ContainerSnapshot> {
        self.inner.snapshot.borrow().clone()
    }

    /// Watch snapshot replacements.
    pub fn subscribe(&self) -> watch::Receiver<Option<ContainerSnapshot>> {
        self.inner.snapshot.subscribe()
    }

    /// Re-inspect the container and replace the snapshot.
    ///
    /// A missing container clears the snapshot and yields `Ok(None)`; every
    /// other runtime error propagates and leaves the snapshot untouched.
    pub async fn refresh(&self) -> Result<Option<ContainerSnapshot>, ContainerError> {
        match self.inner.runtime.inspect(&self.inner.name).await {
            Ok(snapshot) => {
                self.inner.snapshot.send_replace(Some(snapshot.clone()));
                Ok(Some(snapshot))
            }
            Err(e) if e.is_not_found() => {
                self.clear();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Forget the snapshot, as after a destroy event.
    pub fn clear(&self) {
        self.inner.snapshot.send_if_modified(|current| current.take().is_some());
    }

    /// Live lifecycle state. A missing container is [`LifecycleState::Missing`],
    /// not an error.
    pub async fn status(&self) -> Result<LifecycleState, ContainerError> {
        Ok(self
            .refresh()
            .await?
            .map(|s| s.state)
            .unwrap_or(LifecycleState::Missing))
    }

    /// Suspend until the container has been observed at least once.
    pub async fn wait_until_observed(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ContainerSnapshot, ContainerError> {
        self.wait_for(cancel, |_| true).await
    }

    /// Suspend until the container is observed running.
    pub async fn wait_until_running(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ContainerSnapshot, ContainerError> {
        self.wait_for(cancel, |s| s.state.is_running()).await
    }

    async fn wait_for(
        &self,
        cancel: &CancellationToken,
        ready: impl Fn(&ContainerSnapshot) -> bool,
    ) -> Result<ContainerSnapshot, ContainerError> {
        let mut rx = self.inner.snapshot.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(snapshot) = current.filter(|s| ready(s)) {
                return Ok(snapshot);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(self.cancelled()),
                _ = self.inner.cancel.cancelled() => return Err(self.cancelled()),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(self.cancelled());
                    }
                }
                _ = tokio::time::sleep(OBSERVE_POLL_INTERVAL) => {
                    if let Err(e) = self.refresh().await {
                        tracing::debug!(container = %self.inner.name, "Inspect while waiting failed: {}", e);
                    }
                }
            }
        }
    }

    fn cancelled(&self) -> ContainerError {
        ContainerError::Cancelled {
            name: self.inner.name.clone(),
        }
    }

    /// One-shot log read.
    pub async fn logs(&self, since: LogSince, tail: LogTail) -> Result<Vec<String>, ContainerError> {
        let stream = self
            .inner
            .runtime
            .logs(
                &self.inner.name,
                LogOptions {
                    since,
                    tail,
                    follow: false,
                },
            )
            .await?;
        stream.collect::<Vec<_>>().await.into_iter().collect()
    }

    /// Follow the container's output without end.
    ///
    /// Waits until the container exists, then streams from its start time.
    /// When the runtime closes the stream (container stopped or restarted)
    /// it is reopened from the new start time, or from the reopen instant if
    /// the container did not restart. The stream ends when the caller drops
    /// it or either cancellation token fires.
    pub fn follow_logs(&self, cancel: CancellationToken) -> LineStream {
        let (tx, rx) = mpsc::channel(FOLLOW_BUFFER);
        let handle = self.clone();
        let token = cancel.child_token();
        let parent = self.inner.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => {}
                _ = handle.follow_loop(tx, &token) => {}
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn follow_loop(
        &self,
        tx: mpsc::Sender<Result<String, ContainerError>>,
        cancel: &CancellationToken,
    ) {
        let name = &self.inner.name;
        let mut last_start = None;

        loop {
            let snapshot = match self.wait_until_observed(cancel).await {
                Ok(s) => s,
                Err(_) => return,
            };

            let since = match snapshot.started_at {
                Some(started) if Some(started) != last_start => LogSince::At(started),
                Some(_) => LogSince::At(Utc::now()),
                None => LogSince::Beginning,
            };
            last_start = snapshot.started_at;

            let options = LogOptions {
                since,
                tail: LogTail::All,
                follow: true,
            };
            let mut lines = match self.inner.runtime.logs(name, options).await {
                Ok(lines) => lines,
                Err(e) => {
                    if e.is_not_found() {
                        self.clear();
                    } else {
                        tracing::warn!(container = %name, "Failed to follow logs: {}", e);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(FOLLOW_RETRY_DELAY) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    line = lines.next() => match line {
                        Some(Ok(line)) => {
                            if tx.send(Ok(line)).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(container = %name, "Log stream error: {}", e);
                            break;
                        }
                        None => {
                            tracing::debug!(container = %name, "Log stream ended, reopening");
                            break;
                        }
                    },
                }
            }

            if tx.is_closed() {
                return;
            }
            if let Err(e) = self.refresh().await {
                tracing::debug!(container = %name, "Inspect after log stream end failed: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(FOLLOW_RETRY_DELAY) => {}
            }
        }
    }

    /// Run a command in the container and collect its output.
    pub async fn exec(&self, cmd: &[String]) -> Result<ExecOutput, ContainerError> {
        tracing::debug!(container = %self.inner.name, ?cmd, "Exec");
        self.inner.runtime.exec(&self.inner.name, cmd).await
    }

    /// Start an interactive TTY session.
    ///
    /// The session's token is a child of the handle's token, so shutting the
    /// handle down ends every session it started.
    pub async fn exec_interactive(&self, cmd: &[String]) -> Result<InteractiveSession, ContainerError> {
        let attach = self.inner.runtime.exec_attach(&self.inner.name, cmd).await?;
        Ok(InteractiveSession::spawn(
            &self.inner.name,
            attach,
            self.inner.cancel.child_token(),
        ))
    }

    /// Environment variable from the container's configuration.
    ///
    /// Uses the cached snapshot when present. A container that does not
    /// exist is an error here: callers resolve configuration through it.
    pub async fn getenv(&self, key: &str) -> Result<Option<String>, ContainerError> {
        let snapshot = match self.snapshot() {
            Some(s) => s,
            None => self.refresh().await?.ok_or_else(|| ContainerError::NotFound {
                name: self.inner.name.clone(),
            })?,
        };
        Ok(snapshot.getenv(key).map(str::to_string))
    }
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("name", &self.inner.name)
            .field("snapshot", &*self.inner.snapshot.borrow())
            .finish()
    }
}
