//! Sync progress extracted from container logs.
//!
//! Some backends expose no usable health API while they catch up with their
//! chain. The [`LogWatcher`] follows such a container's output and matches
//! each line against an ordered [`PatternSet`]; the first matching pattern
//! updates the [`SyncProgress`] counters. The caught-up pattern ends the
//! watch.
//!
//! Progress is published through a `watch` channel. The watcher task is the
//! only writer; readers get `Copy` snapshots.

mod patterns;

pub use patterns::{PatternKind, PatternSet, ProgressPattern};

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::container::ContainerHandle;

/// Snapshot of log-derived sync progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncProgress {
    pub current: u64,
    pub total: u64,
    pub caught_up: bool,
}

impl SyncProgress {
    /// Whether any progress line has been seen.
    pub fn has_progress(&self) -> bool {
        self.current > 0 || self.total > 0 || self.caught_up
    }

    /// `current / total * 100` with `total` raised to `current`, minus
    /// 0.005, floored at 0.
    pub fn percentage(&self) -> f32 {
        percentage(self.current, self.total)
    }

    /// Status text for a backend still catching up.
    pub fn syncing_text(&self) -> String {
        syncing_text(self.current, self.total)
    }

    /// Apply one line. Returns `true` if the snapshot changed.
    ///
    /// Lines after caught-up are ignored and `current` never decreases.
    pub fn apply(&mut self, patterns: &PatternSet, line: &str) -> bool {
        if self.caught_up {
            return false;
        }
        let Some((kind, value)) = patterns.match_line(line) else {
            return false;
        };
        let before = *self;
        match kind {
            PatternKind::CaughtUp => {
                self.current = self.current.max(value);
                self.caught_up = true;
            }
            PatternKind::Current => self.current = self.current.max(value),
            PatternKind::Total => self.total = value,
        }
        *self != before
    }
}

/// Completion percentage of `current` out of `total`.
pub fn percentage(current: u64, total: u64) -> f32 {
    let total = total.max(current);
    if total == 0 {
        return 0.0;
    }
    let p = current as f32 / total as f32 * 100.0;
    (p - 0.005).max(0.0)
}

/// `Syncing X.XX% (current/total)` with `total` raised to `current`.
pub fn syncing_text(current: u64, total: u64) -> String {
    let p = percentage(current, total);
    format!("Syncing {:.2}% ({}/{})", p, current, total.max(current))
}

/// Drive `progress` from a line stream until caught up, the stream ends, or
/// `cancel` fires. Returns the final snapshot.
pub async fn run<S>(
    mut lines: S,
    patterns: &PatternSet,
    progress: &watch::Sender<SyncProgress>,
    cancel: &CancellationToken,
) -> SyncProgress
where
    S: Stream<Item = String> + Unpin,
{
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let line = line.trim();
        let changed = progress.send_if_modified(|p| p.apply(patterns, line));
        if changed {
            let snap = *progress.borrow();
            tracing::trace!(current = snap.current, total = snap.total, "Sync progress");
            if snap.caught_up {
                tracing::debug!(height = snap.current, "Caught up, log watch finished");
                break;
            }
        }
    }
    *progress.borrow()
}

/// Background task following one container's logs.
pub struct LogWatcher {
    progress: watch::Receiver<SyncProgress>,
    cancel: CancellationToken,
}

impl LogWatcher {
    /// Start watching. The task ends when caught up or when `cancel` fires.
    pub fn spawn(container: ContainerHandle, patterns: PatternSet, cancel: CancellationToken) -> Self {
        let (tx, rx) = watch::channel(SyncProgress::default());
        let token = cancel.child_token();
        let task_token = token.clone();

        tokio::spawn(async move {
            let name = container.name().to_string();
            tracing::debug!(container = %name, "Log watcher starting");
            let lines = container
                .follow_logs(task_token.clone())
                .filter_map(|line| async move {
                    match line {
                        Ok(line) => Some(line),
                        Err(e) => {
                            tracing::debug!("Skipping log read error: {}", e);
                            None
                        }
                    }
                });
            let lines = Box::pin(lines);
            let last = run(lines, &patterns, &tx, &task_token).await;
            // Stop the follower once caught up.
            task_token.cancel();
            tracing::debug!(container = %name, current = last.current, total = last.total, "Log watcher stopped");
        });

        Self {
            progress: rx,
            cancel: token,
        }
    }

    pub fn progress(&self) -> SyncProgress {
        *self.progress.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.progress.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for LogWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWatcher")
            .field("progress", &self.progress())
            .finish()
    }
}
