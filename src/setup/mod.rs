//! Setup progress broadcaster.
//!
//! Tails the bring-up log, turns recognised lines into
//! [`SetupMilestone`]s, keeps a bounded history, and fans milestones out
//! to any number of subscribers. A subscriber may ask for part or all of
//! the history first; replayed milestones always arrive before live ones,
//! with no gap and no duplicate between the two.

mod milestone;
pub mod tail;

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SetupError;

pub use milestone::{DONE, LineMatch, SetupMilestone, last_session, parse_line};

/// Live channel capacity. A subscriber that falls further behind skips
/// ahead and is told how many milestones it missed.
const LIVE_CAPACITY: usize = 256;

/// How much history a new subscriber wants first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Replay {
    #[default]
    None,
    Last(usize),
    All,
}

impl Replay {
    /// `-1` means everything, `0` nothing, `n` the last `n`.
    pub fn from_count(count: i64) -> Self {
        match count {
            n if n < 0 => Replay::All,
            0 => Replay::None,
            n => Replay::Last(usize::try_from(n).unwrap_or(usize::MAX)),
        }
    }

    /// How many of `available` past milestones to leave out.
    pub fn skip(&self, available: usize) -> usize {
        match self {
            Replay::None => available,
            Replay::Last(n) => available.saturating_sub(*n),
            Replay::All => 0,
        }
    }
}

struct History {
    entries: VecDeque<SetupMilestone>,
    next_seq: u64,
    /// Dropped by `close`, which ends every subscription.
    live: Option<broadcast::Sender<SetupMilestone>>,
}

struct Shared {
    history: Mutex<History>,
    capacity: usize,
}

/// Publishes setup milestones with history replay. Cheap to clone.
#[derive(Clone)]
pub struct SetupBroadcaster {
    shared: Arc<Shared>,
}

impl SetupBroadcaster {
    /// `capacity` bounds the replay history; the oldest entries fall off.
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                history: Mutex::new(History {
                    entries: VecDeque::new(),
                    next_seq: 1,
                    live: Some(live),
                }),
                capacity: capacity.max(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, History> {
        self.shared.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a milestone and send it to current subscribers.
    pub fn publish(
        &self,
        status: impl Into<String>,
        details: Option<BTreeMap<String, String>>,
    ) -> Result<SetupMilestone, SetupError> {
        let mut history = self.lock();
        let Some(live) = history.live.clone() else {
            return Err(SetupError::Closed);
        };

        let milestone = SetupMilestone {
            seq: history.next_seq,
            at: Utc::now(),
            status: status.into(),
            details,
        };
        history.next_seq += 1;
        if history.entries.len() == self.shared.capacity {
            history.entries.pop_front();
        }
        history.entries.push_back(milestone.clone());
        // Sent under the lock so a concurrent subscribe sees it exactly once.
        let _ = live.send(milestone.clone());

        tracing::info!(seq = milestone.seq, status = %milestone.status, "Setup milestone");
        Ok(milestone)
    }

    /// Retained history, oldest first.
    pub fn history(&self) -> Vec<SetupMilestone> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .live
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Subscribe. Dropping the returned stream unsubscribes.
    ///
    /// After [`close`](Self::close) the subscription yields the requested
    /// history and then ends.
    pub fn subscribe(&self, replay: Replay) -> SetupSubscription {
        let history = self.lock();
        let skip = replay.skip(history.entries.len());
        let replayed: Vec<SetupMilestone> = history.entries.iter().skip(skip).cloned().collect();
        let live = history.live.as_ref().map(|tx| tx.subscribe());
        drop(history);

        let id = Uuid::new_v4();
        tracing::debug!(subscriber = %id, replayed = replayed.len(), "Setup subscriber added");

        let replayed = futures::stream::iter(replayed);
        let stream: Pin<Box<dyn Stream<Item = SetupMilestone> + Send>> = match live {
            Some(rx) => {
                let live = BroadcastStream::new(rx).filter_map(move |item| async move {
                    match item {
                        Ok(milestone) => Some(milestone),
                        Err(BroadcastStreamRecvError::Lagged(n)) => {
                            tracing::warn!(subscriber = %id, "Setup subscriber lagged, skipped {} milestones", n);
                            None
                        }
                    }
                });
                Box::pin(replayed.chain(live))
            }
            None => Box::pin(replayed),
        };

        SetupSubscription { id, stream }
    }

    fn publish_match(&self, matched: LineMatch) -> Result<SetupMilestone, SetupError> {
        match matched {
            LineMatch::Milestone { status, details } => self.publish(status, details),
            LineMatch::Finished => self.publish(DONE, None),
        }
    }

    /// Publish the latest session already written to `path`. Returns the
    /// byte offset just past the last complete line, where tailing should
    /// resume, and whether that session already finished. A missing file
    /// publishes nothing and resumes at 0.
    pub async fn load_last_session(&self, path: &Path) -> Result<(u64, bool), SetupError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, false)),
            Err(source) => {
                return Err(SetupError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let complete = raw.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        let text = String::from_utf8_lossy(&raw[..complete]);

        let session = last_session(&text);
        let finished = session.last() == Some(&LineMatch::Finished);
        tracing::debug!(path = %path.display(), milestones = session.len(), finished, "Loaded setup log");
        for matched in session {
            self.publish_match(matched)?;
        }
        Ok((complete as u64, finished))
    }

    /// Start tailing `path` from its beginning. See [`spawn_tail_from`](Self::spawn_tail_from).
    pub fn spawn_tail(&self, path: impl Into<PathBuf>, cancel: CancellationToken) -> JoinHandle<()> {
        self.spawn_tail_from(path, 0, cancel)
    }

    /// Start tailing `path` at byte `offset`. Each recognised line is
    /// published and a finished bring-up publishes [`DONE`]. Tailing
    /// carries on into later sessions until `cancel` fires or the
    /// broadcaster is closed.
    pub fn spawn_tail_from(
        &self,
        path: impl Into<PathBuf>,
        offset: u64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let broadcaster = self.clone();
        let path = path.into();
        tokio::spawn(async move {
            tracing::info!(path = %path.display(), offset, "Tailing setup log");
            let tail_cancel = cancel.child_token();
            let mut lines = tail::follow_from(&path, offset, tail_cancel.clone());
            while let Some(line) = lines.next().await {
                let Some(matched) = parse_line(&line) else {
                    continue;
                };
                if let Err(e) = broadcaster.publish_match(matched) {
                    tracing::debug!("Stopping setup tail: {}", e);
                    break;
                }
            }
            tail_cancel.cancel();
            tracing::info!(path = %path.display(), "Setup log tail finished");
        })
    }

    /// End every subscription. Later publishes fail with
    /// [`SetupError::Closed`].
    pub fn close(&self) {
        if self.lock().live.take().is_some() {
            tracing::debug!("Setup broadcaster closed");
        }
    }
}

impl std::fmt::Debug for SetupBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let history = self.lock();
        f.debug_struct("SetupBroadcaster")
            .field("history", &history.entries.len())
            .field("next_seq", &history.next_seq)
            .field("closed", &history.live.is_none())
            .finish()
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct SetupSubscription {
    id: Uuid,
    stream: Pin<Box<dyn Stream<Item = SetupMilestone> + Send>>,
}

impl SetupSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Stream for SetupSubscription {
    type Item = SetupMilestone;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl Drop for SetupSubscription {
    fn drop(&mut self) {
        tracing::debug!(subscriber = %self.id, "Setup subscriber removed");
    }
}
