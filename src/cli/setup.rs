//! `setup-status` command.

use std::io::Write;

use anyhow::Context;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::setup::{DONE, Replay, SetupBroadcaster};

/// Replay for the latest session. A finished session always shows its
/// [`DONE`], so the command never waits on a bring-up that is over.
fn session_replay(history: i64, finished: bool) -> Replay {
    match Replay::from_count(history) {
        Replay::None if finished => Replay::Last(1),
        replay => replay,
    }
}

/// Print milestones as JSON lines until setup is done or `cancel` fires.
///
/// Milestones of the latest session already in the log count as history;
/// `history` picks how many of those are shown. [`DONE`] is always printed.
pub async fn run_setup_status_command(
    config: &Config,
    history: i64,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let path = config.settings.setup_log.clone();
    let broadcaster = SetupBroadcaster::new(config.settings.setup_history);
    let (offset, finished) = broadcaster.load_last_session(&path).await?;
    let mut subscription = broadcaster.subscribe(session_replay(history, finished));
    let token = cancel.child_token();
    let tail = broadcaster.spawn_tail_from(path, offset, token.clone());

    let stdout = std::io::stdout();
    loop {
        let milestone = tokio::select! {
            _ = token.cancelled() => break,
            m = subscription.next() => match m {
                Some(m) => m,
                None => break,
            },
        };
        let done = milestone.status == DONE;
        let line = serde_json::to_string(&milestone)?;
        let mut out = stdout.lock();
        writeln!(out, "{}", line).context("failed to write milestone")?;
        out.flush().context("failed to write milestone")?;
        if done {
            break;
        }
    }

    token.cancel();
    broadcaster.close();
    if let Err(e) = tail.await {
        tracing::warn!("Setup tail task failed: {}", e);
    }
    Ok(())
}
