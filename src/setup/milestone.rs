//! Setup log lines recognised as milestones.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Status published when the bring-up hands over to the shell.
pub const DONE: &str = "Done";

const LIGHT_SYNC_MARKER: &str = "LightSync";
const LIGHT_SYNC_SPLIT: &str = "[LightSync]";
const LIGHT_SYNC_STATUS: &str = "Syncing light clients";

/// Plain substring milestones, checked in order. The published status is
/// the substring itself.
const PLAIN_MILESTONES: &[&str] = &[
    "Waiting for XUD dependencies to be ready",
    "Setup wallets",
    "Create wallets",
    "Restore wallets",
    "Setup backup location",
    "Unlock wallets",
];

const FINISHED_MARKER: &str = "Start shell";

/// One published bring-up step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupMilestone {
    /// Position in the broadcaster's history, starting at 1.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub status: String,
    pub details: Option<BTreeMap<String, String>>,
}

/// What a setup log line means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineMatch {
    Milestone {
        status: String,
        details: Option<BTreeMap<String, String>>,
    },
    /// This bring-up is over. A later launcher run appends a new session.
    Finished,
}

/// Match one setup log line. Unrelated lines give `None`.
pub fn parse_line(line: &str) -> Option<LineMatch> {
    if line.contains(LIGHT_SYNC_MARKER) {
        return Some(LineMatch::Milestone {
            status: LIGHT_SYNC_STATUS.to_string(),
            details: Some(light_sync_details(line)),
        });
    }
    if let Some(status) = PLAIN_MILESTONES.iter().find(|m| line.contains(*m)) {
        return Some(LineMatch::Milestone {
            status: status.to_string(),
            details: None,
        });
    }
    if line.contains(FINISHED_MARKER) {
        return Some(LineMatch::Finished);
    }
    None
}

/// Matches belonging to the latest bring-up session in `text`. A session
/// ends at its finish marker; when nothing follows the last marker, the
/// finished session is the latest one.
pub fn last_session(text: &str) -> Vec<LineMatch> {
    let mut sessions: Vec<Vec<LineMatch>> = vec![Vec::new()];
    for matched in text.lines().filter_map(parse_line) {
        let finished = matched == LineMatch::Finished;
        if let Some(current) = sessions.last_mut() {
            current.push(matched);
        }
        if finished {
            sessions.push(Vec::new());
        }
    }
    sessions
        .into_iter()
        .rev()
        .find(|session| !session.is_empty())
        .unwrap_or_default()
}

/// `... [LightSync] bitcoind: 50.00% | litecoind: 12.00%` into a map.
/// Pairs without `": "` are skipped.
fn light_sync_details(line: &str) -> BTreeMap<String, String> {
    let Some((_, rest)) = line.split_once(LIGHT_SYNC_SPLIT) else {
        return BTreeMap::new();
    };
    rest.trim()
        .split(" | ")
        .filter_map(|pair| pair.split_once(": "))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}
