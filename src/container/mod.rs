//! Container runtime abstraction.
//!
//! [`ContainerRuntime`] is the seam to the container engine: inspect, logs,
//! exec and the lifecycle event stream. [`DockerRuntime`] implements it over
//! the Docker Engine API; tests use [`crate::testing::FakeRuntime`].
//!
//! [`ContainerHandle`] wraps the runtime for one named container and keeps
//! the last observed [`ContainerSnapshot`], which doubles as the
//! "wait until running" gate for RPC dial loops and log watchers.

pub mod docker;
pub mod exec;
pub mod handle;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::{Stream, StreamExt};
use tokio::io::AsyncWrite;

use crate::error::ContainerError;

pub use docker::{DockerRuntime, connect_docker};
pub use exec::InteractiveSession;
pub use handle::ContainerHandle;

/// Stream of decoded log lines.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, ContainerError>> + Send>>;

/// Stream of raw output chunks (stdout and stderr interleaved).
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, ContainerError>> + Send>>;

/// Stream of container lifecycle events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RuntimeEvent, ContainerError>> + Send>>;

/// Lifecycle state of a container as seen by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// The runtime has no container with this name.
    Missing,
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Missing => "missing",
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Restarting => "restarting",
            LifecycleState::Exited => "exited",
            LifecycleState::Dead => "dead",
            LifecycleState::Unknown => "unknown",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, LifecycleState::Running)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "created" => LifecycleState::Created,
            "running" => LifecycleState::Running,
            "paused" => LifecycleState::Paused,
            "restarting" => LifecycleState::Restarting,
            "exited" => LifecycleState::Exited,
            "dead" => LifecycleState::Dead,
            "missing" => LifecycleState::Missing,
            _ => LifecycleState::Unknown,
        })
    }
}

/// Point-in-time view of one container.
///
/// Snapshots are replaced wholesale on refresh and never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub state: LifecycleState,
    /// Environment as `KEY=value` entries, in the runtime's order.
    pub env: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl ContainerSnapshot {
    /// Look up an environment variable. The first `KEY=` entry wins.
    pub fn getenv(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .and_then(|(k, v)| (k == key).then_some(v))
        })
    }
}

/// Kind of container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Start,
    Die,
    Destroy,
    Other(String),
}

impl EventKind {
    pub fn from_action(action: &str) -> Self {
        match action {
            "create" => EventKind::Create,
            "start" => EventKind::Start,
            "die" => EventKind::Die,
            "destroy" => EventKind::Destroy,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// A container lifecycle event from the runtime's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub kind: EventKind,
    pub container_id: String,
    /// Container name from the event attributes, if the runtime sent one.
    pub container_name: Option<String>,
}

/// Where a log read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogSince {
    #[default]
    Beginning,
    At(DateTime<Utc>),
}

impl LogSince {
    /// Parse the `since` values accepted by the upward interface: a relative
    /// duration (`90s`, `10m`, `1h`, `2d`), an RFC 3339 timestamp, or a unix
    /// timestamp in seconds.
    pub fn parse(input: &str, now: DateTime<Utc>) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() || input == "0" {
            return Ok(LogSince::Beginning);
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
            return Ok(LogSince::At(ts.with_timezone(&Utc)));
        }
        if let Ok(secs) = input.parse::<i64>() {
            return DateTime::from_timestamp(secs, 0)
                .map(LogSince::At)
                .ok_or_else(|| format!("timestamp out of range: {input}"));
        }

        let unit_at = input.char_indices().last().map(|(i, _)| i).unwrap_or(0);
        let (digits, unit) = input.split_at(unit_at);
        let amount: i64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{input}', expected e.g. 10m or 1h"))?;
        let delta = match unit {
            "s" => ChronoDuration::seconds(amount),
            "m" => ChronoDuration::minutes(amount),
            "h" => ChronoDuration::hours(amount),
            "d" => ChronoDuration::days(amount),
            _ => return Err(format!("invalid duration unit in '{input}'")),
        };
        Ok(LogSince::At(now - delta))
    }

    /// Unix seconds as the Docker API expects them (`0` = beginning).
    pub fn as_unix(&self) -> i64 {
        match self {
            LogSince::Beginning => 0,
            LogSince::At(ts) => ts.timestamp(),
        }
    }
}

/// How many trailing lines a log read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogTail {
    #[default]
    All,
    Lines(usize),
}

impl LogTail {
    pub fn parse(input: &str) -> Result<Self, String> {
        match input.trim() {
            "" | "all" => Ok(LogTail::All),
            n => n
                .parse()
                .map(LogTail::Lines)
                .map_err(|_| format!("invalid tail '{n}', expected 'all' or a line count")),
        }
    }

    pub fn as_docker_arg(&self) -> String {
        match self {
            LogTail::All => "all".to_string(),
            LogTail::Lines(n) => n.to_string(),
        }
    }
}

/// Options for a log read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogOptions {
    pub since: LogSince,
    pub tail: LogTail,
    pub follow: bool,
}

/// Output of a non-interactive exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Combined stdout and stderr.
    pub output: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Raw streams of an attached interactive exec, before a session owns them.
pub struct ExecAttach {
    pub id: String,
    pub output: ChunkStream,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// The container runtime collaborator.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Inspect a container by name or id.
    async fn inspect(&self, name: &str) -> Result<ContainerSnapshot, ContainerError>;

    /// Read logs. With `follow` the stream stays open until the container
    /// stops or the caller drops it.
    async fn logs(&self, name: &str, options: LogOptions) -> Result<LineStream, ContainerError>;

    /// Run a command to completion and collect its output.
    async fn exec(&self, name: &str, cmd: &[String]) -> Result<ExecOutput, ContainerError>;

    /// Start a TTY exec with stdin attached.
    async fn exec_attach(&self, name: &str, cmd: &[String]) -> Result<ExecAttach, ContainerError>;

    /// Subscribe to container lifecycle events.
    async fn events(&self) -> Result<EventStream, ContainerError>;
}

/// Split a stream of output chunks into lines.
///
/// Chunk boundaries from the runtime do not line up with newlines; a trailing
/// partial line is emitted when the stream ends. Carriage returns are
/// stripped.
pub fn lines_from_chunks(chunks: ChunkStream) -> LineStream {
    let state = (chunks, Vec::<u8>::new(), std::collections::VecDeque::<String>::new(), false);
    let lines = futures::stream::unfold(state, |(mut chunks, mut buf, mut ready, mut done)| {
        async move {
            loop {
                if let Some(line) = ready.pop_front() {
                    return Some((Ok(line), (chunks, buf, ready, done)));
                }
                if done {
                    return None;
                }
                match chunks.next().await {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                            let raw: Vec<u8> = buf.drain(..=pos).collect();
                            ready.push_back(decode_line(&raw));
                        }
                    }
                    Some(Err(e)) => {
                        done = true;
                        return Some((Err(e), (chunks, buf, ready, done)));
                    }
                    None => {
                        done = true;
                        if !buf.is_empty() {
                            let raw = std::mem::take(&mut buf);
                            ready.push_back(decode_line(&raw));
                        }
                    }
                }
            }
        }
    });
    Box::pin(lines)
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

/// Parse a runtime timestamp, treating Docker's zero time as absent.
pub fn parse_started_at(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if raw.starts_with("0001-01-01") {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Container name as the runtime reports it, without the leading `/`.
pub fn normalize_name(name: &str) -> String {
    name.trim_start_matches('/').to_string()
}

/// Parse `KEY=value` environment entries into a map (first entry wins).
pub fn env_map(env: &[String]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for entry in env {
        if let Some((k, v)) = entry.split_once('=') {
            map.entry(k.to_string()).or_insert_with(|| v.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static str]) -> ChunkStream {
        let items: Vec<Result<Bytes, ContainerError>> = parts
            .iter()
            .map(|p| Ok(Bytes::from_static(p.as_bytes())))
            .collect();
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn test_lines_reassembled_across_chunks() {
        let lines: Vec<String> = lines_from_chunks(chunks(&["hel", "lo\nwor", "ld\r\n", "tail"]))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["hello", "world", "tail"]);
    }

    #[tokio::test]
    async fn test_lines_empty_stream() {
        let lines: Vec<_> = lines_from_chunks(chunks(&[])).collect().await;
        assert!(lines.is_empty());
    }

    #[test]
    fn test_getenv_first_entry_wins() {
        let snap = ContainerSnapshot {
            id: "abc".to_string(),
            name: "testnet_lndbtc_1".to_string(),
            state: LifecycleState::Running,
            env: vec![
                "NETWORK=testnet".to_string(),
                "RPCHOST=bitcoind".to_string(),
                "RPCHOST=other".to_string(),
                "EMPTY=".to_string(),
            ],
            started_at: None,
        };
        assert_eq!(snap.getenv("RPCHOST"), Some("bitcoind"));
        assert_eq!(snap.getenv("EMPTY"), Some(""));
        assert_eq!(snap.getenv("RPC"), None);
        assert_eq!(env_map(&snap.env).get("RPCHOST").map(String::as_str), Some("bitcoind"));
    }

    #[test]
    fn test_log_since_parse() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(LogSince::parse("", now).unwrap(), LogSince::Beginning);
        assert_eq!(
            LogSince::parse("1h", now).unwrap().as_unix(),
            now.timestamp() - 3600
        );
        assert_eq!(
            LogSince::parse("10m", now).unwrap().as_unix(),
            now.timestamp() - 600
        );
        assert_eq!(LogSince::parse("1714564800", now).unwrap().as_unix(), 1714564800);
        assert!(LogSince::parse("10y", now).is_err());
        assert!(LogSince::parse("abc", now).is_err());
    }

    #[test]
    fn test_log_tail_parse() {
        assert_eq!(LogTail::parse("all").unwrap(), LogTail::All);
        assert_eq!(LogTail::parse("200").unwrap(), LogTail::Lines(200));
        assert!(LogTail::parse("-3").is_err());
        assert_eq!(LogTail::Lines(5).as_docker_arg(), "5");
    }

    #[test]
    fn test_started_at_zero_time_is_none() {
        assert!(parse_started_at(Some("0001-01-01T00:00:00Z")).is_none());
        assert!(parse_started_at(Some("2024-05-01T12:00:00.123456789Z")).is_some());
        assert!(parse_started_at(None).is_none());
    }

    #[test]
    fn test_state_parse_and_display() {
        assert_eq!("running".parse::<LifecycleState>().unwrap(), LifecycleState::Running);
        assert_eq!("removing".parse::<LifecycleState>().unwrap(), LifecycleState::Unknown);
        assert_eq!(LifecycleState::Exited.to_string(), "exited");
    }
}
