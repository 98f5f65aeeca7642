//! Follow a growing log file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::Stream;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Delay between attempts to open a file that does not exist yet.
pub const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How often a reader at end of file checks for new data.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

const LINE_BUFFER: usize = 256;

/// Follow `path` from its beginning, yielding complete lines.
///
/// Opening is retried until the file exists. A file that shrinks
/// (truncation) or is replaced (rotation) is reopened from the start. A
/// trailing line without a newline is held back until it is completed.
/// The stream ends when `cancel` fires or the receiver is dropped.
pub fn follow(path: impl Into<PathBuf>, cancel: CancellationToken) -> impl Stream<Item = String> + Send + Unpin {
    follow_from(path, 0, cancel)
}

/// Like [`follow`], but the first open starts reading at byte `offset`.
/// Reopens after truncation or rotation still start from the beginning.
pub fn follow_from(
    path: impl Into<PathBuf>,
    offset: u64,
    cancel: CancellationToken,
) -> impl Stream<Item = String> + Send + Unpin {
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    let path = path.into();
    tokio::spawn(async move {
        follow_loop(&path, offset, &tx, &cancel).await;
        tracing::debug!(path = %path.display(), "Stopped following file");
    });
    ReceiverStream::new(rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Identity {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
}

impl Identity {
    fn of(meta: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Self {
                dev: meta.dev(),
                ino: meta.ino(),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = meta;
            Self {}
        }
    }
}

async fn open_when_present(path: &Path, cancel: &CancellationToken) -> Option<(File, Identity)> {
    let mut warned = false;
    loop {
        match File::open(path).await {
            Ok(file) => match file.metadata().await {
                Ok(meta) => return Some((file, Identity::of(&meta))),
                Err(e) => tracing::warn!(path = %path.display(), "Failed to stat file: {}", e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !warned {
                    tracing::debug!(path = %path.display(), "Waiting for file to appear");
                    warned = true;
                }
            }
            Err(e) => tracing::warn!(path = %path.display(), "Failed to open file: {}", e),
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(OPEN_RETRY_DELAY) => {}
        }
    }
}

async fn follow_loop(path: &Path, mut offset: u64, tx: &mpsc::Sender<String>, cancel: &CancellationToken) {
    'reopen: loop {
        let Some((mut file, identity)) = open_when_present(path, cancel).await else {
            return;
        };
        let mut position: u64 = 0;
        if offset > 0 {
            let start = std::mem::take(&mut offset);
            // A shorter file is caught by the truncation check below.
            match file.seek(std::io::SeekFrom::Start(start)).await {
                Ok(at) => position = at,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Seek failed, reading from start: {}", e);
                    continue 'reopen;
                }
            }
        }
        let mut reader = BufReader::new(file);
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let mut chunk = Vec::new();
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                read = reader.read_until(b'\n', &mut chunk) => read,
            };

            match read {
                Ok(0) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                    match tokio::fs::metadata(path).await {
                        Ok(meta) if Identity::of(&meta) != identity => {
                            tracing::info!(path = %path.display(), "File replaced, reopening");
                            continue 'reopen;
                        }
                        Ok(meta) if meta.len() < position => {
                            tracing::info!(path = %path.display(), "File truncated, reopening");
                            continue 'reopen;
                        }
                        Ok(_) => {}
                        Err(_) => {
                            tracing::info!(path = %path.display(), "File removed, waiting for it to return");
                            continue 'reopen;
                        }
                    }
                }
                Ok(n) => {
                    position += n as u64;
                    pending.extend_from_slice(&chunk);
                    if pending.last() == Some(&b'\n') {
                        let line = decode(&pending);
                        pending.clear();
                        if tx.send(line).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Read failed, reopening: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(OPEN_RETRY_DELAY) => continue 'reopen,
                    }
                }
            }
        }
    }
}

fn decode(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim_end_matches(['\n', '\r']).to_string()
}
