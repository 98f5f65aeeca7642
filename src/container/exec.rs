//! Interactive exec sessions.

use std::pin::Pin;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::container::ExecAttach;
use crate::error::ContainerError;

/// Buffered output chunks per session before the copy task waits on the reader.
const OUTPUT_BUFFER: usize = 64;

/// A TTY exec with stdin attached.
///
/// Output is pumped by a background task into a bounded channel. The session
/// owns a cancellation token: cancelling it (explicitly, via [`close`], on
/// drop, or through the parent token it was derived from) stops the pump and
/// fails pending writes.
///
/// [`close`]: InteractiveSession::close
pub struct InteractiveSession {
    id: Uuid,
    exec_id: String,
    container: String,
    input: Pin<Box<dyn AsyncWrite + Send>>,
    output: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

impl InteractiveSession {
    /// Take ownership of attached exec streams and start pumping output.
    pub fn spawn(container: &str, attach: ExecAttach, cancel: CancellationToken) -> Self {
        let ExecAttach {
            id: exec_id,
            output: mut chunks,
            input,
        } = attach;
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);

        let token = cancel.clone();
        let name = container.to_string();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(container = %name, session = %id, "Interactive session cancelled");
                        break;
                    }
                    chunk = chunks.next() => match chunk {
                        Some(Ok(bytes)) => {
                            if tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(container = %name, session = %id, "Interactive output failed: {}", e);
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        tracing::debug!(container = %container, session = %id, exec_id = %exec_id, "Interactive session started");

        Self {
            id,
            exec_id,
            container: container.to_string(),
            input,
            output: rx,
            cancel,
            pump,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Runtime-assigned exec id.
    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    /// The session's cancellation token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Write to the exec's stdin.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ContainerError> {
        let container = self.container.clone();
        if self.cancel.is_cancelled() {
            return Err(ContainerError::Cancelled { name: container });
        }
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(ContainerError::Cancelled { name: container }),
            res = async {
                self.input.write_all(data).await?;
                self.input.flush().await
            } => res.map_err(|e| ContainerError::ExecFailed {
                name: container.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Next chunk of output, or `None` once the exec ended or the session
    /// was cancelled.
    pub async fn read(&mut self) -> Option<Bytes> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            chunk = self.output.recv() => chunk,
        }
    }

    /// Cancel the session and wait for the output pump to stop.
    pub async fn close(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.pump).await;
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::container::ChunkStream;

    fn attach(chunks: Vec<&'static str>) -> (ExecAttach, tokio::io::DuplexStream) {
        let items: Vec<Result<Bytes, ContainerError>> = chunks
            .into_iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        let output: ChunkStream = Box::pin(futures::stream::iter(items));
        let (client, server) = tokio::io::duplex(64);
        (
            ExecAttach {
                id: "exec-1".to_string(),
                output,
                input: Box::pin(client),
            },
            server,
        )
    }

    #[tokio::test]
    async fn test_session_pumps_output_and_forwards_input() {
        use tokio::io::AsyncReadExt;

        let (attach, mut server) = attach(vec!["$ ", "ok\n"]);
        let mut session = InteractiveSession::spawn("testnet_xud_1", attach, CancellationToken::new());
        assert_eq!(session.exec_id(), "exec-1");

        session.write(b"getinfo\n").await.unwrap();
        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"getinfo\n");

        assert_eq!(session.read().await.unwrap(), Bytes::from_static(b"$ "));
        assert_eq!(session.read().await.unwrap(), Bytes::from_static(b"ok\n"));
        assert!(session.read().await.is_none());
        session.close().await;
    }

    #[tokio::test]
    async fn test_cancelled_session_rejects_writes() {
        let parent = CancellationToken::new();
        let (attach, _server) = attach(vec![]);
        let mut session = InteractiveSession::spawn("testnet_xud_1", attach, parent.child_token());

        parent.cancel();
        assert!(session.is_cancelled());
        let err = session.write(b"x").await.unwrap_err();
        assert!(matches!(err, ContainerError::Cancelled { .. }));
        assert!(session.read().await.is_none());
    }
}
