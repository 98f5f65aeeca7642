//! lnd REST client (`GET /v1/getinfo`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::RpcError;
use crate::rpc::Dialer;

/// lnd certificates are always issued for `localhost`; the real address is
/// pinned through the resolver.
const TLS_HOSTNAME: &str = "localhost";

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

/// Dialer for one lnd instance.
#[derive(Debug, Clone)]
pub struct LndDialer {
    host: String,
    port: u16,
    tls_cert: PathBuf,
    macaroon: PathBuf,
    call_timeout: Duration,
}

impl LndDialer {
    pub fn new(host: &str, port: u16, tls_cert: PathBuf, macaroon: PathBuf, call_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            tls_cert,
            macaroon,
            call_timeout,
        }
    }
}

/// TLS root and hex-encoded macaroon.
pub struct LndCredentials {
    cert_pem: Vec<u8>,
    macaroon_hex: SecretString,
}

async fn read_credential(path: &Path) -> Result<Vec<u8>, RpcError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| RpcError::CredentialsUnavailable {
            reason: format!("{}: {}", path.display(), e),
        })
}

#[async_trait]
impl Dialer for LndDialer {
    type Client = LndClient;
    type Credentials = LndCredentials;

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn load_credentials(&self) -> Result<LndCredentials, RpcError> {
        let cert_pem = read_credential(&self.tls_cert).await?;
        let macaroon = read_credential(&self.macaroon).await?;
        Ok(LndCredentials {
            cert_pem,
            macaroon_hex: SecretString::from(hex::encode(macaroon)),
        })
    }

    async fn dial(&self, credentials: LndCredentials) -> Result<LndClient, RpcError> {
        let endpoint = self.endpoint();
        let addr: SocketAddr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| RpcError::ConnectFailed {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| RpcError::ConnectFailed {
                endpoint: endpoint.clone(),
                reason: "host did not resolve".to_string(),
            })?;

        tokio::net::TcpStream::connect(addr)
            .await
            .map_err(|e| RpcError::ConnectFailed {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        let cert = reqwest::Certificate::from_pem(&credentials.cert_pem).map_err(|e| {
            RpcError::CredentialsUnavailable {
                reason: format!("{}: {}", self.tls_cert.display(), e),
            }
        })?;
        let http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .resolve(TLS_HOSTNAME, addr)
            .timeout(self.call_timeout)
            .build()
            .map_err(|e| RpcError::ConnectFailed {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        Ok(LndClient {
            base_url: format!("https://{}:{}", TLS_HOSTNAME, self.port),
            endpoint,
            macaroon_hex: credentials.macaroon_hex,
            http,
            call_timeout: self.call_timeout,
        })
    }
}

/// Subset of lnd's `GetInfoResponse`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LndInfo {
    #[serde(default)]
    pub identity_pubkey: String,
    #[serde(default)]
    pub block_height: u64,
    #[serde(default)]
    pub synced_to_chain: bool,
    #[serde(default)]
    pub num_active_channels: u64,
}

#[derive(Debug, Deserialize)]
struct LndErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// A connected lnd REST client.
pub struct LndClient {
    base_url: String,
    endpoint: String,
    macaroon_hex: SecretString,
    http: reqwest::Client,
    call_timeout: Duration,
}

impl std::fmt::Debug for LndClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LndClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl LndClient {
    pub async fn get_info(&self) -> Result<LndInfo, RpcError> {
        let resp = self
            .http
            .get(format!("{}/v1/getinfo", self.base_url))
            .header(MACAROON_HEADER, self.macaroon_hex.expose_secret())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout(self.call_timeout)
                } else {
                    RpcError::ConnectFailed {
                        endpoint: self.endpoint.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout(self.call_timeout)
            } else {
                RpcError::InvalidResponse {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        if !status.is_success() {
            return Err(backend_error(status, &text));
        }
        serde_json::from_str(&text).map_err(|e| RpcError::InvalidResponse {
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        })
    }
}

fn backend_error(status: reqwest::StatusCode, text: &str) -> RpcError {
    match serde_json::from_str::<LndErrorBody>(text) {
        Ok(body) => RpcError::Backend {
            code: body.code,
            message: body
                .message
                .or(body.error)
                .unwrap_or_else(|| format!("HTTP {status}")),
        },
        Err(_) => RpcError::Backend {
            code: Some(i64::from(status.as_u16())),
            message: if text.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                text.trim().to_string()
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_locked_wallet_error_message() {
        let err = backend_error(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"code":2,"message":"wallet locked, unlock it to enable full RPC access","details":[]}"#,
        );
        assert_eq!(
            err.to_string(),
            "wallet locked, unlock it to enable full RPC access"
        );
    }

    #[test]
    fn test_plain_text_error() {
        let err = backend_error(reqwest::StatusCode::BAD_GATEWAY, "");
        assert!(matches!(err, RpcError::Backend { code: Some(502), .. }));
    }

    #[test]
    fn test_info_defaults() {
        let info: LndInfo = serde_json::from_str(r#"{"block_height":1000}"#).unwrap();
        assert_eq!(info.block_height, 1000);
        assert!(!info.synced_to_chain);
    }

    fn plain_client(port: u16, call_timeout: Duration) -> LndClient {
        LndClient {
            base_url: format!("http://127.0.0.1:{port}"),
            endpoint: format!("127.0.0.1:{port}"),
            macaroon_hex: SecretString::from("abcd".to_string()),
            http: reqwest::Client::builder().timeout(call_timeout).build().unwrap(),
            call_timeout,
        }
    }

    #[tokio::test]
    async fn test_get_info_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_lowercase();
            assert!(request.contains("grpc-metadata-macaroon: abcd"), "{request}");
            let body = r#"{"block_height":2100,"synced_to_chain":true,"num_active_channels":3}"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(resp.as_bytes()).await.unwrap();
        });

        let info = plain_client(port, Duration::from_secs(3)).get_info().await.unwrap();
        assert_eq!(info.block_height, 2100);
        assert!(info.synced_to_chain);
        assert_eq!(info.num_active_channels, 3);
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let timeout = Duration::from_millis(200);
        let err = plain_client(port, timeout).get_info().await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout(t) if t == timeout), "{err:?}");
        assert!(!err.is_unreachable());
    }

    #[tokio::test]
    async fn test_missing_macaroon_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tls.cert"), b"pem").unwrap();
        let dialer = LndDialer::new(
            "127.0.0.1",
            8080,
            dir.path().join("tls.cert"),
            dir.path().join("admin.macaroon"),
            Duration::from_secs(3),
        );
        let err = dialer.load_credentials().await.err().unwrap();
        assert!(matches!(err, RpcError::CredentialsUnavailable { .. }));

        std::fs::write(dir.path().join("admin.macaroon"), [0xab, 0xcd]).unwrap();
        let creds = dialer.load_credentials().await.unwrap();
        assert_eq!(creds.macaroon_hex.expose_secret(), "abcd");
    }
}
