//! JSON-RPC over HTTP (bitcoind, litecoind, geth).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::net::TcpStream;

use crate::error::RpcError;
use crate::rpc::Dialer;

/// Where JSON-RPC credentials come from.
#[derive(Debug, Clone)]
pub enum JsonRpcAuth {
    /// No authentication (geth).
    None,
    /// Static user and password from configuration.
    Basic {
        username: String,
        password: SecretString,
    },
    /// A `user:password` cookie file written by the daemon at startup.
    CookieFile(PathBuf),
}

/// Dialer for a JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct JsonRpcDialer {
    host: String,
    port: u16,
    auth: JsonRpcAuth,
    call_timeout: Duration,
    http: reqwest::Client,
}

impl JsonRpcDialer {
    pub fn new(host: &str, port: u16, auth: JsonRpcAuth, call_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            host: host.to_string(),
            port,
            auth,
            call_timeout,
            http,
        }
    }

    fn url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }
}

#[async_trait]
impl Dialer for JsonRpcDialer {
    type Client = JsonRpcClient;
    type Credentials = Option<(String, SecretString)>;

    fn endpoint(&self) -> String {
        self.url()
    }

    async fn load_credentials(&self) -> Result<Self::Credentials, RpcError> {
        match &self.auth {
            JsonRpcAuth::None => Ok(None),
            JsonRpcAuth::Basic { username, password } => {
                if username.is_empty() || password.expose_secret().is_empty() {
                    return Err(RpcError::CredentialsUnavailable {
                        reason: "rpc username or password is empty".to_string(),
                    });
                }
                Ok(Some((username.clone(), password.clone())))
            }
            JsonRpcAuth::CookieFile(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    RpcError::CredentialsUnavailable {
                        reason: format!("{}: {}", path.display(), e),
                    }
                })?;
                parse_cookie(&raw).ok_or_else(|| RpcError::CredentialsUnavailable {
                    reason: format!("{}: malformed cookie", path.display()),
                })
            }
        }
    }

    async fn dial(&self, credentials: Self::Credentials) -> Result<JsonRpcClient, RpcError> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpStream::connect(&addr)
            .await
            .map_err(|e| RpcError::ConnectFailed {
                endpoint: addr.clone(),
                reason: e.to_string(),
            })?;

        Ok(JsonRpcClient {
            url: self.url(),
            credentials,
            call_timeout: self.call_timeout,
            http: self.http.clone(),
        })
    }
}

fn parse_cookie(raw: &str) -> Option<Option<(String, SecretString)>> {
    let (user, pass) = raw.trim().split_once(':')?;
    if user.is_empty() {
        return None;
    }
    Some(Some((user.to_string(), SecretString::from(pass.to_string()))))
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    code: Option<i64>,
    message: String,
}

/// A connected JSON-RPC client.
#[derive(Clone)]
pub struct JsonRpcClient {
    url: String,
    credentials: Option<(String, SecretString)>,
    call_timeout: Duration,
    http: reqwest::Client,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("url", &self.url)
            .field("authenticated", &self.credentials.is_some())
            .finish()
    }
}

impl JsonRpcClient {
    /// Call `method`. A backend error object becomes [`RpcError::Backend`]
    /// with the message verbatim.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "dockwatch",
            "method": method,
            "params": params,
        });

        let mut req = self.http.post(&self.url).json(&body);
        if let Some((user, pass)) = &self.credentials {
            req = req.basic_auth(user, Some(pass.expose_secret()));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout(self.call_timeout)
            } else {
                RpcError::ConnectFailed {
                    endpoint: self.url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RpcError::Backend {
                code: Some(i64::from(status.as_u16())),
                message: format!("HTTP {} from {}", status, self.url),
            });
        }

        // Daemons answer errors with a non-2xx status and a JSON body.
        let text = resp.text().await.map_err(|e| RpcError::InvalidResponse {
            endpoint: self.url.clone(),
            reason: e.to_string(),
        })?;
        decode_envelope(&self.url, &text)
    }
}

fn decode_envelope<T: DeserializeOwned>(endpoint: &str, text: &str) -> Result<T, RpcError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| RpcError::InvalidResponse {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    if let Some(err) = envelope.error {
        return Err(RpcError::Backend {
            code: err.code,
            message: err.message,
        });
    }
    serde_json::from_value(envelope.result).map_err(|e| RpcError::InvalidResponse {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })
}

/// Subset of `getblockchaininfo`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    pub headers: u64,
    #[serde(default)]
    pub initialblockdownload: bool,
}

impl JsonRpcClient {
    pub async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        self.call("getblockchaininfo", json!([])).await
    }

    /// `eth_syncing`: `None` when the node is not syncing.
    pub async fn eth_syncing(&self) -> Result<Option<EthSyncing>, RpcError> {
        let value: Value = self.call("eth_syncing", json!([])).await?;
        parse_eth_syncing(&self.url, value)
    }
}

/// Progress reported by `eth_syncing` while a sync is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthSyncing {
    pub current_block: u64,
    pub highest_block: u64,
}

fn parse_eth_syncing(endpoint: &str, value: Value) -> Result<Option<EthSyncing>, RpcError> {
    match value {
        Value::Bool(false) => Ok(None),
        Value::Object(map) => {
            let field = |name: &str| -> Result<u64, RpcError> {
                let raw = map.get(name).and_then(Value::as_str).unwrap_or("0x0");
                u64::from_str_radix(raw.trim_start_matches("0x"), 16).map_err(|e| {
                    RpcError::InvalidResponse {
                        endpoint: endpoint.to_string(),
                        reason: format!("{name}: {e}"),
                    }
                })
            };
            Ok(Some(EthSyncing {
                current_block: field("currentBlock")?,
                highest_block: field("highestBlock")?,
            }))
        }
        other => Err(RpcError::InvalidResponse {
            endpoint: endpoint.to_string(),
            reason: format!("unexpected eth_syncing result: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_kept_verbatim() {
        let text = r#"{"result":null,"error":{"code":-28,"message":"Loading block index..."},"id":"dockwatch"}"#;
        let err = decode_envelope::<BlockchainInfo>("http://bitcoind:18332/", text).unwrap_err();
        match err {
            RpcError::Backend { code, message } => {
                assert_eq!(code, Some(-28));
                assert_eq!(message, "Loading block index...");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_blockchain_info_decoded() {
        let text = r#"{"result":{"chain":"test","blocks":1000,"headers":2000,"initialblockdownload":true,"pruned":false},"error":null,"id":"dockwatch"}"#;
        let info: BlockchainInfo = decode_envelope("http://bitcoind:18332/", text).unwrap();
        assert_eq!(info.blocks, 1000);
        assert_eq!(info.headers, 2000);
    }

    #[test]
    fn test_garbage_is_invalid_response() {
        let err = decode_envelope::<Value>("http://geth:8545/", "<html>").unwrap_err();
        assert!(matches!(err, RpcError::InvalidResponse { .. }));
    }

    #[test]
    fn test_eth_syncing() {
        assert_eq!(parse_eth_syncing("geth", Value::Bool(false)).unwrap(), None);
        let syncing = parse_eth_syncing(
            "geth",
            json!({"currentBlock": "0x10", "highestBlock": "0x20", "startingBlock": "0x0"}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(syncing.current_block, 16);
        assert_eq!(syncing.highest_block, 32);
        assert!(parse_eth_syncing("geth", json!(1)).is_err());
    }

    #[test]
    fn test_cookie_parsing() {
        let creds = parse_cookie("__cookie__:abc123\n").unwrap().unwrap();
        assert_eq!(creds.0, "__cookie__");
        assert_eq!(creds.1.expose_secret(), "abc123");
        assert!(parse_cookie("nocolon").is_none());
    }

    #[tokio::test]
    async fn test_missing_cookie_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let dialer = JsonRpcDialer::new(
            "127.0.0.1",
            18332,
            JsonRpcAuth::CookieFile(dir.path().join(".cookie")),
            Duration::from_secs(3),
        );
        let err = dialer.load_credentials().await.unwrap_err();
        assert!(matches!(err, RpcError::CredentialsUnavailable { .. }));

        std::fs::write(dir.path().join(".cookie"), "__cookie__:secret").unwrap();
        assert!(dialer.load_credentials().await.unwrap().is_some());
    }
}
