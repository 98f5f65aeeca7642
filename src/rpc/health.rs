//! Plain reachability probes for backends without a typed control API.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::RpcError;
use crate::rpc::Dialer;

/// HTTP health endpoint that answers `204 No Content` when healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthDialer {
    url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpHealthDialer {
    pub fn new(host: &str, port: u16, path: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: format!("http://{}:{}{}", host, port, path),
            http,
            timeout,
        }
    }
}

/// Client for an HTTP health endpoint.
#[derive(Debug, Clone)]
pub struct HttpHealthClient {
    url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpHealthClient {
    /// `Ok(true)` on 204, `Ok(false)` on any other status.
    pub async fn is_healthy(&self) -> Result<bool, RpcError> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout(self.timeout)
                } else {
                    RpcError::ConnectFailed {
                        endpoint: self.url.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;
        Ok(resp.status() == reqwest::StatusCode::NO_CONTENT)
    }
}

#[async_trait]
impl Dialer for HttpHealthDialer {
    type Client = HttpHealthClient;
    type Credentials = ();

    fn endpoint(&self) -> String {
        self.url.clone()
    }

    async fn load_credentials(&self) -> Result<(), RpcError> {
        Ok(())
    }

    async fn dial(&self, _credentials: ()) -> Result<HttpHealthClient, RpcError> {
        Ok(HttpHealthClient {
            url: self.url.clone(),
            http: self.http.clone(),
            timeout: self.timeout,
        })
    }
}

/// TCP reachability of one endpoint, e.g. one sub-chain of a multi-chain
/// backend.
#[derive(Debug, Clone)]
pub struct TcpProbeDialer {
    addr: String,
}

impl TcpProbeDialer {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
        }
    }
}

/// Client that re-checks reachability on every probe.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
}

impl TcpProbe {
    pub async fn check(&self) -> Result<(), RpcError> {
        connect(&self.addr).await
    }
}

async fn connect(addr: &str) -> Result<(), RpcError> {
    TcpStream::connect(addr)
        .await
        .map(|_| ())
        .map_err(|e| RpcError::ConnectFailed {
            endpoint: addr.to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl Dialer for TcpProbeDialer {
    type Client = TcpProbe;
    type Credentials = ();

    fn endpoint(&self) -> String {
        self.addr.clone()
    }

    async fn load_credentials(&self) -> Result<(), RpcError> {
        Ok(())
    }

    async fn dial(&self, _credentials: ()) -> Result<TcpProbe, RpcError> {
        connect(&self.addr).await?;
        Ok(TcpProbe {
            addr: self.addr.clone(),
        })
    }
}
