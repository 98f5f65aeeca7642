//! xud control via `xucli` executed inside the xud container.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::container::ContainerHandle;
use crate::error::RpcError;
use crate::rpc::Dialer;

/// Dialer that "connects" by checking for xud's TLS certificate.
///
/// xucli refuses to talk to xud until the certificate exists, so the
/// certificate stands in for credentials.
#[derive(Debug, Clone)]
pub struct XudDialer {
    container: ContainerHandle,
    cli: String,
    tls_cert: Option<PathBuf>,
}

impl XudDialer {
    pub fn new(container: ContainerHandle, cli: impl Into<String>, tls_cert: Option<PathBuf>) -> Self {
        Self {
            container,
            cli: cli.into(),
            tls_cert,
        }
    }
}

#[async_trait]
impl Dialer for XudDialer {
    type Client = XucliClient;
    type Credentials = ();

    fn endpoint(&self) -> String {
        format!("{} ({})", self.cli, self.container.name())
    }

    async fn load_credentials(&self) -> Result<(), RpcError> {
        let Some(cert) = &self.tls_cert else {
            return Ok(());
        };
        match tokio::fs::try_exists(cert).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(RpcError::CredentialsUnavailable {
                reason: format!("{} does not exist yet", cert.display()),
            }),
            Err(e) => Err(RpcError::CredentialsUnavailable {
                reason: format!("{}: {}", cert.display(), e),
            }),
        }
    }

    async fn dial(&self, _credentials: ()) -> Result<XucliClient, RpcError> {
        Ok(XucliClient {
            container: self.container.clone(),
            cli: self.cli.clone(),
        })
    }
}

/// Runs `xucli` commands in the xud container.
#[derive(Debug, Clone)]
pub struct XucliClient {
    container: ContainerHandle,
    cli: String,
}

/// Status of one xud subsystem as reported by `getinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XudInfo {
    pub version: Option<String>,
    /// lnd status per currency (`BTC`, `LTC`, ...).
    pub lnd: BTreeMap<String, String>,
    pub connext: Option<String>,
}

impl XudInfo {
    pub fn lnd_status(&self, currency: &str) -> Option<&str> {
        self.lnd.get(currency).map(String::as_str)
    }
}

impl XucliClient {
    /// `xucli getinfo -j`. A non-zero exit is [`RpcError::Backend`] with
    /// xucli's output as the message.
    pub async fn get_info(&self) -> Result<XudInfo, RpcError> {
        let cmd = vec![self.cli.clone(), "getinfo".to_string(), "-j".to_string()];
        let out = self
            .container
            .exec(&cmd)
            .await
            .map_err(|e| RpcError::ConnectFailed {
                endpoint: self.container.name().to_string(),
                reason: e.to_string(),
            })?;

        if !out.success() {
            return Err(RpcError::Backend {
                code: Some(out.exit_code),
                message: out.output.trim().to_string(),
            });
        }
        parse_info(self.container.name(), &out.output)
    }
}

fn parse_info(endpoint: &str, output: &str) -> Result<XudInfo, RpcError> {
    let value: Value = serde_json::from_str(output.trim()).map_err(|e| RpcError::InvalidResponse {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;

    let status_of = |v: &Value| {
        v.get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let mut lnd = BTreeMap::new();
    if let Some(map) = value.get("lnd").and_then(Value::as_object) {
        for (currency, info) in map {
            lnd.insert(currency.clone(), status_of(info));
        }
    } else if let Some(pairs) = value.get("lndMap").and_then(Value::as_array) {
        // Older xucli prints the map as [currency, info] pairs.
        for pair in pairs {
            if let (Some(currency), Some(info)) = (pair.get(0).and_then(Value::as_str), pair.get(1)) {
                lnd.insert(currency.to_string(), status_of(info));
            }
        }
    }

    Ok(XudInfo {
        version: value.get("version").and_then(Value::as_str).map(str::to_string),
        lnd,
        connext: value.get("connext").map(status_of),
    })
}
