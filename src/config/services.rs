use std::collections::BTreeMap;
use std::path::PathBuf;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::service::factory::validate_rpc;
use crate::service::mode::default_light_endpoints;
use crate::service::{Mode, ModeProbe, RpcSettings, ServiceDescriptor, ServiceKind};

/// One `[[services]]` entry as written.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEntry {
    pub name: String,
    pub kind: ServiceKind,
    /// Defaults to `<network>_<name>_1`.
    pub container: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub rpc: RpcEntry,
    pub mode_probe: Option<ModeProbeEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcEntry {
    /// Defaults to the service name.
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    pub tls_cert: Option<PathBuf>,
    pub macaroon: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cookie_file: Option<PathBuf>,
    pub cli: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeProbeEntry {
    pub peer: String,
    pub env: String,
    /// Defaults to the service name.
    pub native_host: Option<String>,
    /// Defaults to the built-in provider list for geth, empty otherwise.
    pub light_endpoints: Option<Vec<String>>,
}

/// Container name used when an entry does not give one.
pub fn default_container_name(network: &str, service: &str) -> String {
    format!("{network}_{service}_1")
}

impl ServiceEntry {
    pub(crate) fn into_descriptor(self, network: &str) -> Result<ServiceDescriptor, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidService {
                service: self.name,
                message: "name must not be empty".to_string(),
            });
        }

        let container = self
            .container
            .unwrap_or_else(|| default_container_name(network, &self.name));
        let rpc = RpcSettings {
            host: self.rpc.host.unwrap_or_else(|| self.name.clone()),
            port: self.rpc.port,
            ports: self.rpc.ports,
            tls_cert: self.rpc.tls_cert,
            macaroon: self.rpc.macaroon,
            username: self.rpc.username,
            password: self.rpc.password.map(SecretString::from),
            cookie_file: self.rpc.cookie_file,
            cli: self.rpc.cli,
        };
        let kind = self.kind;
        let mode_probe = self.mode_probe.map(|p| ModeProbe {
            peer: p.peer,
            env: p.env,
            native_host: p.native_host.unwrap_or_else(|| self.name.clone()),
            light_endpoints: p.light_endpoints.unwrap_or_else(|| match kind {
                ServiceKind::Geth => default_light_endpoints(network),
                _ => Vec::new(),
            }),
        });

        let descriptor = ServiceDescriptor {
            name: self.name,
            container,
            kind,
            disabled: self.disabled,
            mode: self.mode,
            depends_on: self.depends_on,
            rpc,
            mode_probe,
        };
        validate_rpc(&descriptor)?;
        Ok(descriptor)
    }
}
