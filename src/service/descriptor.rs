//! Static description of one service, resolved from configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Backend kind. Selects the health probe and status rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Bitcoind,
    Litecoind,
    Geth,
    Lnd,
    Xud,
    Connext,
    Boltz,
    Arby,
    Webui,
    Proxy,
    Generic,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Bitcoind => "bitcoind",
            ServiceKind::Litecoind => "litecoind",
            ServiceKind::Geth => "geth",
            ServiceKind::Lnd => "lnd",
            ServiceKind::Xud => "xud",
            ServiceKind::Connext => "connext",
            ServiceKind::Boltz => "boltz",
            ServiceKind::Arby => "arby",
            ServiceKind::Webui => "webui",
            ServiceKind::Proxy => "proxy",
            ServiceKind::Generic => "generic",
        }
    }

    /// Kinds whose status comes from the container alone.
    pub fn is_container_only(&self) -> bool {
        matches!(
            self,
            ServiceKind::Arby | ServiceKind::Webui | ServiceKind::Proxy | ServiceKind::Generic
        )
    }

    /// Default control port, used when configuration gives none.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            ServiceKind::Bitcoind => Some(18332),
            ServiceKind::Litecoind => Some(19332),
            ServiceKind::Geth => Some(8545),
            ServiceKind::Lnd => Some(8080),
            ServiceKind::Connext => Some(5040),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bitcoind" => Ok(ServiceKind::Bitcoind),
            "litecoind" => Ok(ServiceKind::Litecoind),
            "geth" => Ok(ServiceKind::Geth),
            "lnd" => Ok(ServiceKind::Lnd),
            "xud" => Ok(ServiceKind::Xud),
            "connext" => Ok(ServiceKind::Connext),
            "boltz" => Ok(ServiceKind::Boltz),
            "arby" => Ok(ServiceKind::Arby),
            "webui" => Ok(ServiceKind::Webui),
            "proxy" => Ok(ServiceKind::Proxy),
            "generic" => Ok(ServiceKind::Generic),
            other => Err(format!("unknown service kind '{other}'")),
        }
    }
}

/// How a backend is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Runs in its own container.
    #[default]
    Native,
    /// An externally operated node is used instead.
    External,
    /// A light client or public provider is used instead.
    Light,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Native => "native",
            Mode::External => "external",
            Mode::Light => "light",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive a service's mode from a peer container's environment.
///
/// The peer's `env` value is compared against `native_host` (our own
/// container) and the `light_endpoints` allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeProbe {
    pub peer: String,
    pub env: String,
    pub native_host: String,
    #[serde(default)]
    pub light_endpoints: Vec<String>,
}

/// Control-plane settings. Which fields matter depends on the kind.
#[derive(Debug, Clone, Default)]
pub struct RpcSettings {
    pub host: String,
    pub port: Option<u16>,
    /// Per-sub-chain ports for multi-chain backends (`btc`, `ltc`).
    pub ports: BTreeMap<String, u16>,
    pub tls_cert: Option<PathBuf>,
    pub macaroon: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub cookie_file: Option<PathBuf>,
    /// CLI binary inside the container for exec-driven backends.
    pub cli: Option<String>,
}

/// One service. Immutable after the registry is built.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub container: String,
    pub kind: ServiceKind,
    pub disabled: bool,
    pub mode: Mode,
    pub depends_on: Vec<String>,
    pub rpc: RpcSettings,
    pub mode_probe: Option<ModeProbe>,
}

impl ServiceDescriptor {
    /// Minimal descriptor with defaults, mostly for tests.
    pub fn new(name: impl Into<String>, container: impl Into<String>, kind: ServiceKind) -> Self {
        let name = name.into();
        Self {
            rpc: RpcSettings {
                host: name.clone(),
                ..RpcSettings::default()
            },
            name,
            container: container.into(),
            kind,
            disabled: false,
            mode: Mode::Native,
            depends_on: Vec::new(),
            mode_probe: None,
        }
    }

    /// Every service this one needs to see: explicit dependencies plus the
    /// mode probe's peer.
    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .map(String::as_str)
            .chain(self.mode_probe.as_ref().map(|p| p.peer.as_str()))
    }
}

/// Serializable summary for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub container: String,
    pub kind: ServiceKind,
    pub disabled: bool,
    pub mode: Mode,
    pub depends_on: Vec<String>,
}

impl From<&ServiceDescriptor> for ServiceSummary {
    fn from(d: &ServiceDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            container: d.container.clone(),
            kind: d.kind,
            disabled: d.disabled,
            mode: d.mode,
            depends_on: d.depends_on.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [ServiceKind::Bitcoind, ServiceKind::Lnd, ServiceKind::Webui] {
            assert_eq!(kind.as_str().parse::<ServiceKind>().unwrap(), kind);
        }
        assert!("nope".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn test_peers_include_mode_probe() {
        let mut d = ServiceDescriptor::new("bitcoind", "testnet_bitcoind_1", ServiceKind::Bitcoind);
        d.depends_on = vec!["proxy".to_string()];
        d.mode_probe = Some(ModeProbe {
            peer: "lndbtc".to_string(),
            env: "BITCOIND_HOST".to_string(),
            native_host: "bitcoind".to_string(),
            light_endpoints: vec![],
        });
        assert_eq!(d.peers().collect::<Vec<_>>(), vec!["proxy", "lndbtc"]);
    }
}
