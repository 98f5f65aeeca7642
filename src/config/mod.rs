//! Configuration.
//!
//! A TOML file lists the services; environment variables (optionally from a
//! `.env` file loaded by the binary) override the tunables in `[settings]`.
//!
//! ```toml
//! network = "testnet"
//!
//! [settings]
//! status_timeout_secs = 10
//!
//! [[services]]
//! name = "lndbtc"
//! kind = "lnd"
//! [services.rpc]
//! tls_cert = "/root/.lndbtc/tls.cert"
//! macaroon = "/root/.lndbtc/data/chain/bitcoin/testnet/readonly.macaroon"
//!
//! [[services]]
//! name = "bitcoind"
//! kind = "bitcoind"
//! depends_on = ["lndbtc"]
//! [services.mode_probe]
//! peer = "lndbtc"
//! env = "BITCOIND_HOST"
//! light_endpoints = ["neutrino"]
//! ```

mod helpers;
mod services;
mod settings;

use std::path::{Path, PathBuf};

use serde::Deserialize;

pub use services::{ModeProbeEntry, RpcEntry, ServiceEntry, default_container_name};
pub use settings::{FileSettings, Settings};

use crate::error::ConfigError;
use crate::registry::dependency_order;
use crate::service::{ServiceDescriptor, ServiceOptions};

/// Config file used when `DOCKWATCH_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "dockwatch.toml";

const DEFAULT_NETWORK: &str = "testnet";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    network: Option<String>,
    #[serde(default)]
    settings: FileSettings,
    #[serde(default)]
    services: Vec<ServiceEntry>,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub network: String,
    /// Where the service list was read from.
    pub path: PathBuf,
    pub settings: Settings,
    /// Validated services, in dependency order.
    pub services: Vec<ServiceDescriptor>,
}

impl Config {
    /// Load from `DOCKWATCH_CONFIG` (or [`DEFAULT_CONFIG_PATH`]) and the
    /// process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = match helpers::optional_env("DOCKWATCH_CONFIG")? {
            Some(path) => PathBuf::from(path),
            None => {
                let path = PathBuf::from(DEFAULT_CONFIG_PATH);
                if !path.exists() {
                    return Err(ConfigError::MissingRequired {
                        key: "DOCKWATCH_CONFIG".to_string(),
                        hint: format!(
                            "Set it to a service list, or create ./{DEFAULT_CONFIG_PATH}"
                        ),
                    });
                }
                path
            }
        };
        Self::load(&path)
    }

    /// Load a specific file, with environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path, &helpers::optional_env)
    }

    /// Parse file contents. `env` looks up override variables.
    pub fn parse(
        text: &str,
        path: &Path,
        env: &dyn Fn(&str) -> Result<Option<String>, ConfigError>,
    ) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let network = env("DOCKWATCH_NETWORK")?
            .or(file.network)
            .unwrap_or_else(|| DEFAULT_NETWORK.to_string());
        if network.trim().is_empty() || network.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                key: "network".to_string(),
                message: format!("'{network}' is not a network name"),
            });
        }

        let settings = Settings::resolve(&file.settings, &network, env)?;

        let descriptors = file
            .services
            .into_iter()
            .map(|entry| entry.into_descriptor(&network))
            .collect::<Result<Vec<_>, _>>()?;
        let services = dependency_order(descriptors)?;

        tracing::debug!(
            path = %path.display(),
            network = %network,
            services = services.len(),
            "Configuration loaded"
        );

        Ok(Self {
            network,
            path: path.to_path_buf(),
            settings,
            services,
        })
    }

    /// Options every service is built with.
    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            network: self.network.clone(),
            retry: self.settings.retry_policy(),
            call_timeout: self.settings.rpc_call_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Result<Option<String>, ConfigError> {
        Ok(None)
    }

    #[test]
    fn test_parse_orders_and_names() {
        let text = r#"
            network = "simnet"

            [[services]]
            name = "bitcoind"
            kind = "bitcoind"
            [services.mode_probe]
            peer = "lndbtc"
            env = "BITCOIND_HOST"

            [[services]]
            name = "lndbtc"
            kind = "lnd"
            [services.rpc]
            tls_cert = "/root/.lndbtc/tls.cert"
            macaroon = "/root/.lndbtc/admin.macaroon"
        "#;
        let config = Config::parse(text, Path::new("dockwatch.toml"), &no_env).unwrap();
        assert_eq!(config.network, "simnet");
        let names: Vec<_> = config.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["lndbtc", "bitcoind"]);
        assert_eq!(config.services[1].container, "simnet_bitcoind_1");
        assert_eq!(config.service_options().network, "simnet");
    }

    #[test]
    fn test_network_override() {
        let env = |key: &str| -> Result<Option<String>, ConfigError> {
            Ok((key == "DOCKWATCH_NETWORK").then(|| "mainnet".to_string()))
        };
        let config = Config::parse("network = \"testnet\"", Path::new("x.toml"), &env).unwrap();
        assert_eq!(config.network, "mainnet");
        assert_eq!(
            config.settings.setup_log,
            PathBuf::from("/root/network/logs/mainnet.log")
        );
    }

    #[test]
    fn test_parse_errors() {
        let err = Config::parse("services = 3", Path::new("bad.toml"), &no_env).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));

        let cycle = r#"
            [[services]]
            name = "a"
            kind = "generic"
            depends_on = ["b"]
            [[services]]
            name = "b"
            kind = "generic"
            depends_on = ["a"]
        "#;
        let err = Config::parse(cycle, Path::new("x.toml"), &no_env).unwrap_err();
        assert!(matches!(err, ConfigError::DependencyCycle(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/dockwatch.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
