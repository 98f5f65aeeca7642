use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::config::helpers::parse_value;
use crate::error::ConfigError;
use crate::rpc::RetryPolicy;

/// `[settings]` table as written in the config file. Every field is
/// optional; environment variables win over it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSettings {
    pub status_timeout_secs: Option<u64>,
    pub rpc_retry_delay_secs: Option<u64>,
    pub rpc_connect_timeout_secs: Option<u64>,
    pub rpc_call_timeout_secs: Option<u64>,
    pub rpc_max_attempts: Option<u32>,
    pub setup_log: Option<PathBuf>,
    pub setup_history: Option<usize>,
}

/// Runtime tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Per-query bound in `get_status`.
    pub status_timeout: Duration,
    pub rpc_retry_delay: Duration,
    pub rpc_connect_timeout: Duration,
    /// Bound on one health-probe call.
    pub rpc_call_timeout: Duration,
    /// `None` retries forever.
    pub rpc_max_attempts: Option<u32>,
    pub setup_log: PathBuf,
    /// Milestones kept for replay.
    pub setup_history: usize,
}

impl Settings {
    pub fn defaults(network: &str) -> Self {
        Self {
            status_timeout: Duration::from_secs(10),
            rpc_retry_delay: Duration::from_secs(3),
            rpc_connect_timeout: Duration::from_secs(3),
            rpc_call_timeout: Duration::from_secs(3),
            rpc_max_attempts: None,
            setup_log: PathBuf::from(format!("/root/network/logs/{network}.log")),
            setup_history: 1024,
        }
    }

    /// Layer environment over file over defaults. `env` looks a variable up.
    pub(crate) fn resolve(
        file: &FileSettings,
        network: &str,
        env: &dyn Fn(&str) -> Result<Option<String>, ConfigError>,
    ) -> Result<Self, ConfigError> {
        let defaults = Self::defaults(network);
        let secs = |key: &str, file_value: Option<u64>, default: Duration| -> Result<Duration, ConfigError> {
            let secs = parse_value(key, env(key)?, file_value.unwrap_or(default.as_secs()))?;
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be at least 1 second".to_string(),
                });
            }
            Ok(Duration::from_secs(secs))
        };

        let rpc_max_attempts = match env("DOCKWATCH_RPC_MAX_ATTEMPTS")? {
            Some(raw) => Some(parse_value("DOCKWATCH_RPC_MAX_ATTEMPTS", Some(raw), 0u32)?),
            None => file.rpc_max_attempts,
        };
        if rpc_max_attempts == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "DOCKWATCH_RPC_MAX_ATTEMPTS".to_string(),
                message: "must be positive; leave unset to retry forever".to_string(),
            });
        }

        Ok(Self {
            status_timeout: secs(
                "DOCKWATCH_STATUS_TIMEOUT_SECS",
                file.status_timeout_secs,
                defaults.status_timeout,
            )?,
            rpc_retry_delay: secs(
                "DOCKWATCH_RPC_RETRY_DELAY_SECS",
                file.rpc_retry_delay_secs,
                defaults.rpc_retry_delay,
            )?,
            rpc_connect_timeout: secs(
                "DOCKWATCH_RPC_CONNECT_TIMEOUT_SECS",
                file.rpc_connect_timeout_secs,
                defaults.rpc_connect_timeout,
            )?,
            rpc_call_timeout: secs(
                "DOCKWATCH_RPC_CALL_TIMEOUT_SECS",
                file.rpc_call_timeout_secs,
                defaults.rpc_call_timeout,
            )?,
            rpc_max_attempts,
            setup_log: env("DOCKWATCH_SETUP_LOG")?
                .map(PathBuf::from)
                .or_else(|| file.setup_log.clone())
                .unwrap_or(defaults.setup_log),
            setup_history: parse_value(
                "DOCKWATCH_SETUP_HISTORY",
                env("DOCKWATCH_SETUP_HISTORY")?,
                file.setup_history.unwrap_or(defaults.setup_history),
            )?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_delay: self.rpc_retry_delay,
            connect_timeout: self.rpc_connect_timeout,
            max_attempts: self.rpc_max_attempts,
        }
    }
}
