//! Status strings and the transient-error classification table.

use serde::Serialize;

use crate::container::LifecycleState;

pub const READY: &str = "Ready";
pub const STARTING: &str = "Starting...";
pub const WALLET_LOCKED: &str = "Wallet locked. Unlock with xucli unlock.";
pub const DISABLED: &str = "Disabled";
pub const CONTAINER_MISSING: &str = "Container missing";
pub const READY_EXTERNAL: &str = "Ready (connected to external)";
pub const READY_LIGHT: &str = "Ready (light mode)";
pub const WAITING_FOR_CHANNELS: &str = "Waiting for channels";

/// Marker a component puts in its status while it has no open channels.
const NO_ACTIVE_CHANNELS: &str = "has no active channels";

/// A derived status: display text plus optional structured detail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl StatusReport {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            detail: None,
        }
    }

    pub fn ready() -> Self {
        Self::new(READY)
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn is_ready(&self) -> bool {
        self.text == READY
    }
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Backend conditions recognised from error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCondition {
    WalletLocked,
    Starting,
}

impl BackendCondition {
    pub fn text(&self) -> &'static str {
        match self {
            BackendCondition::WalletLocked => WALLET_LOCKED,
            BackendCondition::Starting => STARTING,
        }
    }
}

/// Error substrings that mean "transient, show guidance instead of failing".
/// Checked in order; the first match wins.
pub const TRANSIENT_ERRORS: &[(&str, BackendCondition)] = &[
    ("Wallet is encrypted", BackendCondition::WalletLocked),
    ("wallet locked", BackendCondition::WalletLocked),
    ("xud is locked", BackendCondition::WalletLocked),
    (
        "no such file or directory, open '/root/.xud/tls.cert'",
        BackendCondition::Starting,
    ),
    ("xud is starting", BackendCondition::Starting),
];

/// Look an error message up in [`TRANSIENT_ERRORS`].
pub fn classify(message: &str) -> Option<BackendCondition> {
    TRANSIENT_ERRORS
        .iter()
        .find(|(needle, _)| message.contains(needle))
        .map(|(_, condition)| *condition)
}

/// Text for a container that is not running.
pub fn container_state_text(state: LifecycleState, disabled: bool, native: bool) -> String {
    match state {
        LifecycleState::Missing if disabled && native => DISABLED.to_string(),
        LifecycleState::Missing => CONTAINER_MISSING.to_string(),
        other => format!("Container {}", other),
    }
}

/// Text while the backend is not reachable yet.
pub fn waiting_for(service: &str) -> String {
    format!("Waiting for {} to come up...", service)
}

/// Fold component statuses into one.
///
/// All ready gives "Ready"; any component without channels gives
/// "Waiting for channels"; otherwise the non-ready names are listed in
/// order.
pub fn composite_status(components: &[(&str, &str)]) -> String {
    if components.iter().all(|(_, status)| *status == READY) {
        return READY.to_string();
    }
    if components
        .iter()
        .any(|(_, status)| status.contains(NO_ACTIVE_CHANNELS))
    {
        return WAITING_FOR_CHANNELS.to_string();
    }
    let waiting: Vec<&str> = components
        .iter()
        .filter(|(_, status)| *status != READY)
        .map(|(name, _)| *name)
        .collect();
    format!("Waiting for {}", waiting.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        assert_eq!(
            classify("rpc error: code = Unknown desc = xud is locked"),
            Some(BackendCondition::WalletLocked)
        );
        assert_eq!(
            classify("wallet locked, unlock it to enable full RPC access"),
            Some(BackendCondition::WalletLocked)
        );
        assert_eq!(
            classify("Error: ENOENT: no such file or directory, open '/root/.xud/tls.cert'"),
            Some(BackendCondition::Starting)
        );
        assert_eq!(classify("xud is starting"), Some(BackendCondition::Starting));
        assert_eq!(classify("connection refused"), None);
        assert_eq!(BackendCondition::Starting.text(), "Starting...");
    }

    #[test]
    fn test_composite() {
        assert_eq!(
            composite_status(&[("lndbtc", READY), ("lndltc", READY), ("connext", READY)]),
            "Ready"
        );
        assert_eq!(
            composite_status(&[("lndbtc", READY), ("lndltc", "Syncing"), ("connext", READY)]),
            "Waiting for lndltc"
        );
        assert_eq!(
            composite_status(&[("lndbtc", ""), ("lndltc", "Syncing"), ("connext", READY)]),
            "Waiting for lndbtc, lndltc"
        );
        assert_eq!(
            composite_status(&[
                ("lndbtc", "lndbtc has no active channels"),
                ("lndltc", "Syncing"),
                ("connext", READY),
            ]),
            "Waiting for channels"
        );
    }

    #[test]
    fn test_container_state_text() {
        assert_eq!(container_state_text(LifecycleState::Missing, true, true), "Disabled");
        assert_eq!(
            container_state_text(LifecycleState::Missing, true, false),
            "Container missing"
        );
        assert_eq!(
            container_state_text(LifecycleState::Missing, false, true),
            "Container missing"
        );
        assert_eq!(
            container_state_text(LifecycleState::Exited, false, true),
            "Container exited"
        );
        assert_eq!(waiting_for("bitcoind"), "Waiting for bitcoind to come up...");
    }
}
