//! Error types for dockwatch.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("{0}")]
    Status(#[from] StatusError),

    #[error("Setup progress error: {0}")]
    Setup(#[from] SetupError),

    #[error("service not found: {name}")]
    ServiceNotFound { name: String },
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Service '{service}' is misconfigured: {message}")]
    InvalidService { service: String, message: String },

    #[error("Dependency cycle between services: {0}")]
    DependencyCycle(String),

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Container runtime errors.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime has no container with this name. Mapped to a status
    /// string by the service layer and never surfaced as a failure.
    #[error("No such container: {name}")]
    NotFound { name: String },

    #[error("Docker not available: {reason}")]
    DockerNotAvailable { reason: String },

    #[error("Container runtime error for '{name}': {reason}")]
    Runtime { name: String, reason: String },

    #[error("Exec in '{name}' failed: {reason}")]
    ExecFailed { name: String, reason: String },

    #[error("Operation on '{name}' was cancelled")]
    Cancelled { name: String },
}

impl ContainerError {
    /// Whether this is the distinguished "no such container" case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::NotFound { .. })
    }
}

/// Backend control-plane errors.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The dial loop has not published a client yet. Readers get this
    /// instead of blocking.
    #[error("no client yet")]
    NoClientYet,

    #[error("credentials unavailable: {reason}")]
    CredentialsUnavailable { reason: String },

    #[error("failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("RPC call timed out after {0:?}")]
    Timeout(Duration),

    /// Error text reported by the backend itself. Kept verbatim so the
    /// status layer can classify it.
    #[error("{message}")]
    Backend { code: Option<i64>, message: String },

    #[error("invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("giving up after {attempts} connection attempts")]
    PermanentlyFailed { attempts: u32 },

    #[error("RPC client closed")]
    Closed,
}

impl RpcError {
    /// Errors that mean "the backend is not reachable yet" rather than
    /// "the backend answered with a failure".
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            RpcError::NoClientYet
                | RpcError::ConnectFailed { .. }
                | RpcError::CredentialsUnavailable { .. }
        )
    }
}

/// Errors produced while deriving a service status.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("cannot resolve dependency '{peer}' of '{service}': {reason}")]
    Dependency {
        service: String,
        peer: String,
        reason: String,
    },

    #[error("status of '{service}' timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },
}

/// Setup progress broadcaster errors.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to read setup log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("setup progress broadcaster is shut down")]
    Closed,
}

/// Result type alias for dockwatch operations.
pub type Result<T> = std::result::Result<T, Error>;
