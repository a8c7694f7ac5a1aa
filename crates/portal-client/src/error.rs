use portal_transport::TransportError;
use thiserror::Error;

/// Relay preference resolution failures
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("relayPreference must contain at least one relay name")]
    EmptyPreference,

    #[error("no bootstrap servers resolved for relayPreference {preferences:?}")]
    NoBootstrapServers { preferences: Vec<String> },
}

/// Failures of a single proxied connection
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to connect to local target {address}: {source}")]
    LocalConnect {
        address: String,
        source: std::io::Error,
    },

    #[error("IO error during proxying: {0}")]
    Io(#[from] std::io::Error),
}

/// Session-fatal errors, surfaced to the supervisor
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("service {service}: resolve relays: {source}")]
    Resolve {
        service: String,
        source: DirectoryError,
    },

    #[error("service {service}: connect to relay: {source}")]
    Connect {
        service: String,
        source: TransportError,
    },

    #[error("service {service}: register listener: {source}")]
    Register {
        service: String,
        source: TransportError,
    },

    #[error("service {service}: session task panicked")]
    SessionPanicked { service: String },
}

impl TunnelError {
    /// Name of the service whose session failed
    pub fn service(&self) -> &str {
        match self {
            TunnelError::Resolve { service, .. }
            | TunnelError::Connect { service, .. }
            | TunnelError::Register { service, .. }
            | TunnelError::SessionPanicked { service } => service,
        }
    }
}

/// Configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config:\n - {}", .0.join("\n - "))]
    Invalid(Vec<String>),
}
