//! Tunnel client core
//!
//! Exposes local TCP services through one or more relays:
//!
//! - [`RelayDirectory`] turns a service's relay preference into bootstrap URLs
//! - [`TunnelSession`] owns one service from registration to drain
//! - [`proxy`] moves bytes between a relay connection and the local target
//! - [`TunnelSupervisor`] runs every configured session and reports the
//!   first fatal error
//!
//! The relay protocol itself sits behind the [`portal_transport`] traits.

pub mod config;
pub mod directory;
pub mod error;
pub mod proxy;
pub mod session;
pub mod supervisor;

pub use config::{RelayConfig, ServiceConfig, TunnelConfig, DEFAULT_PROTOCOLS};
pub use directory::RelayDirectory;
pub use error::{ConfigError, DirectoryError, ProxyError, TunnelError};
pub use proxy::ProxyStats;
pub use session::{SessionState, TunnelSession};
pub use supervisor::TunnelSupervisor;
