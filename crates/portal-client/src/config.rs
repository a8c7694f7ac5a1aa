//! Tunnel configuration
//!
//! The YAML file format:
//!
//! ```yaml
//! relays:
//!   - name: default
//!     urls: ["ws://localhost:4017/relay"]
//! services:
//!   - name: web
//!     target: 127.0.0.1:3000
//!     relayPreference: [default]
//!     protocols: ["http/1.1", "h2"]   # optional
//! ```
//!
//! Flag mode builds the same structure in memory with a single relay named
//! [`FLAG_RELAY_NAME`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use crate::directory::RelayDirectory;
use crate::error::ConfigError;

/// Protocols advertised when a service lists none
pub const DEFAULT_PROTOCOLS: &[&str] = &["http/1.1", "h2"];

/// Relay name used for relays given on the command line
pub const FLAG_RELAY_NAME: &str = "flags";

/// A named relay and its bootstrap URLs
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub urls: Vec<String>,
}

/// A local service exposed through the relays
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Public service name (generated from the lease when blank)
    #[serde(default)]
    pub name: String,

    /// Relay names to register with, most preferred first
    #[serde(default)]
    pub relay_preference: Vec<String>,

    /// Local `host:port` to proxy to
    #[serde(default)]
    pub target: String,

    #[serde(default)]
    pub protocols: Vec<String>,
}

impl ServiceConfig {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        relay_preference: Vec<String>,
    ) -> Self {
        let mut service = Self {
            name: name.into(),
            relay_preference,
            target: target.into(),
            protocols: Vec::new(),
        };
        service.apply_defaults();
        service
    }

    /// Name for logs and errors; falls back to the target while unnamed
    pub fn label(&self) -> String {
        let name = self.name.trim();
        if name.is_empty() {
            self.target.trim().to_string()
        } else {
            name.to_string()
        }
    }

    pub fn apply_defaults(&mut self) {
        if self.protocols.is_empty() {
            self.protocols = DEFAULT_PROTOCOLS.iter().map(|p| p.to_string()).collect();
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub relays: Vec<RelayConfig>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl TunnelConfig {
    /// Read, parse, default and validate the config file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config = Self::from_yaml(&content)?;
        debug!(
            path = %path.display(),
            relays = config.relays.len(),
            services = config.services.len(),
            "Loaded tunnel config"
        );
        Ok(config)
    }

    /// Parse, default and validate YAML content
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: TunnelConfig = serde_yaml::from_str(content)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Single-service config from command line flags
    ///
    /// `relays` is the raw comma-separated `--relay` value. A blank `name`
    /// is kept blank so the session generates one from its lease.
    pub fn from_flags(relays: &str, host: &str, port: u16, name: &str) -> Result<Self, ConfigError> {
        let urls = parse_relay_urls(relays);
        if urls.is_empty() {
            return Err(ConfigError::Invalid(vec![
                "--relay must include at least one non-empty URL when --config is not provided"
                    .to_string(),
            ]));
        }

        Ok(Self {
            relays: vec![RelayConfig {
                name: FLAG_RELAY_NAME.to_string(),
                urls,
            }],
            services: vec![ServiceConfig::new(
                name.trim(),
                join_host_port(host, port),
                vec![FLAG_RELAY_NAME.to_string()],
            )],
        })
    }

    pub fn apply_defaults(&mut self) {
        for service in &mut self.services {
            service.apply_defaults();
        }
    }

    /// Check the config, reporting every problem at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut relay_names = HashSet::new();

        if self.relays.is_empty() {
            errors.push("at least one relay must be defined".to_string());
        }
        for (i, relay) in self.relays.iter().enumerate() {
            let prefix = format!("relays[{}]", i);
            let name = relay.name.trim();
            if name.is_empty() {
                errors.push(format!("{}: name is required", prefix));
            } else if !relay_names.insert(name) {
                errors.push(format!("{}: duplicate relay name {:?}", prefix, name));
            }

            if relay.urls.is_empty() {
                errors.push(format!("{}: at least one url is required", prefix));
            }
            for (j, url) in relay.urls.iter().enumerate() {
                if url.trim().is_empty() {
                    errors.push(format!("{}.urls[{}]: url cannot be empty", prefix, j));
                }
            }
        }

        if self.services.is_empty() {
            errors.push("at least one service must be defined".to_string());
        }
        for (i, service) in self.services.iter().enumerate() {
            let prefix = format!("services[{}]", i);
            if service.name.trim().is_empty() {
                errors.push(format!("{}: name is required", prefix));
            }
            if service.target.trim().is_empty() {
                errors.push(format!("{}: target is required", prefix));
            }
            for (j, protocol) in service.protocols.iter().enumerate() {
                if protocol.trim().is_empty() {
                    errors.push(format!("{}.protocols[{}]: protocol cannot be empty", prefix, j));
                }
            }

            if service.relay_preference.is_empty() {
                errors.push(format!(
                    "{}: relayPreference must list at least one relay name",
                    prefix
                ));
            }
            for (j, relay) in service.relay_preference.iter().enumerate() {
                let relay = relay.trim();
                if relay.is_empty() {
                    errors.push(format!(
                        "{}.relayPreference[{}]: relay name cannot be empty",
                        prefix, j
                    ));
                } else if !relay_names.contains(relay) {
                    errors.push(format!(
                        "{}.relayPreference[{}]: relay {:?} is not defined",
                        prefix, j, relay
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Directory over the configured relays
    pub fn directory(&self) -> RelayDirectory {
        RelayDirectory::new(self.relays.iter().cloned())
    }
}

/// Split a comma-separated URL list, dropping blank entries
pub fn parse_relay_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join host and port into a dialable address, bracketing IPv6 hosts
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
