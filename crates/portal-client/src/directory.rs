//! Relay directory
//!
//! Maps relay names to their bootstrap URLs. Built once at startup and
//! shared read-only by every session.

use std::collections::{HashMap, HashSet};

use crate::config::RelayConfig;
use crate::error::DirectoryError;

#[derive(Debug, Clone, Default)]
pub struct RelayDirectory {
    entries: HashMap<String, RelayConfig>,
}

impl RelayDirectory {
    pub fn new(relays: impl IntoIterator<Item = RelayConfig>) -> Self {
        let entries = relays
            .into_iter()
            .map(|relay| (relay.name.trim().to_string(), relay))
            .collect();
        Self { entries }
    }

    /// Resolve a relay preference list into bootstrap URLs
    ///
    /// Preference order is kept across relays and within each relay, and
    /// duplicate URLs are dropped after their first occurrence. Unknown and
    /// blank relay names are skipped.
    pub fn resolve(&self, preferences: &[String]) -> Result<Vec<String>, DirectoryError> {
        if preferences.is_empty() {
            return Err(DirectoryError::EmptyPreference);
        }

        let mut seen = HashSet::new();
        let mut servers = Vec::new();

        for name in preferences {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Some(relay) = self.entries.get(name) else {
                continue;
            };
            for url in &relay.urls {
                let url = url.trim();
                if url.is_empty() || !seen.insert(url) {
                    continue;
                }
                servers.push(url.to_string());
            }
        }

        if servers.is_empty() {
            return Err(DirectoryError::NoBootstrapServers {
                preferences: preferences.to_vec(),
            });
        }

        Ok(servers)
    }
}
