//! Credentials and lease identifiers

use std::fmt;
use uuid::Uuid;

/// Opaque lease identifier issued for a credential
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lease(String);

impl Lease {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `len` characters of the lease id
    pub fn prefix(&self, len: usize) -> &str {
        match self.0.char_indices().nth(len) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credential identifying one tunnel instance to the relays
#[derive(Debug, Clone)]
pub struct Credential {
    lease: Lease,
}

impl Credential {
    /// Issue a fresh credential with a globally unique lease id
    pub fn issue() -> Self {
        Self {
            lease: Lease(Uuid::new_v4().simple().to_string()),
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }
}
