//! Relay transport abstraction layer
//!
//! Defines the contract the tunnel client uses to talk to relay servers:
//! a [`RelayConnector`] opens a [`RelayClient`] against a list of bootstrap
//! servers, the client registers a [`RelayListener`] for a lease, and the
//! listener hands out [`RelayConnection`]s for every inbound relay stream.
//!
//! The relay wire protocol lives behind these traits. [`memory::MemoryRelay`]
//! implements the whole contract in-process.

pub mod accept;
pub mod credential;
pub mod memory;

pub use accept::{AcceptQueue, AcceptSender};
pub use credential::{Credential, Lease};

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Accept error: {0}")]
    AcceptError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream carried over a relay
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// An inbound connection accepted from a relay
pub struct RelayConnection {
    stream: Box<dyn RelayStream>,
    peer: String,
}

impl RelayConnection {
    pub fn new<S: RelayStream>(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
        }
    }

    /// Label describing where the connection came from (for logs)
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn into_stream(self) -> Box<dyn RelayStream> {
        self.stream
    }
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("peer", &self.peer)
            .finish()
    }
}

/// Opens relay-facing client sessions
#[async_trait]
pub trait RelayConnector: Send + Sync + 'static {
    type Client: RelayClient;

    /// Connect to the relays at `bootstrap_servers`, in the given order
    async fn connect(&self, bootstrap_servers: &[String]) -> TransportResult<Self::Client>;
}

/// A connected relay client session
#[async_trait]
pub trait RelayClient: Send + Sync + 'static {
    type Listener: RelayListener;

    /// Register `name` for `credential` and start receiving connections
    async fn listen(
        &self,
        credential: &Credential,
        name: &str,
        protocols: &[String],
    ) -> TransportResult<Self::Listener>;

    /// Release the client session. Safe to call more than once.
    async fn close(&self);
}

/// Source of inbound relay connections for one registered service
#[async_trait]
pub trait RelayListener: Send + Sync + 'static {
    /// Wait for the next relay connection
    async fn accept(&self) -> TransportResult<RelayConnection>;

    /// Stop listening. Idempotent; a pending `accept` fails with
    /// [`TransportError::ListenerClosed`].
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors() {
        let err = TransportError::ConnectionError("test".to_string());
        assert!(err.to_string().contains("Connection error"));

        let err = TransportError::ListenerClosed;
        assert!(err.to_string().contains("Listener closed"));

        let err = TransportError::RegistrationRejected("name taken".to_string());
        assert!(err.to_string().contains("name taken"));
    }

    #[tokio::test]
    async fn test_relay_connection_peer() {
        let (a, _b) = tokio::io::duplex(64);
        let conn = RelayConnection::new(a, "relay-1#7");
        assert_eq!(conn.peer(), "relay-1#7");
        assert!(format!("{:?}", conn).contains("relay-1#7"));
    }
}
