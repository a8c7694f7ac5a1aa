//! WebSocket relay transport using tokio-tungstenite
//!
//! Implements the relay client contract over one WebSocket per bootstrap
//! server (`ws://` or `wss://`).
//!
//! # Registration
//!
//! Text frames carry JSON control messages. The client sends
//! `{"type":"register","lease":..,"name":..,"protocols":[..]}` and the relay
//! answers `{"type":"registered"}` or `{"type":"error","message":..}`.
//!
//! # Stream Multiplexing
//!
//! Binary frames carry relay-initiated streams, each prefixed with:
//! - 4 bytes: stream ID (big-endian u32)
//! - 1 byte: message type (0=data, 1=fin)
//! - Rest: payload
//!
//! A data frame for an unknown stream ID opens a new stream.

mod connection;
mod frame;

pub use frame::ControlMessage;

use async_trait::async_trait;
use portal_transport::{
    AcceptQueue, Credential, RelayClient, RelayConnection, RelayConnector, RelayListener,
    TransportError, TransportResult,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::connection::RelaySocket;

const ACCEPT_BACKLOG: usize = 64;

/// Connects to relays over WebSocket
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    type Client = WebSocketClient;

    async fn connect(&self, bootstrap_servers: &[String]) -> TransportResult<Self::Client> {
        let mut sockets = Vec::with_capacity(bootstrap_servers.len());
        let mut failures = Vec::new();

        for url in bootstrap_servers {
            match RelaySocket::connect(url).await {
                Ok(socket) => {
                    info!(relay = %url, "Connected to relay");
                    sockets.push(Arc::new(socket));
                }
                Err(e) => {
                    warn!(relay = %url, "Failed to connect to relay: {}", e);
                    failures.push(e.to_string());
                }
            }
        }

        if sockets.is_empty() {
            let reason = if failures.is_empty() {
                "no bootstrap servers".to_string()
            } else {
                failures.join("; ")
            };
            return Err(TransportError::ConnectionError(reason));
        }

        Ok(WebSocketClient {
            sockets,
            closed: AtomicBool::new(false),
        })
    }
}

/// Client session spanning every reachable relay
pub struct WebSocketClient {
    sockets: Vec<Arc<RelaySocket>>,
    closed: AtomicBool,
}

impl WebSocketClient {
    /// Number of relays this client holds a socket to
    pub fn relay_count(&self) -> usize {
        self.sockets.len()
    }
}

#[async_trait]
impl RelayClient for WebSocketClient {
    type Listener = WebSocketListener;

    async fn listen(
        &self,
        credential: &Credential,
        name: &str,
        protocols: &[String],
    ) -> TransportResult<Self::Listener> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "client closed".to_string(),
            ));
        }

        let (queue, sender) = AcceptQueue::new(ACCEPT_BACKLOG);
        let lease = credential.lease().as_str();
        let mut registered = Vec::new();
        let mut rejections = Vec::new();

        for socket in &self.sockets {
            match socket
                .register(lease, name, protocols, sender.clone())
                .await
            {
                Ok(()) => registered.push(socket.clone()),
                Err(e) => {
                    warn!(relay = %socket.url(), service = %name, "Registration failed: {}", e);
                    rejections.push(format!("{}: {}", socket.url(), e));
                }
            }
        }

        if registered.is_empty() {
            return Err(TransportError::RegistrationRejected(rejections.join("; ")));
        }

        Ok(WebSocketListener {
            queue,
            sockets: registered,
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for socket in &self.sockets {
            socket.close();
        }
    }
}

/// Inbound streams for one registered service, merged across relays
pub struct WebSocketListener {
    queue: AcceptQueue,
    sockets: Vec<Arc<RelaySocket>>,
}

#[async_trait]
impl RelayListener for WebSocketListener {
    async fn accept(&self) -> TransportResult<RelayConnection> {
        self.queue.accept().await
    }

    async fn close(&self) {
        if self.queue.is_closed() {
            return;
        }
        self.queue.close();
        for socket in &self.sockets {
            socket.detach().await;
        }
    }
}
