//! Tunnel session
//!
//! One session owns one exposed service for the whole run:
//!
//! ```text
//! Resolving -> Registering -> Listening -> Draining -> Closed
//! ```
//!
//! Resolution and registration failures end the session with an error.
//! Accept failures and per-connection proxy failures are logged and never
//! end the session. Cancelling the token passed to [`TunnelSession::run`]
//! closes the listener, waits for every in-flight proxy and releases the
//! relay client.

use portal_transport::{Credential, Lease, RelayClient, RelayConnector, RelayListener};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::ServiceConfig;
use crate::directory::RelayDirectory;
use crate::error::TunnelError;
use crate::proxy::proxy;

const GENERATED_NAME_PREFIX_LEN: usize = 8;

/// Lifecycle states of a session; they only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Resolving,
    Registering,
    Listening,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Resolving => "resolving",
            SessionState::Registering => "registering",
            SessionState::Listening => "listening",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle of one exposed service
pub struct TunnelSession<C: RelayConnector> {
    service: ServiceConfig,
    directory: Arc<RelayDirectory>,
    connector: Arc<C>,
    origin: Option<String>,
    state: watch::Sender<SessionState>,
}

impl<C: RelayConnector> TunnelSession<C> {
    pub fn new(service: ServiceConfig, directory: Arc<RelayDirectory>, connector: Arc<C>) -> Self {
        let (state, _) = watch::channel(SessionState::Resolving);
        Self {
            service,
            directory,
            connector,
            origin: None,
            state,
        }
    }

    /// Where the service definition came from (`flags`, `config=<path>`), for logs
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        debug!(service = %self.service.label(), from = %previous, to = %next, "Session state changed");
    }

    /// Run the session until `cancel` fires or it fails to come up
    ///
    /// Returns `Ok(())` on cancellation, including cancellation that arrives
    /// while still connecting or registering.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        self.transition(SessionState::Resolving);
        let servers = match self.directory.resolve(&self.service.relay_preference) {
            Ok(servers) => servers,
            Err(source) => {
                self.transition(SessionState::Closed);
                return Err(TunnelError::Resolve {
                    service: self.service.label(),
                    source,
                });
            }
        };

        self.transition(SessionState::Registering);
        let credential = Credential::issue();
        let lease = credential.lease().clone();
        let name = self.service_name(&lease);
        let target = self.service.target.clone();

        info!(service = %name, "Local service is reachable at {}", target);
        match &self.origin {
            Some(origin) => info!(service = %name, "Starting Portal Tunnel ({})...", origin),
            None => info!(service = %name, "Starting Portal Tunnel..."),
        }
        info!(service = %name, "  Local:    {}", target);
        info!(service = %name, "  Relays:   {}", servers.join(", "));
        info!(service = %name, "  Lease ID: {}", lease);

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.connector.connect(&servers) => Some(result),
        };
        let client = match connected {
            None => {
                self.transition(SessionState::Closed);
                return Ok(());
            }
            Some(Ok(client)) => client,
            Some(Err(source)) => {
                self.transition(SessionState::Closed);
                return Err(TunnelError::Connect {
                    service: name,
                    source,
                });
            }
        };

        let registered = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = client.listen(&credential, &name, &self.service.protocols) => Some(result),
        };
        let listener = match registered {
            None => {
                client.close().await;
                self.transition(SessionState::Closed);
                return Ok(());
            }
            Some(Ok(listener)) => listener,
            Some(Err(source)) => {
                client.close().await;
                self.transition(SessionState::Closed);
                return Err(TunnelError::Register {
                    service: name,
                    source,
                });
            }
        };

        info!(service = %name, "Access via:");
        info!(service = %name, "- Name:     /peer/{}", name);
        info!(service = %name, "- Lease ID: /peer/{}", lease);
        info!(service = %name, "- Example:  http://{}/peer/{}", servers[0], name);

        self.transition(SessionState::Listening);
        let connections = TaskTracker::new();
        let accepted = self
            .accept_loop(&listener, &connections, &cancel, &name, &target)
            .await;

        self.transition(SessionState::Draining);
        listener.close().await;
        connections.close();
        connections.wait().await;
        client.close().await;

        self.transition(SessionState::Closed);
        info!(service = %name, connections = accepted, "Session closed");
        Ok(())
    }

    fn service_name(&self, lease: &Lease) -> String {
        let name = self.service.name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
        let generated = format!("tunnel-{}", lease.prefix(GENERATED_NAME_PREFIX_LEN));
        info!(service = %generated, "No service name provided; generated automatically");
        generated
    }

    /// Accept until cancelled; returns the number of connections accepted
    async fn accept_loop<L: RelayListener>(
        &self,
        listener: &L,
        connections: &TaskTracker,
        cancel: &CancellationToken,
        name: &str,
        target: &str,
    ) -> u64 {
        let mut count = 0u64;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    error!(service = %name, "Failed to accept connection: {}", e);
                    continue;
                }
            };

            count += 1;
            let id = count;
            info!(service = %name, conn = id, "[#{}] New connection from {}", id, conn.peer());

            let token = cancel.child_token();
            let service = name.to_string();
            let target = target.to_string();
            connections.spawn(async move {
                match proxy(&token, &target, conn).await {
                    Ok(stats) => info!(
                        service = %service,
                        conn = id,
                        bytes_in = stats.relay_to_local,
                        bytes_out = stats.local_to_relay,
                        "[#{}] Connection closed",
                        id
                    ),
                    Err(e) => error!(service = %service, conn = id, "[#{}] Proxy error: {}", id, e),
                }
            });
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::error::DirectoryError;
    use portal_transport::memory::MemoryRelay;
    use std::time::Duration;

    fn directory() -> Arc<RelayDirectory> {
        Arc::new(RelayDirectory::new(vec![RelayConfig {
            name: "local".to_string(),
            urls: vec!["memory://relay".to_string()],
        }]))
    }

    fn service(name: &str) -> ServiceConfig {
        ServiceConfig::new(name, "127.0.0.1:9", vec!["local".to_string()])
    }

    #[test]
    fn test_state_order() {
        assert!(SessionState::Resolving < SessionState::Registering);
        assert!(SessionState::Listening < SessionState::Draining);
        assert!(SessionState::Draining < SessionState::Closed);
        assert_eq!(SessionState::Listening.to_string(), "listening");
    }

    #[tokio::test]
    async fn test_resolve_failure_is_fatal() {
        let relay = Arc::new(MemoryRelay::new());
        let mut config = service("web");
        config.relay_preference = vec!["nowhere".to_string()];
        let session = TunnelSession::new(config, directory(), relay.clone());

        let err = session.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Resolve {
                source: DirectoryError::NoBootstrapServers { .. },
                ..
            }
        ));
        assert_eq!(err.service(), "web");
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(relay.open_clients(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let relay = Arc::new(MemoryRelay::new());
        relay.refuse_connections(true);
        let session = TunnelSession::new(service("web"), directory(), relay.clone());

        let err = session.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Connect { .. }));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_register_failure_releases_client() {
        let relay = Arc::new(MemoryRelay::new());
        relay.deny("web");
        let session = TunnelSession::new(service("web"), directory(), relay.clone());

        let err = session.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Register { .. }));
        assert_eq!(err.service(), "web");
        assert_eq!(relay.open_clients(), 0);
    }

    #[tokio::test]
    async fn test_blank_name_is_generated_from_lease() {
        let relay = Arc::new(MemoryRelay::new());
        let session = Arc::new(TunnelSession::new(service("  "), directory(), relay.clone()));
        let mut states = session.subscribe();
        let cancel = CancellationToken::new();

        let task = {
            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { session.run(cancel).await })
        };

        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == SessionState::Listening),
        )
        .await
        .expect("session should start listening")
        .unwrap();

        let names = relay.service_names();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("tunnel-"));
        assert_eq!(names[0].len(), "tunnel-".len() + 8);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
