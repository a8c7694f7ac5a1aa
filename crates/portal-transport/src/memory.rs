//! In-process relay
//!
//! [`MemoryRelay`] implements the relay contract without any network:
//! services register under their name and lease id, and [`MemoryRelay::dial`]
//! plays the part of a third party reaching a service through the relay.

use crate::{
    AcceptQueue, AcceptSender, Credential, RelayClient, RelayConnection, RelayConnector,
    RelayListener, TransportError, TransportResult,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::DuplexStream;
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 64;

#[derive(Clone)]
struct Registration {
    id: u64,
    client_id: u64,
    name: String,
    lease: String,
    sender: AcceptSender,
}

#[derive(Default)]
struct State {
    /// Keyed by both service name and lease id
    services: HashMap<String, Registration>,
    denied: HashSet<String>,
    refuse_connections: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    open_clients: AtomicUsize,
    next_id: AtomicU64,
}

/// Relay living entirely inside the current process
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Inner>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-update; the map is still usable
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reject future registrations for `name`
    pub fn deny(&self, name: &str) {
        self.state().denied.insert(name.to_string());
    }

    /// Make `connect` fail while set
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Whether a listener is registered under `name_or_lease`
    pub fn is_listening(&self, name_or_lease: &str) -> bool {
        self.state().services.contains_key(name_or_lease)
    }

    /// Names of every registered service, sorted
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state()
            .services
            .values()
            .map(|reg| reg.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Number of clients connected and not yet closed
    pub fn open_clients(&self) -> usize {
        self.inner.open_clients.load(Ordering::SeqCst)
    }

    /// Open a connection to the service registered as `name_or_lease`
    ///
    /// Returns the caller's end of the pipe; the other end is delivered to
    /// the service's listener.
    pub async fn dial(&self, name_or_lease: &str) -> io::Result<DuplexStream> {
        let registration = self.lookup(name_or_lease)?;
        let (caller, service) = tokio::io::duplex(PIPE_CAPACITY);
        let peer = format!("memory#{}", self.next_id());

        debug!(service = %registration.name, peer = %peer, "Dialing service");
        registration
            .sender
            .push(RelayConnection::new(service, peer))
            .await
            .map_err(|_| refused(name_or_lease))?;
        Ok(caller)
    }

    /// Make the next accept on `name_or_lease` fail with `message`
    pub async fn inject_accept_error(&self, name_or_lease: &str, message: &str) -> bool {
        match self.lookup(name_or_lease) {
            Ok(registration) => {
                registration
                    .sender
                    .push_error(TransportError::AcceptError(message.to_string()))
                    .await
            }
            Err(_) => false,
        }
    }

    fn lookup(&self, name_or_lease: &str) -> io::Result<Registration> {
        self.state()
            .services
            .get(name_or_lease)
            .cloned()
            .ok_or_else(|| refused(name_or_lease))
    }

    fn unregister(&self, predicate: impl Fn(&Registration) -> bool) {
        self.state().services.retain(|_, reg| !predicate(reg));
    }
}

fn refused(target: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("no service listening as {}", target),
    )
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    type Client = MemoryClient;

    async fn connect(&self, bootstrap_servers: &[String]) -> TransportResult<Self::Client> {
        if bootstrap_servers.is_empty() {
            return Err(TransportError::ConnectionError(
                "no bootstrap servers".to_string(),
            ));
        }
        if self.state().refuse_connections {
            return Err(TransportError::ConnectionError(format!(
                "relay refused connection ({})",
                bootstrap_servers.join(", ")
            )));
        }

        self.inner.open_clients.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryClient {
            relay: self.clone(),
            id: self.next_id(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Client session on a [`MemoryRelay`]
pub struct MemoryClient {
    relay: MemoryRelay,
    id: u64,
    closed: AtomicBool,
}

#[async_trait]
impl RelayClient for MemoryClient {
    type Listener = MemoryListener;

    async fn listen(
        &self,
        credential: &Credential,
        name: &str,
        _protocols: &[String],
    ) -> TransportResult<Self::Listener> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "client closed".to_string(),
            ));
        }

        let lease = credential.lease().as_str().to_string();
        let (queue, sender) = AcceptQueue::new(ACCEPT_BACKLOG);
        let registration = Registration {
            id: self.relay.next_id(),
            client_id: self.id,
            name: name.to_string(),
            lease: lease.clone(),
            sender,
        };

        {
            let mut state = self.relay.state();
            if state.denied.contains(name) {
                return Err(TransportError::RegistrationRejected(format!(
                    "service name {} is not allowed",
                    name
                )));
            }
            if state.services.contains_key(name) || state.services.contains_key(&lease) {
                return Err(TransportError::RegistrationRejected(format!(
                    "service name {} is already registered",
                    name
                )));
            }
            state.services.insert(name.to_string(), registration.clone());
            state.services.insert(lease, registration.clone());
        }

        debug!(service = %name, lease = %registration.lease, "Registered memory listener");
        Ok(MemoryListener {
            relay: self.relay.clone(),
            registration_id: registration.id,
            queue,
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let client_id = self.id;
        self.relay.unregister(|reg| reg.client_id == client_id);
        self.relay.inner.open_clients.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Listener registered on a [`MemoryRelay`]
pub struct MemoryListener {
    relay: MemoryRelay,
    registration_id: u64,
    queue: AcceptQueue,
}

#[async_trait]
impl RelayListener for MemoryListener {
    async fn accept(&self) -> TransportResult<RelayConnection> {
        self.queue.accept().await
    }

    async fn close(&self) {
        if self.queue.is_closed() {
            return;
        }
        self.queue.close();
        let id = self.registration_id;
        self.relay.unregister(|reg| reg.id == id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn bootstrap() -> Vec<String> {
        vec!["memory://relay".to_string()]
    }

    #[tokio::test]
    async fn test_dial_reaches_listener_by_name_and_lease() {
        let relay = MemoryRelay::new();
        let client = relay.connect(&bootstrap()).await.unwrap();
        let credential = Credential::issue();
        let listener = client.listen(&credential, "web", &[]).await.unwrap();

        let mut caller = relay.dial("web").await.unwrap();
        caller.write_all(b"ping").await.unwrap();

        let conn = listener.accept().await.unwrap();
        assert!(conn.peer().starts_with("memory#"));
        let mut stream = conn.into_stream();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let _by_lease = relay.dial(credential.lease().as_str()).await.unwrap();
        assert!(listener.accept().await.is_ok());
    }

    #[tokio::test]
    async fn test_dial_unknown_service_is_refused() {
        let relay = MemoryRelay::new();
        let err = relay.dial("nobody").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_duplicate_and_denied_names_are_rejected() {
        let relay = MemoryRelay::new();
        relay.deny("blocked");
        let client = relay.connect(&bootstrap()).await.unwrap();

        let _first = client
            .listen(&Credential::issue(), "web", &[])
            .await
            .unwrap();
        let second = client.listen(&Credential::issue(), "web", &[]).await;
        assert!(matches!(second, Err(TransportError::RegistrationRejected(_))));

        let denied = client.listen(&Credential::issue(), "blocked", &[]).await;
        assert!(matches!(denied, Err(TransportError::RegistrationRejected(_))));
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let relay = MemoryRelay::new();
        assert!(matches!(
            relay.connect(&[]).await,
            Err(TransportError::ConnectionError(_))
        ));

        relay.refuse_connections(true);
        assert!(matches!(
            relay.connect(&bootstrap()).await,
            Err(TransportError::ConnectionError(_))
        ));
        assert_eq!(relay.open_clients(), 0);
    }

    #[tokio::test]
    async fn test_listener_close_unregisters() {
        let relay = MemoryRelay::new();
        let client = relay.connect(&bootstrap()).await.unwrap();
        let listener = client
            .listen(&Credential::issue(), "web", &[])
            .await
            .unwrap();
        assert!(relay.is_listening("web"));
        assert_eq!(relay.service_names(), vec!["web".to_string()]);

        listener.close().await;
        listener.close().await;

        assert!(!relay.is_listening("web"));
        assert!(matches!(
            listener.accept().await,
            Err(TransportError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn test_client_close_released_once() {
        let relay = MemoryRelay::new();
        let client = relay.connect(&bootstrap()).await.unwrap();
        let _listener = client
            .listen(&Credential::issue(), "web", &[])
            .await
            .unwrap();
        assert_eq!(relay.open_clients(), 1);

        client.close().await;
        client.close().await;

        assert_eq!(relay.open_clients(), 0);
        assert!(!relay.is_listening("web"));
    }

    #[tokio::test]
    async fn test_injected_accept_error() {
        let relay = MemoryRelay::new();
        let client = relay.connect(&bootstrap()).await.unwrap();
        let listener = client
            .listen(&Credential::issue(), "web", &[])
            .await
            .unwrap();

        assert!(relay.inject_accept_error("web", "flaky relay").await);
        assert!(matches!(
            listener.accept().await,
            Err(TransportError::AcceptError(_))
        ));
    }
}
