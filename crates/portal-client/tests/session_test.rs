mod common;

use common::{directory, echo_server, wait_until, RELAY};
use portal_client::{ServiceConfig, SessionState, TunnelSession};
use portal_transport::memory::MemoryRelay;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    relay: Arc<MemoryRelay>,
    session: Arc<TunnelSession<MemoryRelay>>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), portal_client::TunnelError>>,
}

async fn start(name: &str, target: &str) -> Running {
    let relay = Arc::new(MemoryRelay::new());
    let service = ServiceConfig::new(name, target, vec![RELAY.to_string()]);
    let session = Arc::new(
        TunnelSession::new(service, directory(), relay.clone()).with_origin("test"),
    );
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
    .expect("session should reach listening")
    .unwrap();

    Running {
        relay,
        session,
        cancel,
        task,
    }
}

impl Running {
    async fn stop(self) -> Arc<MemoryRelay> {
        self.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("session should stop after cancellation")
            .unwrap();
        assert!(result.is_ok(), "session returned {:?}", result);
        assert_eq!(self.session.state(), SessionState::Closed);
        self.relay
    }
}

async fn echo_roundtrip(relay: &MemoryRelay, name: &str, payload: &[u8]) {
    let mut caller = relay.dial(name).await.unwrap();
    caller.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), caller.read_exact(&mut buf))
        .await
        .expect("echo should come back")
        .unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_session_proxies_relay_connections() {
    let target = echo_server().await;
    let running = start("web", &target).await;

    echo_roundtrip(&running.relay, "web", b"hello through the relay").await;
    echo_roundtrip(&running.relay, "web", b"second connection").await;

    let relay = running.stop().await;
    assert!(!relay.is_listening("web"));
    assert_eq!(relay.open_clients(), 0);
}

#[tokio::test]
async fn test_cancel_while_accept_blocked() {
    let target = echo_server().await;
    let running = start("idle", &target).await;
    assert!(running.relay.is_listening("idle"));

    let relay = running.stop().await;
    assert!(!relay.is_listening("idle"));
    assert_eq!(relay.open_clients(), 0);
    assert!(relay.dial("idle").await.is_err());
}

#[tokio::test]
async fn test_local_dial_failure_keeps_accepting() {
    // Reserve a port, then free it so the first dial is refused
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let running = start("flaky", &addr.to_string()).await;

    let mut refused = running.relay.dial("flaky").await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), refused.read(&mut buf))
        .await
        .expect("relay side should be closed after the local dial fails")
        .unwrap();
    assert_eq!(n, 0);

    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    echo_roundtrip(&running.relay, "flaky", b"still serving").await;
    running.stop().await;
}

#[tokio::test]
async fn test_target_is_dialed_verbatim() {
    // A trailing space makes the port unparseable, so the dial must fail
    let target = format!("{} ", echo_server().await);
    let running = start("padded", &target).await;

    let mut caller = running.relay.dial("padded").await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), caller.read(&mut buf))
        .await
        .expect("relay side should be closed after the local dial fails")
        .unwrap();
    assert_eq!(n, 0);

    running.stop().await;
}

#[tokio::test]
async fn test_accept_error_does_not_end_session() {
    let target = echo_server().await;
    let running = start("web", &target).await;

    assert!(running.relay.inject_accept_error("web", "relay hiccup").await);
    echo_roundtrip(&running.relay, "web", b"after the error").await;
    assert_eq!(running.session.state(), SessionState::Listening);

    running.stop().await;
}

#[tokio::test]
async fn test_cancel_drains_open_connections() {
    let target = echo_server().await;
    let running = start("web", &target).await;

    let mut caller = running.relay.dial("web").await.unwrap();
    caller.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    caller.read_exact(&mut buf).await.unwrap();

    running.stop().await;

    let n = tokio::time::timeout(Duration::from_secs(5), caller.read(&mut buf))
        .await
        .expect("open connection should be closed by the drain")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_states_only_move_forward() {
    let target = echo_server().await;
    let relay = Arc::new(MemoryRelay::new());
    let service = ServiceConfig::new("web", target, vec![RELAY.to_string()]);
    let session = Arc::new(TunnelSession::new(service, directory(), relay.clone()));
    let mut states = session.subscribe();
    let cancel = CancellationToken::new();

    let observer = tokio::spawn(async move {
        let mut seen = vec![*states.borrow_and_update()];
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            seen.push(state);
            if state == SessionState::Closed {
                break;
            }
        }
        seen
    });

    let task = {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { session.run(cancel).await })
    };

    wait_until(|| relay.is_listening("web")).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(5), observer)
        .await
        .expect("observer should see the closed state")
        .unwrap();
    assert_eq!(seen.first(), Some(&SessionState::Resolving));
    assert_eq!(seen.last(), Some(&SessionState::Closed));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "states went backwards: {:?}", seen);
}
