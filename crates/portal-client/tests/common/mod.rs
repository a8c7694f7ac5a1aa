#![allow(dead_code)]

use portal_client::{RelayConfig, RelayDirectory};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub const RELAY: &str = "local";

pub fn directory() -> Arc<RelayDirectory> {
    Arc::new(RelayDirectory::new(vec![RelayConfig {
        name: RELAY.to_string(),
        urls: vec!["memory://relay-1".to_string(), "memory://relay-2".to_string()],
    }]))
}

/// Echo server on loopback; returns its address
pub async fn echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// Poll `condition` until it holds or five seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
