//! Connection proxy
//!
//! Joins one relay connection to a fresh TCP connection to the local target
//! and copies bytes both ways. Whichever direction finishes first ends the
//! proxy, and both connections are dropped together on every exit path.

use portal_transport::RelayConnection;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProxyError;

const COPY_BUFFER: usize = 16 * 1024;

/// Bytes moved by one proxied connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub relay_to_local: u64,
    pub local_to_relay: u64,
}

/// Proxy `conn` to `target` until either side closes or `cancel` fires
///
/// A failed dial drops the relay connection before returning. Cancellation
/// is a normal stop and returns the bytes copied so far.
pub async fn proxy(
    cancel: &CancellationToken,
    target: &str,
    conn: RelayConnection,
) -> Result<ProxyStats, ProxyError> {
    let mut local = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(source) => {
            drop(conn);
            return Err(ProxyError::LocalConnect {
                address: target.to_string(),
                source,
            });
        }
    };
    if let Err(e) = local.set_nodelay(true) {
        debug!(address = %target, "Failed to set TCP_NODELAY: {}", e);
    }

    let (mut relay_read, mut relay_write) = tokio::io::split(conn.into_stream());
    let (mut local_read, mut local_write) = local.split();

    let mut stats = ProxyStats::default();
    let result = {
        let relay_to_local =
            copy_counted(&mut relay_read, &mut local_write, &mut stats.relay_to_local);
        let local_to_relay =
            copy_counted(&mut local_read, &mut relay_write, &mut stats.local_to_relay);

        tokio::select! {
            result = relay_to_local => {
                debug!("Relay side finished");
                result
            }
            result = local_to_relay => {
                debug!("Local side finished");
                result
            }
            _ = cancel.cancelled() => {
                debug!("Proxy cancelled");
                Ok(())
            }
        }
    };

    // Both halves of each connection are dropped here
    result.map(|()| stats).map_err(ProxyError::from)
}

async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    copied: &mut u64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}
