//! Accept queue shared by listener implementations
//!
//! Producers (relay reader tasks, in-memory dialers) push inbound
//! connections through an [`AcceptSender`]; the listener pulls them with
//! [`AcceptQueue::accept`]. Closing the queue wakes any pending accept.

use crate::{RelayConnection, TransportError, TransportResult};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

type Item = TransportResult<RelayConnection>;

/// Receiving side of an accept queue
pub struct AcceptQueue {
    rx: Mutex<mpsc::Receiver<Item>>,
    closed: CancellationToken,
}

/// Producer handle for an [`AcceptQueue`]
#[derive(Clone)]
pub struct AcceptSender {
    tx: mpsc::Sender<Item>,
    closed: CancellationToken,
}

impl AcceptQueue {
    pub fn new(capacity: usize) -> (Self, AcceptSender) {
        let (tx, rx) = mpsc::channel(capacity);
        let closed = CancellationToken::new();
        let sender = AcceptSender {
            tx,
            closed: closed.clone(),
        };
        (
            Self {
                rx: Mutex::new(rx),
                closed,
            },
            sender,
        )
    }

    /// Wait for the next connection (or queued error)
    ///
    /// Fails with [`TransportError::ListenerClosed`] once the queue is closed.
    /// If every sender is gone the relay side is considered lost.
    pub async fn accept(&self) -> TransportResult<RelayConnection> {
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TransportError::ListenerClosed),
            rx = self.rx.lock() => rx,
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::ListenerClosed),
            item = rx.recv() => match item {
                Some(item) => item,
                None => Err(TransportError::ConnectionError(
                    "relay connection lost".to_string(),
                )),
            },
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl AcceptSender {
    /// Queue an inbound connection
    ///
    /// Returns the connection back if the queue has been closed so the
    /// caller decides how to dispose of it.
    pub async fn push(&self, conn: RelayConnection) -> Result<(), RelayConnection> {
        match self.reserve().await {
            Some(permit) => {
                permit.send(Ok(conn));
                Ok(())
            }
            None => Err(conn),
        }
    }

    /// Queue an accept failure
    pub async fn push_error(&self, error: TransportError) -> bool {
        match self.reserve().await {
            Some(permit) => {
                permit.send(Err(error));
                true
            }
            None => false,
        }
    }

    async fn reserve(&self) -> Option<mpsc::Permit<'_, Item>> {
        if self.closed.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            permit = self.tx.reserve() => permit.ok(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
