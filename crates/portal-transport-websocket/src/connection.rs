//! One multiplexed WebSocket connection to a relay

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use portal_transport::{AcceptSender, RelayConnection, TransportError, TransportResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::frame::{decode_frame_header, encode_frame, ControlMessage, MSG_TYPE_DATA, MSG_TYPE_FIN};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;
/// Per-stream inbound queues. Unbounded so a stream whose reader stalls
/// never blocks the socket reader shared by every other stream.
type StreamMap = Arc<RwLock<HashMap<u32, mpsc::UnboundedSender<Bytes>>>>;

const PIPE_CAPACITY: usize = 64 * 1024;
const READ_BUFFER: usize = 16 * 1024;

/// Multiplexed WebSocket connection to a single relay
pub(crate) struct RelaySocket {
    url: String,
    frame_tx: mpsc::Sender<Message>,
    control_rx: Mutex<mpsc::Receiver<ControlMessage>>,
    acceptor: Arc<Mutex<Option<AcceptSender>>>,
    shutdown: CancellationToken,
}

impl RelaySocket {
    pub(crate) async fn connect(url: &str) -> TransportResult<Self> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("{}: {}", url, e)))?;

        debug!(relay = %url, "WebSocket connected");

        let (ws_sink, ws_source) = ws_stream.split();
        let (frame_tx, frame_rx) = mpsc::channel::<Message>(256);
        let (control_tx, control_rx) = mpsc::channel::<ControlMessage>(8);
        let streams: StreamMap = Arc::new(RwLock::new(HashMap::new()));
        let acceptor = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();

        tokio::spawn(Self::writer_task(
            ws_sink,
            frame_rx,
            shutdown.clone(),
            url.to_string(),
        ));

        tokio::spawn(Self::reader_task(ReaderContext {
            source: ws_source,
            streams,
            acceptor: acceptor.clone(),
            control_tx,
            frame_tx: frame_tx.clone(),
            shutdown: shutdown.clone(),
            url: url.to_string(),
        }));

        Ok(Self {
            url: url.to_string(),
            frame_tx,
            control_rx: Mutex::new(control_rx),
            acceptor,
            shutdown,
        })
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Register a service on this relay and route its streams to `acceptor`
    pub(crate) async fn register(
        &self,
        lease: &str,
        name: &str,
        protocols: &[String],
        acceptor: AcceptSender,
    ) -> TransportResult<()> {
        let request = ControlMessage::Register {
            lease: lease.to_string(),
            name: name.to_string(),
            protocols: protocols.to_vec(),
        };
        let payload = serde_json::to_string(&request)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        let mut control_rx = self.control_rx.lock().await;
        *self.acceptor.lock().await = Some(acceptor);

        let outcome = self.exchange_register(payload, &mut control_rx).await;
        if outcome.is_err() {
            self.acceptor.lock().await.take();
        }
        outcome
    }

    async fn exchange_register(
        &self,
        payload: String,
        control_rx: &mut mpsc::Receiver<ControlMessage>,
    ) -> TransportResult<()> {
        self.frame_tx
            .send(Message::Text(payload))
            .await
            .map_err(|_| TransportError::ConnectionError("relay connection closed".to_string()))?;

        match control_rx.recv().await {
            Some(ControlMessage::Registered) => Ok(()),
            Some(ControlMessage::Error { message }) => {
                Err(TransportError::RegistrationRejected(message))
            }
            Some(other) => Err(TransportError::ProtocolError(format!(
                "unexpected reply to register: {:?}",
                other
            ))),
            None => Err(TransportError::ConnectionError(
                "relay connection closed".to_string(),
            )),
        }
    }

    /// Stop routing new streams to the listener
    pub(crate) async fn detach(&self) {
        self.acceptor.lock().await.take();
    }

    pub(crate) fn close(&self) {
        self.shutdown.cancel();
    }

    async fn writer_task(
        mut sink: futures_util::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::Receiver<Message>,
        shutdown: CancellationToken,
        url: String,
    ) {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            if let Err(e) = sink.send(message).await {
                error!(relay = %url, "WebSocket send error: {}", e);
                break;
            }
        }

        debug!(relay = %url, "WebSocket writer task ended");
        shutdown.cancel();
        let _ = sink.close().await;
    }

    async fn reader_task(ctx: ReaderContext) {
        let ReaderContext {
            mut source,
            streams,
            acceptor,
            control_tx,
            frame_tx,
            shutdown,
            url,
        } = ctx;

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = source.next() => match result {
                    Some(result) => result,
                    None => break,
                },
            };

            match result {
                Ok(Message::Binary(data)) => {
                    let Some((stream_id, msg_type, payload)) = decode_frame_header(&data) else {
                        warn!(relay = %url, "Invalid frame received");
                        continue;
                    };
                    trace!(
                        relay = %url,
                        stream = stream_id,
                        kind = msg_type,
                        len = payload.len(),
                        "Received frame"
                    );

                    let existing = streams.read().await.get(&stream_id).cloned();
                    match (existing, msg_type) {
                        (Some(tx), MSG_TYPE_DATA) => {
                            if tx.send(Bytes::copy_from_slice(payload)).is_err() {
                                debug!(relay = %url, stream = stream_id, "Stream receiver dropped");
                            }
                        }
                        (Some(tx), MSG_TYPE_FIN) => {
                            let _ = tx.send(Bytes::new());
                            streams.write().await.remove(&stream_id);
                        }
                        (None, MSG_TYPE_DATA) => {
                            let sender = acceptor.lock().await.clone();
                            match sender {
                                Some(sender) => {
                                    open_stream(
                                        stream_id,
                                        payload,
                                        &sender,
                                        &streams,
                                        &frame_tx,
                                        &shutdown,
                                        &url,
                                    )
                                    .await;
                                }
                                None => {
                                    debug!(relay = %url, stream = stream_id, "No listener, refusing stream");
                                    let fin = encode_frame(stream_id, MSG_TYPE_FIN, &[]);
                                    let _ = frame_tx.send(Message::Binary(fin)).await;
                                }
                            }
                        }
                        (None, MSG_TYPE_FIN) => {}
                        (_, other) => {
                            warn!(relay = %url, "Unknown message type: {}", other);
                        }
                    }
                }
                Ok(Message::Text(text)) => match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(message) => {
                        let _ = control_tx.send(message).await;
                    }
                    Err(e) => warn!(relay = %url, "Invalid control message: {}", e),
                },
                Ok(Message::Close(_)) => {
                    debug!(relay = %url, "WebSocket close received");
                    break;
                }
                Ok(_) => {
                    // Ping/pong are answered by tungstenite
                }
                Err(e) => {
                    error!(relay = %url, "WebSocket read error: {}", e);
                    break;
                }
            }
        }

        debug!(relay = %url, "WebSocket reader task ended");
        shutdown.cancel();
        acceptor.lock().await.take();

        let streams = std::mem::take(&mut *streams.write().await);
        for (_, tx) in streams {
            let _ = tx.send(Bytes::new());
        }
    }
}

impl Drop for RelaySocket {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct ReaderContext {
    source: futures_util::stream::SplitStream<WsStream>,
    streams: StreamMap,
    acceptor: Arc<Mutex<Option<AcceptSender>>>,
    control_tx: mpsc::Sender<ControlMessage>,
    frame_tx: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    url: String,
}

/// Surface a relay-initiated stream as a [`RelayConnection`]
async fn open_stream(
    stream_id: u32,
    initial: &[u8],
    acceptor: &AcceptSender,
    streams: &StreamMap,
    frame_tx: &mpsc::Sender<Message>,
    shutdown: &CancellationToken,
    url: &str,
) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    if !initial.is_empty() {
        let _ = inbound_tx.send(Bytes::copy_from_slice(initial));
    }
    streams.write().await.insert(stream_id, inbound_tx);

    let (user_half, pump_half) = tokio::io::duplex(PIPE_CAPACITY);
    let peer = format!("{}#{}", url, stream_id);

    if acceptor.push(RelayConnection::new(user_half, peer)).await.is_err() {
        debug!(relay = %url, stream = stream_id, "Listener closed, refusing stream");
        streams.write().await.remove(&stream_id);
        let fin = encode_frame(stream_id, MSG_TYPE_FIN, &[]);
        let _ = frame_tx.send(Message::Binary(fin)).await;
        return;
    }

    tokio::spawn(pump_stream(
        stream_id,
        pump_half,
        inbound_rx,
        frame_tx.clone(),
        streams.clone(),
        shutdown.clone(),
    ));
}

/// Move bytes between the duplex pipe and the multiplexed socket
async fn pump_stream(
    stream_id: u32,
    pipe: DuplexStream,
    mut inbound_rx: mpsc::UnboundedReceiver<Bytes>,
    frame_tx: mpsc::Sender<Message>,
    streams: StreamMap,
    shutdown: CancellationToken,
) {
    let (mut pipe_read, mut pipe_write) = tokio::io::split(pipe);

    let inbound = async move {
        while let Some(data) = inbound_rx.recv().await {
            if data.is_empty() {
                break;
            }
            if pipe_write.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = pipe_write.shutdown().await;
    };

    let outbound_tx = frame_tx.clone();
    let outbound = async move {
        let mut buffer = vec![0u8; READ_BUFFER];
        loop {
            match pipe_read.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = encode_frame(stream_id, MSG_TYPE_DATA, &buffer[..n]);
                    if outbound_tx.send(Message::Binary(frame)).await.is_err() {
                        return;
                    }
                }
            }
        }
        let fin = encode_frame(stream_id, MSG_TYPE_FIN, &[]);
        let _ = outbound_tx.send(Message::Binary(fin)).await;
    };

    let pump = async {
        tokio::pin!(outbound);
        let local_done = tokio::select! {
            _ = &mut outbound => true,
            _ = inbound => false,
        };
        if !local_done {
            outbound.await;
        }
    };

    tokio::select! {
        _ = pump => {}
        _ = shutdown.cancelled() => {}
    }

    streams.write().await.remove(&stream_id);
    trace!(stream = stream_id, "Stream pump finished");
}
