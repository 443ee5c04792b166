use std::time::Duration;

use async_trait::async_trait;
use chat_core::{ChatError, ChatErrorCategory};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tokio_tungstenite::{WebSocketStream, connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, trace, warn};
use url::Url;

/// How long a shut-down writer may keep flushing before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Transport-level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<&TransportError> for ChatError {
    fn from(err: &TransportError) -> Self {
        let (category, code) = match err {
            TransportError::Connection(_) => (ChatErrorCategory::Connection, "connection_failed"),
            TransportError::NotConnected => (ChatErrorCategory::NotConnected, "not_connected"),
            TransportError::Timeout(_) => (ChatErrorCategory::Timeout, "connect_timeout"),
        };
        ChatError::new(category, code, err.to_string())
    }
}

/// Something the socket task observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportIncoming {
    /// One text frame.
    Text(String),
    /// Every tracked frame up to this receipt reached the socket.
    Written { receipt: u64 },
    /// The connection ended; no further items follow.
    Closed { reason: Option<String> },
}

/// One frame queued for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundText {
    pub text: String,
    /// Set for frames whose write must be confirmed with
    /// [`TransportIncoming::Written`].
    pub receipt: Option<u64>,
}

/// An open connection: a non-blocking outbound sender, an inbound receiver
/// and the I/O task that pumps between them and the socket.
///
/// Writes are confirmed in order on the inbound side, ahead of any
/// `Closed`, so a receipt that never shows up was never written.
#[derive(Debug)]
pub struct TransportConnection {
    outbound: mpsc::UnboundedSender<OutboundText>,
    inbound: mpsc::UnboundedReceiver<TransportIncoming>,
    task: Option<JoinHandle<()>>,
    last_receipt: u64,
}

impl TransportConnection {
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundText>,
        inbound: mpsc::UnboundedReceiver<TransportIncoming>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            task,
            last_receipt: 0,
        }
    }

    /// Hand one fire-and-forget frame to the writer. Fails once the writer
    /// has gone away.
    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(OutboundText {
                text,
                receipt: None,
            })
            .map_err(|_| TransportError::NotConnected)
    }

    /// Hand one frame to the writer and return the receipt its write will be
    /// confirmed under.
    pub fn send_tracked(&mut self, text: String) -> Result<u64, TransportError> {
        let receipt = self.last_receipt + 1;
        self.outbound
            .send(OutboundText {
                text,
                receipt: Some(receipt),
            })
            .map_err(|_| TransportError::NotConnected)?;
        self.last_receipt = receipt;
        Ok(receipt)
    }

    /// Stop accepting frames and let the writer flush what it already holds
    /// before closing the socket. The writer is aborted after
    /// [`SHUTDOWN_GRACE`].
    pub fn shutdown(mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        // Dropping the sender is what tells the writer to finish.
        drop(self);
        tokio::spawn(async move {
            if time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                debug!("transport writer did not finish flushing, aborting");
                task.abort();
            }
        });
    }

    /// Next inbound item. A vanished reader counts as a close.
    pub async fn recv(&mut self) -> TransportIncoming {
        self.inbound
            .recv()
            .await
            .unwrap_or(TransportIncoming::Closed { reason: None })
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens transport connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<TransportConnection, TransportError>;
}

/// Connector for a JSON-over-WebSocket chat endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<TransportConnection, TransportError> {
        debug!(url = %self.url, "opening websocket");
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Connection(err.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump_websocket(stream, outbound_rx, inbound_tx));

        Ok(TransportConnection::new(outbound_tx, inbound_rx, Some(task)))
    }
}

async fn pump_websocket<S>(
    stream: WebSocketStream<S>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundText>,
    inbound_tx: mpsc::UnboundedSender<TransportIncoming>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();

    let reason = loop {
        tokio::select! {
            // Outbound first, so a shutdown flushes everything queued before it.
            biased;
            next = outbound_rx.recv() => match next {
                Some(OutboundText { text, receipt }) => {
                    trace!(bytes = text.len(), ?receipt, "websocket send");
                    if let Err(err) = sink.send(WsMessage::Text(text)).await {
                        break Some(err.to_string());
                    }
                    if let Some(receipt) = receipt {
                        // The reader may already be gone during shutdown.
                        let _ = inbound_tx.send(TransportIncoming::Written { receipt });
                    }
                }
                None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break Some("closed by client".to_owned());
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if inbound_tx.send(TransportIncoming::Text(text)).is_err() {
                        break None;
                    }
                }
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if inbound_tx.send(TransportIncoming::Text(text)).is_err() {
                            break None;
                        }
                    }
                    Err(err) => warn!(error = %err, "dropping non-utf8 binary frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    break frame.map(|frame| format!("{} {}", u16::from(frame.code), frame.reason));
                }
                // Ping/pong replies are handled by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(err)) => break Some(err.to_string()),
                None => break None,
            },
        }
    };

    debug!(?reason, "websocket closed");
    let _ = inbound_tx.send(TransportIncoming::Closed { reason });
}
