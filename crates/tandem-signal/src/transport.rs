//! Outbound half of a client connection
//!
//! Room peers and the relay only ever see a [`PeerSink`]; the read half stays
//! with the connection task so each stream has exactly one reader.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use tandem_core::{truncate_reason, CloseStatus, SignalError, SignalingMessage};

/// Write side of a message stream
#[async_trait]
pub trait PeerSink: Send + Sync {
    /// Send one text frame
    async fn send_text(&self, text: String) -> Result<(), SignalError>;

    /// Start the close handshake with the given status and reason
    async fn close(&self, status: CloseStatus, reason: &str) -> Result<(), SignalError>;
}

pub type SharedSink = Arc<dyn PeerSink>;

/// Send raw text, giving up after `limit`
pub async fn send_text_within(
    sink: &dyn PeerSink,
    text: String,
    limit: Duration,
) -> Result<(), SignalError> {
    match tokio::time::timeout(limit, sink.send_text(text)).await {
        Ok(result) => result,
        Err(_) => Err(SignalError::RelayTimeout(limit)),
    }
}

/// Serialize and send a signaling message, giving up after `limit`
pub async fn send_message_within(
    sink: &dyn PeerSink,
    msg: &SignalingMessage,
    limit: Duration,
) -> Result<(), SignalError> {
    send_text_within(sink, msg.to_json()?, limit).await
}

/// [`PeerSink`] over the write half of a WebSocket
pub struct WsSink<S> {
    inner: Mutex<SplitSink<WebSocketStream<S>, Message>>,
}

impl<S> WsSink<S> {
    pub fn new(inner: SplitSink<WebSocketStream<S>, Message>) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

#[async_trait]
impl<S> PeerSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_text(&self, text: String) -> Result<(), SignalError> {
        let mut sink = self.inner.lock().await;
        sink.send(Message::Text(text)).await.map_err(ws_error)
    }

    async fn close(&self, status: CloseStatus, reason: &str) -> Result<(), SignalError> {
        let frame = CloseFrame {
            code: CloseCode::from(status.code()),
            reason: Cow::Owned(truncate_reason(reason)),
        };
        let mut sink = self.inner.lock().await;
        sink.send(Message::Close(Some(frame))).await.map_err(ws_error)
    }
}

fn ws_error(e: WsError) -> SignalError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => SignalError::Disconnected,
        other => SignalError::Send(other.to_string()),
    }
}
