//! Signaling channels
//!
//! `SignalChannel` is the client's view of one connection to the relay.
//! `WsConnector` dials a signal server over WebSocket; `LocalConnector`
//! attaches straight to an in-process `Hub`, which is what tests and
//! single-process deployments use.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use rtc_core::TransportError;
use rtc_signal::{ChannelMessage, Connection, Hub};

/// One open signaling channel
#[async_trait]
pub trait SignalChannel: Send {
    async fn send(&mut self, msg: ChannelMessage) -> Result<(), TransportError>;

    /// Next frame from the relay
    ///
    /// Must be cancel-safe: the coordinator polls it inside `select!`.
    async fn recv(&mut self) -> Result<ChannelMessage, TransportError>;

    async fn close(&mut self);
}

/// Opens signaling channels
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SignalChannel>, TransportError>;
}

/// Connector for a remote signal server
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url).map_err(|e| TransportError::ConnectFailed(format!("invalid url {}: {}", url, e)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(TransportError::ConnectFailed(format!(
                "unsupported scheme {}",
                other
            ))),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn SignalChannel>, TransportError> {
        debug!("Connecting to signal server at {}", self.url);

        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        info!("Connected to signal server");
        Ok(Box::new(WsChannel { ws }))
    }
}

struct WsChannel {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SignalChannel for WsChannel {
    async fn send(&mut self, msg: ChannelMessage) -> Result<(), TransportError> {
        let json = msg
            .to_json()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        self.ws.send(Message::Text(json)).await.map_err(|e| {
            debug!("WebSocket send failed: {}", e);
            TransportError::ChannelClosed
        })
    }

    async fn recv(&mut self) -> Result<ChannelMessage, TransportError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => match ChannelMessage::from_json(&text) {
                    Ok(msg) => return Ok(msg),
                    Err(e) => {
                        warn!("Ignoring unparseable frame from signal server: {}", e);
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::ChannelClosed),
                Some(Err(e)) => {
                    debug!("WebSocket receive failed: {}", e);
                    return Err(TransportError::ChannelClosed);
                }
                // Ignore non-text messages (ping/pong/binary)
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!("WebSocket close: {}", e);
        }
    }
}

/// Connector for a signal hub in the same process
#[derive(Clone)]
pub struct LocalConnector {
    hub: Arc<Hub>,
}

impl LocalConnector {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> Result<Box<dyn SignalChannel>, TransportError> {
        Ok(Box::new(LocalChannel {
            conn: self.hub.connect(),
            pending: VecDeque::new(),
        }))
    }
}

struct LocalChannel {
    conn: Connection,
    /// Replies to frames already sent, not yet received
    pending: VecDeque<ChannelMessage>,
}

#[async_trait]
impl SignalChannel for LocalChannel {
    async fn send(&mut self, msg: ChannelMessage) -> Result<(), TransportError> {
        if self.conn.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        let replies = self.conn.handle(msg).await;
        self.pending.extend(replies);
        Ok(())
    }

    async fn recv(&mut self) -> Result<ChannelMessage, TransportError> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                return Ok(msg);
            }
            if self.conn.is_closed() {
                return Err(TransportError::ChannelClosed);
            }
            // None means the session was evicted; the connection stays open
            if let Some(msg) = self.conn.next_event().await {
                return Ok(msg);
            }
        }
    }

    async fn close(&mut self) {
        self.conn.close();
    }
}
