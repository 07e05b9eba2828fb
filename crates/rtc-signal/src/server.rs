//! WebSocket signal server implementation

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info};

use rtc_core::ErrorCode;

use crate::connection::Hub;
use crate::messages::ChannelMessage;

/// Signal server state
pub struct SignalServer {
    hub: Arc<Hub>,
    sweep_interval: Duration,
}

impl SignalServer {
    pub fn new(hub: Arc<Hub>, sweep_interval: Duration) -> Self {
        Self {
            hub,
            sweep_interval,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Start the signal server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", addr);
        self.serve_listener(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        let sweeper = Arc::clone(self.hub.relay()).spawn_sweeper(self.sweep_interval);
        let result = self.accept_loop(listener).await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let hub = Arc::clone(&self.hub);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, hub).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Get session count (for monitoring)
    pub fn session_count(&self) -> usize {
        self.hub.registry().session_count()
    }

    /// Get open connection count (for monitoring)
    pub fn connection_count(&self) -> usize {
        self.hub.connection_count()
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    hub: Arc<Hub>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // WebSocket upgrades are GETs too, so route on the path
    if is_health_request(&stream).await? {
        return handle_http_request(&mut stream, &hub).await;
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut conn = hub.connect();
    debug!("New connection from {} as {}", peer_addr, conn.id());

    let auth_deadline = tokio::time::Instant::now() + hub.auth_timeout();

    loop {
        let outgoing = tokio::select! {
            msg = ws_receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sender.send(Message::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("WebSocket error: {:?}", e);
                        break;
                    }
                };

                match ChannelMessage::from_json(&text) {
                    Ok(request) => conn.handle(request).await,
                    Err(e) => vec![ChannelMessage::error(
                        ErrorCode::Malformed,
                        format!("Invalid JSON: {}", e),
                    )],
                }
            }

            Some(event) = conn.next_event() => vec![event],

            _ = tokio::time::sleep_until(auth_deadline), if !conn.is_authenticated() => {
                info!("Connection {} from {} did not authenticate in time", conn.id(), peer_addr);
                conn.close();
                vec![ChannelMessage::error(ErrorCode::Timeout, "authentication timed out")]
            }
        };

        for frame in outgoing {
            let json = frame.to_json()?;
            if ws_sender.send(Message::Text(json)).await.is_err() {
                conn.close();
                break;
            }
        }

        if conn.is_closed() {
            let _ = ws_sender.send(Message::Close(None)).await;
            break;
        }
    }

    // Leaves any joined session
    drop(conn);

    debug!("Connection closed: {}", peer_addr);
    Ok(())
}

/// Peek at the request line to detect health checks
async fn is_health_request(stream: &TcpStream) -> Result<bool, std::io::Error> {
    let mut buf = [0u8; 16];
    let n = stream.peek(&mut buf).await?;
    let head = String::from_utf8_lossy(&buf[..n]);
    Ok(head.starts_with("GET /health ") || head.starts_with("GET /stats "))
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    stream: &mut TcpStream,
    hub: &Hub,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Read the HTTP request
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    // Parse the request path
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let sessions = hub.registry().session_count();
    let connections = hub.connection_count();

    let (status, body) = match path {
        "/health" => (
            "200 OK",
            serde_json::json!({
                "status": "healthy",
                "sessions": sessions,
                "connections": connections,
            }),
        ),
        "/stats" => (
            "200 OK",
            serde_json::json!({
                "sessions": sessions,
                "members": hub.registry().member_count(),
                "subscribers": hub.relay().subscriber_count(),
                "connections": connections,
            }),
        ),
        _ => ("404 Not Found", serde_json::json!({ "error": "not found" })),
    };
    let body = body.to_string();

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::relay::SignalingRelay;
    use rtc_core::crypto::TokenKey;
    use rtc_core::{unix_now, CallState, SessionId, SignalingMessage, Validator};
    use tokio_tungstenite::connect_async;

    const SECRET: &str = "server-test-secret";

    fn server(auth_timeout: Duration) -> SignalServer {
        let relay = Arc::new(SignalingRelay::new(Arc::new(SessionRegistry::default())));
        let validator = Validator::with_key(TokenKey::from_secret(SECRET));
        let hub = Arc::new(Hub::new(relay, validator, auth_timeout));
        SignalServer::new(hub, Duration::from_secs(1))
    }

    async fn start(server: SignalServer) -> (SocketAddr, Arc<Hub>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = Arc::clone(server.hub());
        tokio::spawn(async move {
            let _ = server.serve_listener(listener).await;
        });
        (addr, hub)
    }

    #[test]
    fn test_server_creation() {
        let server = server(Duration::from_secs(5));
        assert_eq!(server.session_count(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (addr, _hub) = start(server(Duration::from_secs(5))).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains(r#""status":"healthy""#));
        assert!(response.contains(r#""sessions":0"#));
    }

    async fn send(
        ws: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
        msg: ChannelMessage,
    ) {
        ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
    }

    async fn recv(
        ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    ) -> ChannelMessage {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return ChannelMessage::from_json(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    }

    fn hello(user_id: &str) -> ChannelMessage {
        ChannelMessage::Hello {
            user_id: user_id.into(),
            token: TokenKey::from_secret(SECRET).issue(user_id, unix_now() + 600),
            display_name: None,
            avatar_ref: None,
        }
    }

    #[tokio::test]
    async fn test_websocket_call() {
        let (addr, hub) = start(server(Duration::from_secs(5))).await;
        let url = format!("ws://{}", addr);
        let id = SessionId::new();

        let (mut a, _) = connect_async(&url).await.unwrap();
        let (mut b, _) = connect_async(&url).await.unwrap();

        send(&mut a, hello("alice")).await;
        assert!(matches!(recv(&mut a).await, ChannelMessage::Authenticated { .. }));
        send(&mut a, ChannelMessage::Join { session_id: id }).await;
        assert!(matches!(recv(&mut a).await, ChannelMessage::Joined { .. }));

        send(&mut b, hello("bob")).await;
        assert!(matches!(recv(&mut b).await, ChannelMessage::Authenticated { .. }));
        send(&mut b, ChannelMessage::Join { session_id: id }).await;
        assert!(matches!(recv(&mut b).await, ChannelMessage::Joined { .. }));
        assert!(matches!(
            recv(&mut b).await,
            ChannelMessage::StateChanged {
                state: CallState::Connecting,
                ..
            }
        ));

        assert!(matches!(recv(&mut a).await, ChannelMessage::PeerJoined { .. }));
        assert!(matches!(recv(&mut a).await, ChannelMessage::StateChanged { .. }));

        send(
            &mut a,
            ChannelMessage::Signal {
                message: SignalingMessage::offer(id, "alice", "v=0 offer"),
            },
        )
        .await;
        assert!(matches!(recv(&mut a).await, ChannelMessage::Ack { seq: 1, .. }));
        assert!(matches!(recv(&mut b).await, ChannelMessage::Relayed { seq: 1, .. }));

        send(
            &mut b,
            ChannelMessage::Signal {
                message: SignalingMessage::answer(id, "bob", "v=0 answer"),
            },
        )
        .await;
        assert!(matches!(
            recv(&mut b).await,
            ChannelMessage::Ack {
                state: CallState::Active,
                ..
            }
        ));

        assert_eq!(hub.registry().get(id).unwrap().state, CallState::Active);
    }

    #[tokio::test]
    async fn test_auth_deadline_closes_connection() {
        let (addr, _hub) = start(server(Duration::from_millis(100))).await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        match recv(&mut ws).await {
            ChannelMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Timeout),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
