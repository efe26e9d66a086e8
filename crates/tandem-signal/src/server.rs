//! WebSocket gateway: accepts connections and dispatches them to matchmaking
//! or signaling based on the request path and the first message

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use tandem_core::ids::{generate_connection_id, validate_room_id};
use tandem_core::{
    CloseStatus, Config, MatchRequest, MatchResponse, MessageKind, ServerConfig, SignalError,
    SignalingMessage,
};

use crate::pairing::{PairingQueue, Registration};
use crate::relay::MessageRelay;
use crate::room::RoomRegistry;
use crate::transport::{send_message_within, send_text_within, SharedSink, WsSink};

/// How long to wait for the client's close reply after we close
const CLOSE_DRAIN: Duration = Duration::from_secs(1);

/// Peek attempts while waiting for a complete HTTP request head
const SNIFF_ATTEMPTS: usize = 50;

type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// Which protocol a connection speaks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Matchmaking,
    Signaling,
}

/// Routing decision made from the request path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Fixed(Endpoint),
    /// Decide from the first message
    Auto,
}

impl Route {
    pub fn resolve(path: &str, server: &ServerConfig) -> Option<Route> {
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        if path == server.matchmaking_path.trim_end_matches('/') {
            Some(Route::Fixed(Endpoint::Matchmaking))
        } else if path == server.signaling_path.trim_end_matches('/') {
            Some(Route::Fixed(Endpoint::Signaling))
        } else if path == "/" {
            Some(Route::Auto)
        } else {
            None
        }
    }
}

/// Pick an endpoint from the shape of the first message
fn route_by_content(first: &str) -> Result<Endpoint, SignalError> {
    let value: Value = serde_json::from_str(first)?;
    if value.get("type").and_then(Value::as_str) == Some("register") {
        Ok(Endpoint::Signaling)
    } else if value.get("user_id").is_some() {
        Ok(Endpoint::Matchmaking)
    } else {
        Err(SignalError::protocol(
            "first message is neither a register nor a matchmaking request",
        ))
    }
}

struct ServerState {
    config: Config,
    pairing: PairingQueue,
    registry: Arc<RoomRegistry>,
    relay: MessageRelay,
    shutdown: watch::Sender<bool>,
}

/// Signal server state
#[derive(Clone)]
pub struct SignalServer {
    state: Arc<ServerState>,
}

impl SignalServer {
    pub fn new(config: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(ServerState {
                pairing: PairingQueue::new(config.matchmaking.queue_capacity),
                registry: Arc::new(RoomRegistry::new()),
                relay: MessageRelay::new(config.relay_timeout()),
                shutdown,
                config,
            }),
        }
    }

    /// Start the signal server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        self.run(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves
    pub async fn run<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()>,
    {
        info!("Signal server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(
                        "Shutting down with {} rooms and {} waiting",
                        self.room_count(),
                        self.waiting_count()
                    );
                    self.shutdown();
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, state).await {
                            debug!("Connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
            }
        }
    }

    /// Unblock every suspended wait and relay loop
    pub fn shutdown(&self) {
        self.state.shutdown.send_replace(true);
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.state.registry
    }

    pub fn pairing(&self) -> &PairingQueue {
        &self.state.pairing
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.state.registry.room_count()
    }

    /// Get peer count (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.state.registry.peer_count()
    }

    /// Get matchmaking queue length (for monitoring)
    pub fn waiting_count(&self) -> usize {
        self.state.pairing.waiting_count()
    }
}

impl Default for SignalServer {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    // A dropped sender means the server is gone as well
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), SignalError> {
    // Sniffing and the WebSocket handshake share one deadline, so a client
    // that connects and stays silent is dropped.
    let deadline = Instant::now() + state.config.first_message_timeout();

    match tokio::time::timeout_at(deadline, sniff_request(&stream)).await {
        Ok(Ok(Sniffed::Plain(path))) => {
            return handle_http_request(stream, &path, &state)
                .await
                .map_err(|e| SignalError::Internal(e.to_string()));
        }
        Ok(Ok(Sniffed::Upgrade)) => {}
        Ok(Err(e)) => return Err(SignalError::Handshake(e.to_string())),
        Err(_) => return Err(SignalError::Handshake("no request before timeout".into())),
    }

    let mut route = None;
    let server_config = &state.config.server;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        match Route::resolve(req.uri().path(), server_config) {
            Some(resolved) => {
                route = Some(resolved);
                Ok(resp)
            }
            None => {
                let body = format!("no endpoint at {}", req.uri().path());
                let mut err = ErrorResponse::new(Some(body));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        }
    };

    let ws = match tokio::time::timeout_at(deadline, accept_hdr_async(stream, callback)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => return Err(SignalError::Handshake(e.to_string())),
        Err(_) => return Err(SignalError::Handshake("handshake timed out".into())),
    };
    let route = route.ok_or_else(|| SignalError::Handshake("no route resolved".into()))?;

    let conn_id = generate_connection_id();
    debug!("[{}] New connection from {} ({:?})", conn_id, peer_addr, route);

    let (sink, mut reader) = ws.split();
    let sink: SharedSink = Arc::new(WsSink::new(sink));
    let mut shutdown = state.shutdown.subscribe();

    let result = run_session(&state, &conn_id, route, &sink, &mut reader, &mut shutdown).await;

    match &result {
        Ok(()) => debug!("[{}] Connection closed", conn_id),
        Err(SignalError::Disconnected) => debug!("[{}] Peer {} disconnected", conn_id, peer_addr),
        Err(e) => {
            warn!("[{}] Closing connection from {}: {}", conn_id, peer_addr, e);
            close_gracefully(&sink, &mut reader, CloseStatus::from(e), &e.close_reason()).await;
        }
    }
    result
}

async fn run_session(
    state: &ServerState,
    conn_id: &str,
    route: Route,
    sink: &SharedSink,
    reader: &mut WsReader,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SignalError> {
    let limit = state.config.first_message_timeout();
    let Some(first) = read_first_text(reader, limit, shutdown).await? else {
        debug!("[{}] Closed before sending a first message", conn_id);
        return Ok(());
    };

    let endpoint = match route {
        Route::Fixed(endpoint) => endpoint,
        Route::Auto => route_by_content(&first)?,
    };

    match endpoint {
        Endpoint::Matchmaking => {
            run_matchmaking(state, conn_id, sink, reader, shutdown, first).await
        }
        Endpoint::Signaling => {
            run_signaling(state, conn_id, sink, reader, shutdown, first).await
        }
    }
}

/// Read until the first text frame; `None` if the client closed first
async fn read_first_text(
    reader: &mut WsReader,
    limit: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<String>, SignalError> {
    let read = async {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(_) => continue,
                Err(e) => {
                    debug!("Read error before first message: {}", e);
                    return Err(SignalError::Disconnected);
                }
            }
        }
        Ok(None)
    };

    tokio::select! {
        result = tokio::time::timeout(limit, read) => match result {
            Ok(first) => first,
            Err(_) => Err(SignalError::protocol(format!("no first message within {:?}", limit))),
        },
        _ = wait_for_shutdown(shutdown) => Err(SignalError::Shutdown),
    }
}

async fn run_matchmaking(
    state: &ServerState,
    conn_id: &str,
    sink: &SharedSink,
    reader: &mut WsReader,
    shutdown: &mut watch::Receiver<bool>,
    first: String,
) -> Result<(), SignalError> {
    let request = MatchRequest::from_json(&first)?;
    info!("[{}] Matchmaking request from user {}", conn_id, request.user_id);

    let registry = &state.registry;
    let pairing = match state.pairing.register(&request.user_id, |id| registry.contains(id))? {
        Registration::Paired(pairing) => pairing,
        Registration::Waiting(mut handle) => loop {
            tokio::select! {
                biased;
                paired = handle.paired() => break paired?,
                frame = reader.next() => match frame {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        info!("[{}] User {} left while waiting", conn_id, request.user_id);
                        return Err(SignalError::Disconnected);
                    }
                    Some(Ok(_)) => continue,
                },
                _ = wait_for_shutdown(shutdown) => return Err(SignalError::Shutdown),
            }
        },
    };

    let response = MatchResponse::new(&pairing.room_id, &pairing.user_id, pairing.paired_at);
    send_text_within(sink.as_ref(), response.to_json()?, state.relay.send_timeout()).await?;
    info!(
        "[{}] Matched user {} into room {}",
        conn_id, pairing.user_id, pairing.room_id
    );

    // The client closes once it has the room id; reading to the end also
    // flushes our reply to its close frame.
    let drained = tokio::time::timeout(state.config.match_linger(), async {
        while let Some(Ok(_)) = reader.next().await {}
    })
    .await;
    if drained.is_err() {
        debug!("[{}] Client kept matchmaking socket open; closing", conn_id);
        close_gracefully(sink, reader, CloseStatus::Normal, "matched").await;
    }
    Ok(())
}

async fn run_signaling(
    state: &ServerState,
    conn_id: &str,
    sink: &SharedSink,
    reader: &mut WsReader,
    shutdown: &mut watch::Receiver<bool>,
    first: String,
) -> Result<(), SignalError> {
    let register = SignalingMessage::from_json(&first)?;
    if register.kind() != MessageKind::Register {
        return Err(SignalError::protocol(format!(
            "first message must be register, got {:?}",
            register.message_type()
        )));
    }
    let room_id = register
        .room_id()
        .ok_or_else(|| SignalError::protocol("register missing roomId"))?;
    if !validate_room_id(room_id) {
        return Err(SignalError::protocol("invalid roomId"));
    }

    // Rejection happens here, before any accept goes out
    let membership = state.registry.join(room_id, sink.clone())?;

    let accept = SignalingMessage::accept(&state.config.ice.servers, membership.is_existing_peer());
    send_message_within(sink.as_ref(), &accept, state.relay.send_timeout()).await?;
    debug!(
        "[{}] Registered {} in room {} (existing peer: {})",
        conn_id,
        membership.peer_id(),
        room_id,
        membership.is_existing_peer()
    );

    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => match state.relay.handle(&membership, text).await {
                    Ok(_) => {}
                    Err(SignalError::Protocol(reason)) => {
                        warn!("[{}] Skipping malformed message: {}", conn_id, reason);
                    }
                    Err(e) => {
                        warn!("[{}] Relay failed in room {}: {}", conn_id, membership.room_id(), e);
                    }
                },
                // Close frames are answered by the transport; keep reading until the stream ends
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("[{}] Read error: {}", conn_id, e);
                    break;
                }
                None => break,
            },
            _ = wait_for_shutdown(shutdown) => return Err(SignalError::Shutdown),
        }
    }

    drop(membership);
    Ok(())
}

/// Send a close frame, then give the client a moment to answer it
async fn close_gracefully(
    sink: &SharedSink,
    reader: &mut WsReader,
    status: CloseStatus,
    reason: &str,
) {
    if sink.close(status, reason).await.is_err() {
        return;
    }
    let _ = tokio::time::timeout(CLOSE_DRAIN, async {
        while let Some(Ok(_)) = reader.next().await {}
    })
    .await;
}

enum Sniffed {
    Upgrade,
    /// Plain HTTP request for this path
    Plain(String),
}

/// Tell a WebSocket upgrade apart from a plain HTTP request without consuming it
async fn sniff_request(stream: &TcpStream) -> std::io::Result<Sniffed> {
    let mut buf = [0u8; 2048];
    for _ in 0..SNIFF_ATTEMPTS {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(Sniffed::Upgrade);
        }
        let head = &buf[..n];
        if let Some(end) = head.windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok(classify_request_head(&head[..end]));
        }
        if n == buf.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Let the WebSocket handshake decide
    Ok(Sniffed::Upgrade)
}

fn classify_request_head(head: &[u8]) -> Sniffed {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let path = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    let upgrade = lines.any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.to_ascii_lowercase().contains("websocket")
        })
    });

    if upgrade {
        Sniffed::Upgrade
    } else {
        Sniffed::Plain(path)
    }
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    mut stream: TcpStream,
    path: &str,
    state: &ServerState,
) -> Result<(), std::io::Error> {
    // Consume the request head we peeked at
    let mut buf = vec![0u8; 2048];
    let _ = stream.read(&mut buf).await?;

    let rooms = state.registry.room_count();
    let peers = state.registry.peer_count();
    let waiting = state.pairing.waiting_count();

    let path = path.split('?').next().unwrap_or("/");
    let (status, body) = match path {
        "/health" => (
            "200 OK",
            format!(
                r#"{{"status":"healthy","rooms":{},"peers":{},"waiting":{}}}"#,
                rooms, peers, waiting
            ),
        ),
        "/stats" => (
            "200 OK",
            format!(r#"{{"rooms":{},"peers":{},"waiting":{}}}"#, rooms, peers, waiting),
        ),
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
