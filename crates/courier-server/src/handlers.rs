//! Connection handlers for Courier server.
//!
//! Each WebSocket goes through three phases:
//!
//! 1. Handshake: the first event must be `connect` with a compatible version
//!    and a token the authenticator accepts. Its frame type (text or binary)
//!    fixes the encoding used for every reply.
//! 2. Session: outbound events from the session sink and inbound frames from
//!    the socket are multiplexed until either side goes away.
//! 3. Teardown: the session manager is told the connection is gone.

use crate::config::{Config, HeartbeatConfig};
use crate::metrics::{self, ActiveSession};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use courier_core::{Authenticator, ConnectionId, DurableStore, Outbound, PubSub, Session, SessionManager};
use courier_protocol::{
    codec::{self, encode_with},
    codes, ClientEvent, Encoding, ProtocolError, ServerEvent, WireFrame, PROTOCOL_VERSION,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    pub sessions: SessionManager,
    pub authenticator: Arc<dyn Authenticator>,
    pub store: Arc<dyn DurableStore>,
    pub config: Config,
    connections: AtomicUsize,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        sessions: SessionManager,
        authenticator: Arc<dyn Authenticator>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            sessions,
            authenticator,
            store,
            config,
            connections: AtomicUsize::new(0),
        }
    }
}

/// Why a handshake was refused.
#[derive(Debug, Error)]
enum HandshakeError {
    #[error("the first event must be connect")]
    NotConnect,

    #[error("unsupported protocol version {0}")]
    Version(u8),

    #[error("authentication failed")]
    Auth(#[from] courier_core::AuthError),

    #[error("no connect event within the handshake timeout")]
    Timeout,

    #[error("connection closed during handshake")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl HandshakeError {
    fn code(&self) -> u16 {
        match self {
            HandshakeError::Version(_) | HandshakeError::Protocol(_) => codes::VALIDATION,
            _ => codes::UNAUTHENTICATED,
        }
    }
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = state.config.clone();

    if let Err(e) = metrics::install(&config.metrics) {
        error!("Failed to start metrics exporter: {}", e);
    }

    let purge = tokio::spawn(purge_expired(state.clone()));

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state.clone());

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    purge.abort();
    state.sessions.shutdown();
    info!("Courier server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Periodically drop expired queue and presence entries.
async fn purge_expired(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(state.config.storage.purge_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match state.store.purge_expired().await {
            Ok(0) => {}
            Ok(count) => {
                metrics::record_purged(count);
                debug!(count, "Purged expired entries");
            }
            Err(e) => {
                metrics::record_error("store");
                warn!(error = %e, "Failed to purge expired entries");
            }
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sessions.router().stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": state.connections.load(Ordering::Relaxed),
        "online_users": state.sessions.registry().len(),
        "rooms": stats.room_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Convert an encoded frame into a WebSocket message.
fn to_ws_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text),
        WireFrame::Binary(data) => Message::Binary(data.to_vec()),
    }
}

/// Encode and send one event directly on the socket.
async fn send_event(sender: &mut WsSender, encoding: Encoding, event: &ServerEvent) -> Result<()> {
    let frame = encode_with(encoding, event)?;
    metrics::record_event(event.name(), frame.len(), "outbound");
    sender.send(to_ws_message(frame)).await?;
    Ok(())
}

/// Decode the client events carried by one WebSocket message.
///
/// Binary data is appended to `buffer` and may contain zero or more complete
/// MessagePack frames.
fn decode_inbound(message: Message, buffer: &mut BytesMut) -> Result<Vec<ClientEvent>, ProtocolError> {
    match message {
        Message::Text(text) => Ok(vec![codec::decode_text(&text)?]),
        Message::Binary(data) => {
            buffer.extend_from_slice(&data);
            let mut events = Vec::new();
            while let Some(event) = codec::decode_from(buffer)? {
                events.push(event);
            }
            Ok(events)
        }
        _ => Ok(Vec::new()),
    }
}

/// Wait for the `connect` event and authenticate it.
async fn handshake(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    state: &AppState,
) -> Result<(String, Encoding), (HandshakeError, Encoding)> {
    let mut buffer = BytesMut::new();

    let (event, encoding) = loop {
        let message = match receiver.next().await {
            Some(Ok(message)) => message,
            Some(Err(_)) | None => return Err((HandshakeError::Closed, Encoding::Json)),
        };
        let encoding = match &message {
            Message::Text(_) => Encoding::Json,
            Message::Binary(_) => Encoding::MessagePack,
            Message::Close(_) => return Err((HandshakeError::Closed, Encoding::Json)),
            _ => continue,
        };
        let mut events =
            decode_inbound(message, &mut buffer).map_err(|e| (HandshakeError::Protocol(e), encoding))?;
        if !events.is_empty() {
            break (events.swap_remove(0), encoding);
        }
    };

    let ClientEvent::Connect { version, token } = event else {
        return Err((HandshakeError::NotConnect, encoding));
    };

    PROTOCOL_VERSION
        .negotiate(version)
        .ok_or((HandshakeError::Version(version), encoding))?;

    let user_id = state
        .authenticator
        .authenticate(&token)
        .await
        .map_err(|e| (HandshakeError::Auth(e), encoding))?;

    Ok((user_id, encoding))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let active = state.connections.fetch_add(1, Ordering::Relaxed) + 1;
    let _slot = ConnectionSlot(&state.connections);
    if active > state.config.limits.max_connections {
        warn!(active, "Connection limit reached");
        metrics::record_error("connection_limit");
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    let handshake_timeout = state.config.heartbeat.handshake_timeout();
    let outcome = match tokio::time::timeout(handshake_timeout, handshake(&mut receiver, &state)).await {
        Ok(outcome) => outcome,
        Err(_) => Err((HandshakeError::Timeout, Encoding::Json)),
    };

    let (user_id, encoding) = match outcome {
        Ok(accepted) => accepted,
        Err((e, encoding)) => {
            debug!(error = %e, "Handshake rejected");
            metrics::record_handshake_rejected(match e {
                HandshakeError::Auth(_) => "invalid_token",
                HandshakeError::Version(_) => "version",
                HandshakeError::Timeout => "timeout",
                _ => "protocol",
            });
            if !matches!(e, HandshakeError::Closed) {
                let _ = send_event(&mut sender, encoding, &ServerEvent::error(e.code(), e.to_string())).await;
                let _ = sender.send(Message::Close(None)).await;
            }
            return;
        }
    };

    let _active = ActiveSession::start();
    let connection_id = ConnectionId::generate();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();

    // `connected` goes through the sink so it precedes any queued replay.
    let _ = tx.send(Arc::new(ServerEvent::Connected {
        connection_id: connection_id.to_string(),
        user_id: user_id.clone(),
        version: PROTOCOL_VERSION.major,
        heartbeat: heartbeat_millis(&state.config.heartbeat),
    }));

    let session = match state.sessions.connect(&user_id, connection_id, tx).await {
        Ok(session) => session,
        Err(e) => {
            warn!(user = %user_id, error = %e, "Session rejected");
            metrics::record_error("session");
            let _ = send_event(&mut sender, encoding, &e.to_event()).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    metrics::set_rooms(state.sessions.router().stats().room_count);

    run_session(&session, encoding, sender, receiver, rx, &state).await;

    state.sessions.disconnect(&session).await;
    metrics::set_rooms(state.sessions.router().stats().room_count);
}

/// Multiplex outbound events and inbound frames until either side closes.
async fn run_session(
    session: &Session,
    encoding: Encoding,
    mut sender: WsSender,
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    state: &AppState,
) {
    let connection_id = &session.connection_id;
    let heartbeat = &state.config.heartbeat;
    let mut ping = tokio::time::interval(heartbeat.interval());
    ping.reset();
    let mut last_seen = Instant::now();
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            event = outbound.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = send_event(&mut sender, encoding, &event).await {
                    debug!(connection = %connection_id, error = %e, "Send failed");
                    break;
                }
            }

            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => state.sessions.touch(session).await,
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Ok(message)) => {
                        let start = Instant::now();
                        let size = match &message {
                            Message::Text(text) => text.len(),
                            Message::Binary(data) => data.len(),
                            _ => 0,
                        };

                        match decode_inbound(message, &mut read_buffer) {
                            Ok(events) => {
                                for event in events {
                                    metrics::record_event(event.name(), size, "inbound");
                                    state.sessions.handle(session, event).await;
                                }
                            }
                            Err(e) => {
                                warn!(connection = %connection_id, error = %e, "Undecodable frame");
                                metrics::record_error("decode");
                                read_buffer.clear();
                                state.sessions.router().send_to(
                                    connection_id,
                                    ServerEvent::error(codes::VALIDATION, format!("Invalid event: {}", e)),
                                );
                            }
                        }

                        metrics::record_handle_time(start.elapsed().as_secs_f64());
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if last_seen.elapsed() > heartbeat.timeout() {
                    info!(connection = %connection_id, "Heartbeat timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// Heartbeat interval as announced in `connected`, saturating at `u32::MAX`.
fn heartbeat_millis(heartbeat: &HeartbeatConfig) -> u32 {
    u32::try_from(heartbeat.interval_ms).unwrap_or(u32::MAX)
}

/// Releases a connection slot on drop.
struct ConnectionSlot<'a>(&'a AtomicUsize);

impl Drop for ConnectionSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
