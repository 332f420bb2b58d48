//! Server core (C5).
//!
//! Accepts upgrades, dispatches inbound frames, drives the heartbeat
//! and cleanup timers, and enforces the admission/security limits.
//! Wires C1 (codec), C2 (quality), C3 (pool), and C4 (session manager)
//! together behind a single axum router.

pub mod security;

use crate::codec::{self, CodecError, FrameHint, Message};
use crate::config::Config;
use crate::error::GatewayError;
use crate::pool::{PersistentPool, PoolConfig, PoolError};
use crate::quality::RecommendedAction;
use crate::session::{
    GatewayEvents, OutboundFrame, OutboundHandle, SessionError, SessionManager,
    SessionManagerConfig,
};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use security::{extract_client_ip, SecurityState};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default event sink for the standalone binary: every lifecycle event
/// becomes a structured log line. Library consumers that need
/// application-visible events can implement [`GatewayEvents`] themselves.
struct LoggingEvents;

impl GatewayEvents for LoggingEvents {
    fn on_connection(&self, session_id: &str) {
        info!(session_id, "connection");
    }
    fn on_disconnection(&self, session_id: &str, reason: &str) {
        info!(session_id, reason, "disconnection");
    }
    fn on_message(&self, session_id: &str, payload: bytes::Bytes, message_id: u64, timestamp: u64) {
        debug!(session_id, message_id, timestamp, bytes = payload.len(), "message");
    }
    fn on_error(&self, err: &str) {
        warn!(error = err, "gateway error");
    }
}

#[derive(Default)]
struct Metrics {
    connected_clients: AtomicU64,
    messages_received: AtomicU64,
}

/// The gateway server instance. Owns the session manager, the
/// persistent pool, and the security state; all mutable state lives
/// here — multiple instances in one process are independent.
pub struct GatewayServer {
    config: Config,
    session_manager: SessionManager,
    pool: PersistentPool,
    security: SecurityState,
    metrics: Metrics,
    shutting_down: AtomicBool,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayServer {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let session_manager = SessionManager::new(
            SessionManagerConfig {
                latency_window: config.latency_window_size,
                heartbeat_interval_ms: config.heartbeat_interval_ms,
                session_timeout_ms: config.session_timeout_ms,
                max_buffered_messages: config.max_buffered_messages,
                max_buffered_bytes: config.max_buffered_bytes,
                buffering_enabled: true,
            },
            Arc::new(LoggingEvents),
        );
        let pool = PersistentPool::new(PoolConfig {
            max_connections: config.max_connections,
            default_idle_timeout_ms: config.idle_timeout_ms,
        });
        let security = SecurityState::from_config(&config);

        Self {
            config,
            session_manager,
            pool,
            security,
            metrics: Metrics::default(),
            shutting_down: AtomicBool::new(false),
            background: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Start the heartbeat and cleanup timers. Call once after wrapping
    /// the server in an `Arc`.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let heartbeat = self.clone();
        let heartbeat_handle = tokio::spawn(async move { heartbeat.heartbeat_loop().await });

        let cleanup = self.clone();
        let cleanup_handle = tokio::spawn(async move { cleanup.cleanup_loop().await });

        self.background.lock().unwrap().extend([heartbeat_handle, cleanup_handle]);
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        // Scheduling granularity: the global ticker polls for due sessions
        // at `quality_check_interval_ms`, while each session only actually
        // gets pinged/evaluated once its own `adaptive_heartbeat_interval`
        // (seeded from `heartbeat_interval_ms`) has elapsed.
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
            self.config.quality_check_interval_ms.max(1),
        ));
        loop {
            ticker.tick().await;
            if self.shutting_down.load(Ordering::Relaxed) {
                return;
            }
            let now = now_ms();
            for session_id in self.session_manager.attached_ids() {
                self.heartbeat_tick_for(&session_id, now);
            }
        }
    }

    /// Recompute a session's adaptive heartbeat interval from its current
    /// quality score. A no-op when adaptive heartbeating is disabled,
    /// in which case the interval stays pinned at the nominal
    /// `heartbeat_interval_ms` regardless of sampled quality.
    fn apply_adaptive_interval(&self, session: &mut crate::session::Session) {
        if !self.config.adaptive_heartbeat_enabled {
            session.adaptive_heartbeat_interval = self.config.heartbeat_interval_ms;
            return;
        }
        session.adaptive_heartbeat_interval = session.quality.next_interval(
            session.adaptive_heartbeat_interval,
            self.config.min_heartbeat_interval_ms,
            self.config.max_heartbeat_interval_ms,
        );
        if session.connection_score < self.config.connection_quality_threshold {
            debug!(
                session_id = %session.session_id,
                score = session.connection_score,
                "connection quality below configured threshold"
            );
        }
    }

    /// Evaluate a single session on a global heartbeat tick, gated by
    /// that session's own adaptive interval: the global ticker provides
    /// the scheduling granularity, but a session is only pinged/evaluated
    /// once its own `adaptive_heartbeat_interval` has actually elapsed.
    fn heartbeat_tick_for(&self, session_id: &str, now: u64) {
        let mut disconnect = false;
        let mut ping_due = false;

        self.session_manager.with_attached_mut(session_id, |session| {
            let gate = session.last_ping_time.max(session.last_heartbeat);
            if now.saturating_sub(gate) < session.adaptive_heartbeat_interval {
                return;
            }

            if !session.is_alive {
                session.missed_heartbeats += 1;
                session.quality.record_missed_heartbeat(now);
                session.connection_score = session.quality.score;
                self.apply_adaptive_interval(session);
                if session.quality.recommended_action() == RecommendedAction::Disconnect {
                    disconnect = true;
                    return;
                }
            }

            session.is_alive = false;
            session.last_ping_time = now;
            ping_due = true;
        });

        if disconnect {
            self.force_disconnect(session_id, "connection_quality");
        } else if ping_due {
            self.session_manager.send_frame(session_id, OutboundFrame::Ping);
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let interval_ms = (self.config.session_timeout_ms / 2).max(1);
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
        loop {
            ticker.tick().await;
            if self.shutting_down.load(Ordering::Relaxed) {
                return;
            }
            let now = now_ms();
            let expired = self.session_manager.expire_timed_out(now);
            if !expired.is_empty() {
                debug!(count = expired.len(), "expired suspended sessions");
            }
            self.pool.expire_idle(now);
        }
    }

    fn force_disconnect(&self, session_id: &str, reason: &str) {
        self.session_manager.send_frame(
            session_id,
            OutboundFrame::Close {
                code: 1000,
                reason: reason.to_string(),
            },
        );
        self.session_manager.detach(session_id, reason, now_ms());
    }

    /// Close all attached sessions and stop the timers.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.session_manager.close_all("server shutdown");
    }

    /// Number of currently attached sessions.
    #[must_use]
    pub fn connected_clients(&self) -> u64 {
        self.metrics.connected_clients.load(Ordering::Relaxed)
    }

    /// Total inbound messages dispatched (of any kind) since startup.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.metrics.messages_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn attached_session_count(&self) -> usize {
        self.session_manager.attached_count()
    }

    #[must_use]
    pub fn suspended_session_count(&self) -> usize {
        self.session_manager.suspended_count()
    }

    #[must_use]
    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.stats()
    }

    /// Informational pool-optimization recommendations (see
    /// [`crate::pool::PersistentPool::advisor`]). Never mutates state.
    #[must_use]
    pub fn pool_advisor(&self) -> crate::pool::OptimizationAdvice {
        self.pool.advisor()
    }

    /// Simulate an abrupt transport close for `session_id`: moves it
    /// from attached to suspended, per the Detach transition in the
    /// session lifecycle. Exposed so tests can exercise suspend/resume
    /// without a real socket disconnect.
    pub fn detach_session(&self, session_id: &str, reason: &str, now_ms: u64) {
        self.session_manager.detach(session_id, reason, now_ms);
    }

    /// Send a payload to a specific session: directly if attached,
    /// buffered (bounded) if suspended, `false` otherwise. See
    /// [`crate::session::SessionManager::send_to`].
    pub fn send_to_session(&self, session_id: &str, message: Message) -> bool {
        self.session_manager.send_to(session_id, message)
    }

    /// Best-effort broadcast to all attached sessions.
    pub fn broadcast(&self, message: &Message, exclude: Option<&str>) -> usize {
        self.session_manager.broadcast(message, exclude)
    }

    /// Dispatch one decoded inbound [`Message`] against `ctx`'s connection
    /// state. Transport-agnostic: the real axum socket loop and
    /// integration tests using a fake in-memory transport both route
    /// through this single entry point.
    pub fn dispatch(&self, ctx: &mut ConnectionState, message: Message, ip: &str, now: u64) {
        self.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
        match message {
            Message::Connect {
                session_id,
                client_version,
            } => {
                info!(session_id, client_version, "connect request");
                if let Err(PoolError::Full) = self.pool.acquire(ip, now) {
                    warn!(ip, "pool at capacity, refusing connect");
                    ctx.transport.send(OutboundFrame::Close {
                        code: 1013,
                        reason: "server at capacity".to_string(),
                    });
                    return;
                }
                match self
                    .session_manager
                    .connect(&session_id, ctx.transport.clone(), now)
                {
                    Ok(()) => {
                        self.metrics.connected_clients.fetch_add(1, Ordering::Relaxed);
                        ctx.session_id = Some(session_id);
                    }
                    Err(err @ SessionError::DuplicateSession { .. }) => {
                        ctx.send(Message::Error {
                            code: GatewayError::from(err).wire_code(),
                            message: "Session already connected".to_string(),
                        });
                    }
                    Err(_) => {}
                }
            }
            Message::Reconnect { session_id } => {
                // C3 is consulted on connect *and* reconnect (§2/§4.3): this
                // reactivates the client's pool entry (or creates one if it
                // aged out of the pool entirely) so reuse accounting and
                // idle state stay correct across a resume.
                if let Err(PoolError::Full) = self.pool.acquire(ip, now) {
                    warn!(ip, "pool at capacity, refusing reconnect");
                    ctx.transport.send(OutboundFrame::Close {
                        code: 1013,
                        reason: "server at capacity".to_string(),
                    });
                    return;
                }
                match self
                    .session_manager
                    .reconnect(&session_id, ctx.transport.clone(), now)
                {
                    Ok(_replayed) => {
                        self.metrics.connected_clients.fetch_add(1, Ordering::Relaxed);
                        ctx.session_id = Some(session_id);
                    }
                    Err(err @ SessionError::NotFound { .. }) => {
                        ctx.send(Message::Error {
                            code: GatewayError::from(err).wire_code(),
                            message: "Session not found".to_string(),
                        });
                    }
                    Err(_) => {}
                }
            }
            Message::Disconnect { reason } => {
                if let Some(session_id) = ctx.session_id.take() {
                    self.session_manager.disconnect_frame(&session_id, &reason);
                    self.metrics.connected_clients.fetch_sub(1, Ordering::Relaxed);
                    self.pool.mark_idle(ip, now);
                }
            }
            Message::Data {
                payload,
                message_id,
                timestamp,
            } => {
                let Some(session_id) = ctx.session_id.as_deref() else {
                    ctx.send(Message::Error {
                        code: GatewayError::from(SessionError::NotAuthenticated).wire_code(),
                        message: "not authenticated".to_string(),
                    });
                    return;
                };
                if self.config.environment.is_production() {
                    if let Err(rejection) = self.security.check_data_frame(ip, payload.len(), now) {
                        warn!(ip, reason = %rejection, "security rejected data frame");
                        return;
                    }
                }
                self.session_manager
                    .record_data(session_id, payload, message_id, timestamp);
            }
            Message::Heartbeat { timestamp } => {
                let Some(session_id) = ctx.session_id.clone() else {
                    return;
                };
                self.session_manager.with_attached_mut(&session_id, |session| {
                    session.last_heartbeat = now;
                    let _ = timestamp;
                });
                if ctx.text_mode {
                    let reply = serde_json::json!({
                        "type": "heartbeat_response",
                        "timestamp": now,
                    })
                    .to_string();
                    ctx.transport.send(OutboundFrame::RawText(reply));
                }
            }
            Message::Error { .. } => {
                // Clients don't normally send Error frames inbound; dropped silently.
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, ip: String) {
        let (mut ws_sink, mut ws_stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<OutboundFrame>(self.config.buffer_size.clamp(16, 4096));
        let transport = OutboundHandle::new(tx);

        let text_mode = Arc::new(AtomicBool::new(false));

        let mut ctx = ConnectionState {
            session_id: None,
            text_mode: false,
            transport: transport.clone(),
        };

        let writer_text_mode = text_mode.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text_mode = writer_text_mode.load(Ordering::Relaxed);
                let ws_message = match frame {
                    OutboundFrame::Message(message) => {
                        if text_mode {
                            WsMessage::Text(codec::encode_text(&message).into())
                        } else {
                            WsMessage::Binary(codec::encode_binary(&message).into())
                        }
                    }
                    OutboundFrame::Ping => WsMessage::Ping(Vec::new().into()),
                    OutboundFrame::RawText(text) => WsMessage::Text(text.into()),
                    OutboundFrame::Close { code, reason } => {
                        WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                            code,
                            reason: reason.into(),
                        }))
                    }
                };
                if ws_sink.send(ws_message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(next) = ws_stream.next().await {
            let ws_message = match next {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "websocket read error");
                    break;
                }
            };

            match ws_message {
                WsMessage::Binary(bytes) => {
                    ctx.text_mode = false;
                    text_mode.store(false, Ordering::Relaxed);
                    self.handle_frame(&mut ctx, &bytes, FrameHint::Binary, &ip);
                }
                WsMessage::Text(text) => {
                    ctx.text_mode = true;
                    text_mode.store(true, Ordering::Relaxed);
                    // The text fallback never needs zero-copy payload access
                    // (JSON parsing copies regardless), so a plain copy here
                    // is fine rather than threading `Utf8Bytes` through.
                    let bytes = bytes::Bytes::copy_from_slice(text.as_bytes());
                    self.handle_frame(&mut ctx, &bytes, FrameHint::Text, &ip);
                }
                WsMessage::Pong(_) => {
                    if let Some(session_id) = ctx.session_id.clone() {
                        let now = now_ms();
                        self.session_manager.with_attached_mut(&session_id, |session| {
                            if session.last_ping_time > 0 {
                                let latency = now.saturating_sub(session.last_ping_time);
                                session.quality.record_latency(latency, now);
                            }
                            session.quality.reset_missed(now);
                            session.missed_heartbeats = 0;
                            session.connection_score = session.quality.score;
                            self.apply_adaptive_interval(session);
                            session.is_alive = true;
                            session.last_ping_time = 0;
                        });
                    }
                }
                WsMessage::Ping(_) | WsMessage::Close(_) => {
                    break;
                }
            }
        }

        writer.abort();
        if let Some(session_id) = ctx.session_id.take() {
            self.session_manager.detach(&session_id, "transport closed", now_ms());
            self.metrics.connected_clients.fetch_sub(1, Ordering::Relaxed);
        }
        self.pool.mark_idle(&ip, now_ms());
    }

    /// Decode and dispatch a raw inbound frame, honoring `hint` as the
    /// transport's opcode classification (see [`FrameHint`]). `bytes` is
    /// a `Bytes` handle rather than a borrowed slice so the binary path
    /// can split `Data.payload` off it without copying.
    pub fn handle_frame(&self, ctx: &mut ConnectionState, bytes: &bytes::Bytes, hint: FrameHint, ip: &str) {
        if !self.security.payload_within_bounds(bytes.len()) {
            let err = CodecError::MessageTooLarge(bytes.len());
            ctx.send(Message::Error {
                code: GatewayError::from(err.clone()).wire_code(),
                message: err.to_string(),
            });
            return;
        }
        match codec::decode(bytes, hint) {
            Ok(message) => self.dispatch(ctx, message, ip, now_ms()),
            Err(err) => {
                ctx.send(Message::Error {
                    code: GatewayError::from(err.clone()).wire_code(),
                    message: err.to_string(),
                });
            }
        }
    }
}

/// One connection's dispatch-local state: which session (if any) it has
/// attached to, whether it negotiated the text fallback, and its
/// outbound transport handle. Exposed so integration tests can drive
/// [`GatewayServer::dispatch_frame`] against a fake in-memory transport
/// without a real WebSocket handshake.
pub struct ConnectionState {
    session_id: Option<String>,
    text_mode: bool,
    transport: OutboundHandle,
}

impl ConnectionState {
    #[must_use]
    pub fn new(transport: OutboundHandle) -> Self {
        Self {
            session_id: None,
            text_mode: false,
            transport,
        }
    }

    #[must_use]
    pub fn with_text_mode(transport: OutboundHandle, text_mode: bool) -> Self {
        Self {
            session_id: None,
            text_mode,
            transport,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn send(&self, message: Message) {
        self.transport.send(OutboundFrame::Message(message));
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<GatewayServer>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = extract_client_ip(&headers, addr, false);

    if let Err(rejection) = gateway.security.admit_upgrade(&headers) {
        warn!(%ip, reason = %rejection, "upgrade rejected");
        return (StatusCode::FORBIDDEN, rejection.to_string()).into_response();
    }

    let ip_string = ip.to_string();
    let ws = ws.max_message_size(gateway.config.security.max_payload_bytes);
    ws.on_upgrade(move |socket| async move { gateway.handle_socket(socket, ip_string).await })
}

/// Build the axum router exposing the single `/ws` upgrade endpoint.
#[must_use]
pub fn router(gateway: Arc<GatewayServer>) -> Router {
    Router::new()
        .route("/ws", get(upgrade_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn server() -> Arc<GatewayServer> {
        Arc::new(GatewayServer::new(Config::default_for_test()))
    }

    fn handle() -> (OutboundHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(16);
        (OutboundHandle::new(tx), rx)
    }

    /// S1 — basic round trip: Connect then Data increments stats and
    /// surfaces the message through the event surface.
    #[test]
    fn connect_then_data_dispatches_message() {
        let gw = server();
        let (transport, _rx) = handle();
        let mut ctx = ConnectionState {
            session_id: None,
            text_mode: false,
            transport,
        };

        gw.dispatch(
            &mut ctx,
            Message::Connect {
                session_id: "s1".to_string(),
                client_version: "1.0.0".to_string(),
            },
            "127.0.0.1",
            0,
        );
        assert_eq!(ctx.session_id.as_deref(), Some("s1"));

        gw.dispatch(
            &mut ctx,
            Message::Data {
                payload: bytes::Bytes::from_static(&[1, 2, 3]),
                message_id: 1,
                timestamp: 1000,
            },
            "127.0.0.1",
            1,
        );

        assert_eq!(gw.connected_clients(), 1);
        // Connect + Data: messages_received counts every dispatched inbound
        // frame, not just Data frames (spec.md §8 S1).
        assert_eq!(gw.messages_received(), 2);
    }

    /// S2 — duplicate session connect is rejected with 409 and does not
    /// change the connected-client count.
    #[test]
    fn duplicate_connect_is_rejected() {
        let gw = server();
        let (t1, _rx1) = handle();
        let mut ctx1 = ConnectionState {
            session_id: None,
            text_mode: false,
            transport: t1,
        };
        gw.dispatch(
            &mut ctx1,
            Message::Connect {
                session_id: "s1".to_string(),
                client_version: "1.0.0".to_string(),
            },
            "127.0.0.1",
            0,
        );

        let (t2, mut rx2) = handle();
        let mut ctx2 = ConnectionState {
            session_id: None,
            text_mode: false,
            transport: t2,
        };
        gw.dispatch(
            &mut ctx2,
            Message::Connect {
                session_id: "s1".to_string(),
                client_version: "1.0.0".to_string(),
            },
            "127.0.0.1",
            1,
        );

        assert_eq!(gw.connected_clients(), 1);
        match rx2.try_recv().unwrap() {
            OutboundFrame::Message(Message::Error { code, .. }) => assert_eq!(code, 409),
            _ => panic!("expected 409 error frame"),
        }
    }

    /// S6 — JSON fallback: a text-mode heartbeat gets a `heartbeat_response`
    /// reply with no corresponding `Message` kind, and bumps `last_heartbeat`.
    #[test]
    fn text_mode_heartbeat_gets_heartbeat_response_reply() {
        let gw = server();
        let (transport, mut rx) = handle();
        let mut ctx = ConnectionState {
            session_id: None,
            text_mode: true,
            transport,
        };

        gw.dispatch(
            &mut ctx,
            Message::Connect {
                session_id: "s1".to_string(),
                client_version: "1.0.0".to_string(),
            },
            "127.0.0.1",
            0,
        );
        rx.try_recv().unwrap_err(); // Connect itself produces no reply

        gw.dispatch(&mut ctx, Message::Heartbeat { timestamp: 123 }, "127.0.0.1", 456);

        match rx.try_recv().unwrap() {
            OutboundFrame::RawText(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "heartbeat_response");
                assert_eq!(value["timestamp"], 456);
            }
            _ => panic!("expected raw text heartbeat_response"),
        }

        gw.session_manager.with_attached_mut("s1", |session| {
            assert_eq!(session.last_heartbeat, 456);
        });
    }
}
