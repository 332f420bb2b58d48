//! Session manager (C4).
//!
//! Owns the per-session lifecycle (connect → active → suspended →
//! resumed/expired), the outbound replay buffer, and broadcast. Sessions
//! and transports are modeled as an arena of ids: the manager looks
//! sessions up by session id and never holds a transport by pointer
//! across tasks (see `GatewayEvents` below for the narrow event surface
//! this dispatches on).

use crate::codec::Message;
use crate::quality::Quality;
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already connected: {session_id}")]
    DuplicateSession { session_id: String },
    #[error("session not found: {session_id}")]
    NotFound { session_id: String },
    #[error("not authenticated")]
    NotAuthenticated,
}

/// A single outbound send slot for a transport. Bounded and non-blocking:
/// a full queue or a closed transport both surface as a failed send,
/// never a block (see the concurrency model's cancellation rule).
#[derive(Clone)]
pub struct OutboundHandle {
    sender: mpsc::Sender<OutboundFrame>,
}

#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Message(Message),
    /// Transport-level WebSocket ping, not an application frame.
    Ping,
    /// A pre-encoded text reply sent verbatim, bypassing the codec.
    /// Used for replies with no corresponding `Message` kind, such as
    /// the JSON fallback's `heartbeat_response`.
    RawText(String),
    Close { code: u16, reason: String },
}

impl OutboundHandle {
    #[must_use]
    pub fn new(sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self { sender }
    }

    /// Enqueue a frame. Returns `false` if the transport's outbound
    /// queue is full or the receiver has gone away.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        self.sender.try_send(frame).is_ok()
    }
}

/// One buffered outbound message held for a suspended session.
#[derive(Debug, Clone)]
struct BufferedMessage {
    message: Message,
    approx_bytes: usize,
}

fn approx_size(message: &Message) -> usize {
    match message {
        Message::Data { payload, .. } => payload.len() + 24,
        Message::Connect { session_id, client_version } => session_id.len() + client_version.len() + 8,
        Message::Reconnect { session_id } => session_id.len() + 8,
        Message::Disconnect { reason } => reason.len() + 8,
        Message::Heartbeat { .. } => 16,
        Message::Error { message, .. } => message.len() + 8,
    }
}

/// Per-session state, per §3 of the data model.
pub struct Session {
    pub session_id: String,
    pub last_message_id: u64,
    pub connected_at: u64,
    pub last_heartbeat: u64,
    pub is_alive: bool,
    suspension_buffer: VecDeque<BufferedMessage>,
    buffered_bytes: usize,
    pub overflow_drops: u64,
    pub quality: Quality,
    pub last_ping_time: u64,
    pub missed_heartbeats: u32,
    pub adaptive_heartbeat_interval: u64,
    pub connection_score: f64,
}

impl Session {
    fn new(session_id: String, now_ms: u64, latency_window: usize, heartbeat_interval: u64) -> Self {
        Self {
            session_id,
            last_message_id: 0,
            connected_at: now_ms,
            last_heartbeat: now_ms,
            is_alive: true,
            suspension_buffer: VecDeque::new(),
            buffered_bytes: 0,
            overflow_drops: 0,
            quality: Quality::initialize(latency_window),
            last_ping_time: 0,
            missed_heartbeats: 0,
            adaptive_heartbeat_interval: heartbeat_interval,
            connection_score: 1.0,
        }
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.suspension_buffer.len()
    }

    fn enqueue_buffered(&mut self, message: Message, max_messages: usize, max_bytes: usize) -> bool {
        let size = approx_size(&message);
        self.suspension_buffer.push_back(BufferedMessage {
            message,
            approx_bytes: size,
        });
        self.buffered_bytes += size;

        while self.suspension_buffer.len() > max_messages || self.buffered_bytes > max_bytes {
            if let Some(dropped) = self.suspension_buffer.pop_front() {
                self.buffered_bytes -= dropped.approx_bytes;
                self.overflow_drops += 1;
            } else {
                break;
            }
        }
        true
    }

    fn drain_buffer(&mut self) -> Vec<Message> {
        self.buffered_bytes = 0;
        self.suspension_buffer.drain(..).map(|b| b.message).collect()
    }
}

struct Attached {
    session: Session,
    transport: OutboundHandle,
}

struct Suspended {
    session: Session,
    suspended_at: u64,
}

/// Narrow capability object the embedder implements, dispatched
/// synchronously from the session manager instead of a dynamic
/// listener registry.
pub trait GatewayEvents: Send + Sync {
    fn on_connection(&self, session_id: &str);
    fn on_disconnection(&self, session_id: &str, reason: &str);
    fn on_message(&self, session_id: &str, payload: Bytes, message_id: u64, timestamp: u64);
    fn on_error(&self, err: &str);
}

/// Buffering policy and heartbeat bounds the manager needs to enforce
/// invariants independent of the rest of the gateway configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionManagerConfig {
    pub latency_window: usize,
    pub heartbeat_interval_ms: u64,
    pub session_timeout_ms: u64,
    pub max_buffered_messages: usize,
    pub max_buffered_bytes: usize,
    pub buffering_enabled: bool,
}

pub struct SessionManager {
    config: SessionManagerConfig,
    attached: DashMap<String, Attached>,
    suspended: DashMap<String, Suspended>,
    events: Arc<dyn GatewayEvents>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: SessionManagerConfig, events: Arc<dyn GatewayEvents>) -> Self {
        Self {
            config,
            attached: DashMap::new(),
            suspended: DashMap::new(),
            events,
        }
    }

    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.attached.len()
    }

    #[must_use]
    pub fn suspended_count(&self) -> usize {
        self.suspended.len()
    }

    #[must_use]
    pub fn is_attached(&self, session_id: &str) -> bool {
        self.attached.contains_key(session_id)
    }

    /// Create a fresh session on an inbound `Connect`. Fails with
    /// `DuplicateSession` if the id is already attached. A stale
    /// suspended entry under the same id is discarded: Connect always
    /// starts a new session, unlike Reconnect.
    pub fn connect(
        &self,
        session_id: &str,
        transport: OutboundHandle,
        now_ms: u64,
    ) -> Result<(), SessionError> {
        if self.attached.contains_key(session_id) {
            return Err(SessionError::DuplicateSession {
                session_id: session_id.to_string(),
            });
        }
        self.suspended.remove(session_id);

        let session = Session::new(
            session_id.to_string(),
            now_ms,
            self.config.latency_window,
            self.config.heartbeat_interval_ms,
        );
        self.attached
            .insert(session_id.to_string(), Attached { session, transport });
        self.events.on_connection(session_id);
        Ok(())
    }

    /// Reattach a transport to a suspended session, replaying its
    /// buffer in FIFO order ahead of any new outbound sends.
    pub fn reconnect(
        &self,
        session_id: &str,
        transport: OutboundHandle,
        now_ms: u64,
    ) -> Result<Vec<Message>, SessionError> {
        let Some((_, mut suspended)) = self.suspended.remove(session_id) else {
            return Err(SessionError::NotFound {
                session_id: session_id.to_string(),
            });
        };
        let replay = suspended.session.drain_buffer();
        suspended.session.last_heartbeat = now_ms;

        for message in &replay {
            transport.send(OutboundFrame::Message(message.clone()));
        }

        self.attached.insert(
            session_id.to_string(),
            Attached {
                session: suspended.session,
                transport,
            },
        );
        self.events.on_connection(session_id);
        Ok(replay)
    }

    /// Move an attached session to suspended after an abrupt transport
    /// close. The session keeps no transport handle while suspended.
    pub fn detach(&self, session_id: &str, reason: &str, now_ms: u64) {
        if let Some((_, attached)) = self.attached.remove(session_id) {
            self.suspended.insert(
                session_id.to_string(),
                Suspended {
                    session: attached.session,
                    suspended_at: now_ms,
                },
            );
            self.events.on_disconnection(session_id, reason);
        }
    }

    /// Handle an explicit `Disconnect` frame: closed immediately, no
    /// buffering, no suspension.
    pub fn disconnect_frame(&self, session_id: &str, reason: &str) {
        if self.attached.remove(session_id).is_some() {
            self.events.on_disconnection(session_id, reason);
        }
    }

    /// Send to a specific session: directly if attached, buffered (bounded)
    /// if suspended and buffering is enabled, `false` otherwise.
    pub fn send_to(&self, session_id: &str, message: Message) -> bool {
        if let Some(attached) = self.attached.get(session_id) {
            return attached.transport.send(OutboundFrame::Message(message));
        }
        if !self.config.buffering_enabled {
            return false;
        }
        if let Some(mut suspended) = self.suspended.get_mut(session_id) {
            return suspended.session.enqueue_buffered(
                message,
                self.config.max_buffered_messages,
                self.config.max_buffered_bytes,
            );
        }
        false
    }

    /// Send a raw outbound frame (e.g. a transport-level ping or close)
    /// directly to an attached session's transport. `false` if not attached
    /// or the transport's queue rejected it.
    pub fn send_frame(&self, session_id: &str, frame: OutboundFrame) -> bool {
        self.attached
            .get(session_id)
            .is_some_and(|a| a.transport.send(frame))
    }

    /// Best-effort broadcast to all attached sessions, excluding `exclude`
    /// if given. Returns the number of successful sends.
    #[must_use]
    pub fn broadcast(&self, message: &Message, exclude: Option<&str>) -> usize {
        let mut sent = 0;
        for entry in &self.attached {
            if exclude == Some(entry.key().as_str()) {
                continue;
            }
            if entry.value().transport.send(OutboundFrame::Message(message.clone())) {
                sent += 1;
            }
        }
        sent
    }

    /// Expire suspended sessions whose `last_heartbeat + session_timeout`
    /// has elapsed. Returns the removed session ids.
    pub fn expire_timed_out(&self, now_ms: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .suspended
            .iter()
            .filter(|e| {
                now_ms.saturating_sub(e.value().suspended_at) >= self.config.session_timeout_ms
            })
            .map(|e| e.key().clone())
            .collect();
        for id in &expired {
            self.suspended.remove(id);
        }
        expired
    }

    /// Record an inbound data sample, bumping `last_message_id` and
    /// surfacing the payload to the embedder via `on_message`.
    pub fn record_data(&self, session_id: &str, payload: Bytes, message_id: u64, timestamp: u64) {
        if let Some(mut attached) = self.attached.get_mut(session_id) {
            attached.session.last_message_id = attached.session.last_message_id.max(message_id);
        }
        self.events.on_message(session_id, payload, message_id, timestamp);
    }

    /// Run `f` against the attached session's mutable state, e.g. for
    /// heartbeat bookkeeping. No-op if the session isn't attached.
    pub fn with_attached_mut<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.attached.get_mut(session_id).map(|mut a| f(&mut a.session))
    }

    /// Snapshot of every currently attached session id (for the
    /// heartbeat timer's iteration).
    #[must_use]
    pub fn attached_ids(&self) -> Vec<String> {
        self.attached.iter().map(|e| e.key().clone()).collect()
    }

    /// Close every attached session for shutdown, bypassing suspension.
    pub fn close_all(&self, reason: &str) {
        let ids: Vec<String> = self.attached.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, attached)) = self.attached.remove(&id) {
                attached.transport.send(OutboundFrame::Close {
                    code: 1000,
                    reason: reason.to_string(),
                });
                self.events.on_disconnection(&id, reason);
            }
        }
    }
}

/// Mint a server-originated `message_id`: monotone within a session
/// modulo clock moves, not globally unique across sessions.
#[must_use]
pub fn mint_message_id(now_ms: u64) -> u64 {
    let jitter = rand::thread_rng().gen_range(0..1000);
    now_ms * 1000 + jitter
}
