//! End-to-end scenario tests driving the dispatch core directly, using
//! an in-memory fake transport (an `mpsc` channel) instead of a real
//! WebSocket handshake. The dispatch core is transport-agnostic (see
//! `GatewayServer::dispatch`), so these scenarios exercise exactly the
//! same code path a live axum socket would.
//!
//! Run with: `cargo test --test scenarios_test`

use bytes::Bytes;
use pulsegate::config::Config;
use pulsegate::pool::{AcquireOutcome, PersistentPool, PoolConfig, PoolError};
use pulsegate::quality::Quality;
use pulsegate::server::{ConnectionState, GatewayServer};
use pulsegate::session::{OutboundFrame, OutboundHandle};
use pulsegate::codec::Message;
use tokio::sync::mpsc;

fn gateway() -> GatewayServer {
    GatewayServer::new(Config::default_for_test())
}

fn fake_transport() -> (ConnectionState, mpsc::Receiver<OutboundFrame>) {
    let (tx, rx) = mpsc::channel(32);
    (ConnectionState::new(OutboundHandle::new(tx)), rx)
}

/// S1 — basic round trip: Connect then Data surfaces the message and
/// updates `connectedClients`/`messagesReceived`.
#[test]
fn s1_basic_round_trip() {
    let gw = gateway();
    let (mut ctx, _rx) = fake_transport();

    gw.dispatch(
        &mut ctx,
        Message::Connect {
            session_id: "s1".to_string(),
            client_version: "1.0.0".to_string(),
        },
        "127.0.0.1",
        0,
    );
    gw.dispatch(
        &mut ctx,
        Message::Data {
            payload: Bytes::from_static(&[0x01, 0x02, 0x03]),
            message_id: 1,
            timestamp: 1000,
        },
        "127.0.0.1",
        1,
    );

    assert_eq!(gw.connected_clients(), 1);
    assert_eq!(gw.messages_received(), 2);
}

/// S2 — a second Connect under the same session id is rejected with
/// 409 and the connected-client count is unaffected.
#[test]
fn s2_duplicate_session_is_rejected() {
    let gw = gateway();
    let (mut ctx1, _rx1) = fake_transport();
    gw.dispatch(
        &mut ctx1,
        Message::Connect {
            session_id: "s1".to_string(),
            client_version: "1.0.0".to_string(),
        },
        "127.0.0.1",
        0,
    );

    let (mut ctx2, mut rx2) = fake_transport();
    gw.dispatch(
        &mut ctx2,
        Message::Connect {
            session_id: "s1".to_string(),
            client_version: "1.0.0".to_string(),
        },
        "127.0.0.2",
        1,
    );

    assert_eq!(gw.connected_clients(), 1);
    match rx2.try_recv().expect("expected an error frame") {
        OutboundFrame::Message(Message::Error { code, message }) => {
            assert_eq!(code, 409);
            assert_eq!(message, "Session already connected");
        }
        other => panic!("expected 409 error frame, got {other:?}"),
    }
}

/// S3 — suspend and resume: a message sent while suspended is buffered
/// and replayed, in order, on reconnect.
#[test]
fn s3_suspend_then_resume_replays_buffer_in_order() {
    let gw = gateway();
    let (mut ctx1, _rx1) = fake_transport();
    gw.dispatch(
        &mut ctx1,
        Message::Connect {
            session_id: "s1".to_string(),
            client_version: "1.0.0".to_string(),
        },
        "127.0.0.1",
        0,
    );

    // Abrupt transport close (not an explicit Disconnect frame): the
    // session moves to suspended and keeps no transport handle.
    gw.detach_session("s1", "transport closed", 1);
    assert_eq!(gw.attached_session_count(), 0);
    assert_eq!(gw.suspended_session_count(), 1);

    let sent = gw.broadcast(
        &Message::Data {
            payload: Bytes::from_static(&[0xAA]),
            message_id: 1,
            timestamp: 2,
        },
        None,
    );
    assert_eq!(sent, 0, "no attached recipients at broadcast time");
    // Broadcast only reaches attached sessions; deliver directly to the
    // suspended one so it lands in its replay buffer instead.
    let buffered = gw.send_to_session(
        "s1",
        Message::Data {
            payload: Bytes::from_static(&[0xAA]),
            message_id: 1,
            timestamp: 2,
        },
    );
    assert!(buffered);

    let (mut ctx2, mut rx2) = fake_transport();
    gw.dispatch(
        &mut ctx2,
        Message::Reconnect {
            session_id: "s1".to_string(),
        },
        "127.0.0.1",
        3,
    );

    assert_eq!(gw.attached_session_count(), 1);
    assert_eq!(gw.suspended_session_count(), 0);
    match rx2.try_recv().expect("expected replayed data frame") {
        OutboundFrame::Message(Message::Data { payload, .. }) => {
            assert_eq!(payload.as_ref(), &[0xAA]);
        }
        other => panic!("expected replayed Data frame, got {other:?}"),
    }
}

/// S4 — adaptive interval under sustained poor latency bottoms out at
/// the configured minimum.
#[test]
fn s4_adaptive_interval_under_poor_quality() {
    let min_hb = 5_000;
    let max_hb = 60_000;
    let mut current = 30_000;
    let mut quality = Quality::initialize(10);

    for ms in [800, 900, 1200, 1500, 2000] {
        quality.record_latency(ms, 0);
        current = quality.next_interval(current, min_hb, max_hb);
    }

    assert!(quality.score < 0.5);
    assert_eq!(current, min_hb);
}

/// S5 — under pool saturation with at least one idle entry, the LRU
/// idle entry (not the most-recently-touched one) is evicted.
#[test]
fn s5_pool_lru_eviction_picks_oldest_idle_entry() {
    let pool = PersistentPool::new(PoolConfig {
        max_connections: 3,
        default_idle_timeout_ms: 120_000,
    });

    pool.acquire("a", 0).unwrap();
    pool.acquire("b", 1).unwrap();
    pool.acquire("c", 2).unwrap();
    pool.mark_idle("a", 10);
    pool.mark_idle("b", 11);
    pool.mark_idle("c", 12);

    assert_eq!(pool.acquire("a", 20).unwrap(), AcquireOutcome::Reused);
    assert_eq!(pool.acquire("d", 30).unwrap(), AcquireOutcome::Created);

    assert!(pool.entry("b").is_none());
    assert!(pool.entry("a").is_some());
    assert!(pool.entry("c").is_some());
    assert!(pool.entry("d").is_some());
}

/// Companion to S5: saturation with zero idle entries fails the
/// acquire without closing any active entry.
#[test]
fn pool_saturation_with_no_idle_victims_fails_cleanly() {
    let pool = PersistentPool::new(PoolConfig {
        max_connections: 2,
        default_idle_timeout_ms: 120_000,
    });
    pool.acquire("a", 0).unwrap();
    pool.acquire("b", 0).unwrap();
    assert_eq!(pool.acquire("c", 0), Err(PoolError::Full));
    assert_eq!(pool.len(), 2);
}

/// S6 — the JSON text fallback: a `{"type":"heartbeat"}` frame gets a
/// `heartbeat_response` reply and bumps the session's `last_heartbeat`.
#[test]
fn s6_json_fallback_heartbeat_gets_text_reply() {
    let gw = gateway();
    // Negotiate text mode the way the real socket loop does: the first
    // inbound frame's opcode (Text) flips this connection to text mode.
    let (tx2, mut rx2) = mpsc::channel(32);
    let mut ctx = ConnectionState::with_text_mode(OutboundHandle::new(tx2), true);

    gw.dispatch(
        &mut ctx,
        Message::Connect {
            session_id: "s1".to_string(),
            client_version: "1.0.0".to_string(),
        },
        "127.0.0.1",
        0,
    );
    gw.dispatch(&mut ctx, Message::Heartbeat { timestamp: 123 }, "127.0.0.1", 456);

    let frame = rx2.try_recv().expect("expected a heartbeat_response frame");
    match frame {
        OutboundFrame::RawText(text) => {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], "heartbeat_response");
            assert_eq!(value["timestamp"], 456);
        }
        other => panic!("expected raw text heartbeat_response, got {other:?}"),
    }
}
