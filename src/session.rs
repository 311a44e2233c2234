//! Gateway session core (C5): per-client WebSocket FSM.
//!
//! Splits the socket into a sender half drained by a dedicated task and a receive loop that
//! dispatches parsed client frames, with peer selection, subscription tracking, and delegated-
//! forwarding retry state held per session. `handle_frame` owns the REQ -> peer-forward ->
//! event-delivery -> EOSE path: a REQ is answered by calling out over the peer overlay
//! (falling back across every known peer before giving up), not by an immediate bare EOSE.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::app::AppState;
use crate::dispatch::Dispatcher;
use crate::error::{GatewayError, GatewayResult};
use crate::health::HealthManager;
use crate::wire::{ClientFrame, RelayEvent, ServerFrame, TokenStatus};

pub const DELEGATION_FALLBACK: Duration = Duration::from_millis(1500);
/// Retry budget for the delegated-forwarding fallback: drop a queued frame after N retries,
/// `<=` on both the enqueue count and the retry loop.
pub const DELEGATION_MAX_RETRIES: u32 = 5;
pub const EVENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Subscription {
    pub filters: serde_json::Value,
    pub last_returned_at: i64,
}

pub struct TokenClaims {
    pub pubkey: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
}

/// Verifies an HMAC-signed relay token via `hmac_util::verify`'s constant-time comparison. A
/// stub shared-secret scheme; production deployments can plug in a richer `TokenService`
/// behind the same signature.
pub fn verify_token(token: &str, secret: &str) -> Option<TokenClaims> {
    let mut parts = token.splitn(2, '.');
    let payload_b64 = parts.next()?;
    let sig_hex = parts.next()?;

    if !crate::hmac_util::verify(payload_b64.as_bytes(), sig_hex, secret) {
        return None;
    }

    use base64::Engine;
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .ok()?;
    let parsed: serde_json::Value = serde_json::from_slice(&payload).ok()?;
    let pubkey = parsed.get("pubkey")?.as_str()?.to_string();
    let scope = parsed.get("scope").and_then(|v| v.as_str()).unwrap_or("read").to_string();
    let expires_at = parsed
        .get("exp")
        .and_then(|v| v.as_i64())
        .and_then(|ts| DateTime::from_timestamp(ts, 0))?;
    if expires_at < Utc::now() {
        return None;
    }
    Some(TokenClaims { pubkey, scope, expires_at })
}

/// Everything pushed to the client's WebSocket sender task: either a frame to serialize, or a
/// request to close the socket with a specific code (§6.1), e.g. on token revocation.
pub enum OutboundMessage {
    Frame(ServerFrame),
    Close { code: u16, reason: String },
}

pub struct GatewaySession {
    pub connection_key: String,
    pub relay_key: String,
    peers: std::sync::RwLock<Vec<String>>,
    peer_index: AtomicUsize,
    pub subscriptions: DashMap<String, Subscription>,
    pending_delegated: std::sync::Mutex<VecDeque<(ClientFrame, u32, Instant)>>,
    pub local_only: std::sync::atomic::AtomicBool,
    delegate_req_to_peers: std::sync::atomic::AtomicBool,
    token_pubkey: std::sync::RwLock<Option<String>>,
    closed: std::sync::atomic::AtomicBool,
    pub outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl GatewaySession {
    pub fn new(
        relay_key: String,
        peers: Vec<String>,
        delegate_req_to_peers: bool,
        token_pubkey: Option<String>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        let local_only = peers.is_empty();
        Self {
            connection_key: random_connection_key(),
            relay_key,
            peers: std::sync::RwLock::new(peers),
            peer_index: AtomicUsize::new(0),
            subscriptions: DashMap::new(),
            pending_delegated: std::sync::Mutex::new(VecDeque::new()),
            local_only: std::sync::atomic::AtomicBool::new(local_only),
            delegate_req_to_peers: std::sync::atomic::AtomicBool::new(delegate_req_to_peers),
            token_pubkey: std::sync::RwLock::new(token_pubkey),
            closed: std::sync::atomic::AtomicBool::new(false),
            outbound,
        }
    }

    pub fn set_peers(&self, peers: Vec<String>) {
        let was_empty = self.peers.read().unwrap().is_empty();
        *self.peers.write().unwrap() = peers.clone();
        if was_empty && !peers.is_empty() {
            self.local_only.store(false, Ordering::SeqCst);
        }
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.read().unwrap().clone()
    }

    pub fn delegate_req_to_peers(&self) -> bool {
        self.delegate_req_to_peers.load(Ordering::SeqCst)
    }

    pub fn token_pubkey(&self) -> Option<String> {
        self.token_pubkey.read().unwrap().clone()
    }

    /// Advances round-robin state and returns the next candidate peer, using the dispatcher's
    /// score-based selection when telemetry is available (§4.5/§4.6 integration).
    pub fn select_peer(&self, dispatcher: &Dispatcher, health: &HealthManager) -> Option<String> {
        let peers = self.peers();
        if peers.is_empty() {
            return None;
        }
        if let Some(picked) = dispatcher.select_peer(&peers, health) {
            return Some(picked);
        }
        let idx = self.peer_index.fetch_add(1, Ordering::SeqCst) % peers.len();
        let eligible: Vec<&String> = peers.iter().filter(|p| health.is_selectable(p)).collect();
        if eligible.is_empty() {
            return None;
        }
        Some(eligible[idx % eligible.len()].clone())
    }

    pub fn send(&self, frame: ServerFrame) {
        let _ = self.outbound.send(OutboundMessage::Frame(frame));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Forces session termination with a WebSocket close code (§6.1). The sender task picks
    /// this up and sends the close frame before tearing down the socket.
    pub fn force_close(&self, code: u16, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(OutboundMessage::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn register_subscription(&self, sub_id: String, filters: serde_json::Value) {
        self.subscriptions.insert(
            sub_id,
            Subscription {
                filters,
                last_returned_at: 0,
            },
        );
    }

    pub fn close_subscription(&self, sub_id: &str) {
        self.subscriptions.remove(sub_id);
    }

    /// Advances `last_returned_at` past the newest event observed, deduplicated by caller.
    pub fn advance_subscription(&self, sub_id: &str, newest_created_at: i64) {
        if let Some(mut sub) = self.subscriptions.get_mut(sub_id) {
            if newest_created_at > sub.last_returned_at {
                sub.last_returned_at = newest_created_at;
            }
        }
    }

    /// Enqueues a frame for delegated-forwarding retry; drops it once the retry budget is
    /// exhausted (§9: N=5, `<=` on both ends).
    pub fn enqueue_delegated(&self, frame: ClientFrame) {
        let mut queue = self.pending_delegated.lock().unwrap();
        queue.push_back((frame, 0, Instant::now()));
    }

    pub fn drain_delegated_for_retry(&self) -> Vec<ClientFrame> {
        let mut queue = self.pending_delegated.lock().unwrap();
        let mut ready = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some((frame, attempts, enqueued_at)) = queue.pop_front() {
            if attempts <= DELEGATION_MAX_RETRIES {
                ready.push(frame.clone());
                remaining.push_back((frame, attempts + 1, enqueued_at));
            }
            // attempts > DELEGATION_MAX_RETRIES: dropped, per the fixed retry budget.
        }
        *queue = remaining;
        ready
    }

    /// Drains queued frames that have sat longer than `DELEGATION_FALLBACK` without a peer
    /// appearing, leaving fresher ones queued.
    pub fn take_delegation_fallbacks(&self) -> Vec<ClientFrame> {
        let mut queue = self.pending_delegated.lock().unwrap();
        let mut fallen_back = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some((frame, attempts, enqueued_at)) = queue.pop_front() {
            if enqueued_at.elapsed() >= DELEGATION_FALLBACK {
                fallen_back.push(frame);
            } else {
                remaining.push_back((frame, attempts, enqueued_at));
            }
        }
        *queue = remaining;
        fallen_back
    }
}

fn random_connection_key() -> String {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    hex::encode(bytes)
}

/// Close codes for the `/:a/:b` WebSocket upgrade, per §6.1.
pub mod close_code {
    pub const UNKNOWN_RELAY: u16 = 4404;
    pub const AUTH_REQUIRED: u16 = 4403;
    pub const NO_PEERS: u16 = 1013;
    pub const INTERNAL: u16 = 1011;
}

/// Parses the `/{a}/{b}` path into a canonical relay key, following §4.5's URL convention.
pub fn parse_relay_key(a: &str, b: &str) -> Option<String> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    Some(format!("{}:{}", a, b))
}

/// Dispatches a Nostr-shaped client frame (§4.5). `Req` drives the REQ -> peer-forward ->
/// event-delivery -> EOSE path; everything else is handled locally.
pub async fn handle_frame(state: &Arc<AppState>, session: &Arc<GatewaySession>, frame: ClientFrame) {
    match frame {
        ClientFrame::Req { sub_id, filters } => {
            session.register_subscription(sub_id.clone(), filters.clone());
            forward_req(state, session, &sub_id, &filters).await;
        }
        ClientFrame::Close { sub_id } => {
            session.close_subscription(&sub_id);
        }
        ClientFrame::Event { event } => {
            session.send(ServerFrame::Ok {
                id: event.id,
                accepted: false,
                message: "error: public gateway relay is read-only".to_string(),
            });
        }
        ClientFrame::Count { sub_id, .. } => {
            session.send(ServerFrame::Count { sub_id, count: 0 });
        }
        ClientFrame::Ping => {
            session.send(ServerFrame::Pong);
        }
    }
}

/// Forwards a REQ to a live peer, retrying across every known peer on failure (up to
/// `len(peers)` attempts, per §4.5) before giving up with a `NOTICE` and an `EOSE`. The
/// session stays open either way. With no peers at all, falls into the delegated-forwarding
/// queue when the relay allows it, or answers with a bare `EOSE`.
async fn forward_req(state: &Arc<AppState>, session: &Arc<GatewaySession>, sub_id: &str, filters: &serde_json::Value) {
    let peers = session.peers();
    if peers.is_empty() {
        if session.delegate_req_to_peers() {
            session.enqueue_delegated(ClientFrame::Req {
                sub_id: sub_id.to_string(),
                filters: filters.clone(),
            });
        } else {
            session.send(ServerFrame::Eose { sub_id: sub_id.to_string() });
        }
        return;
    }

    for _ in 0..peers.len() {
        let Some(peer) = session.select_peer(&state.dispatcher, &state.health) else {
            break;
        };
        match forward_req_to_peer(state, session, &peer, sub_id, filters).await {
            Ok(events) => {
                deliver_events(session, sub_id, events);
                session.send(ServerFrame::Eose { sub_id: sub_id.to_string() });
                return;
            }
            Err(e) => {
                tracing::debug!(peer = %peer, sub_id, error = %e, "peer REQ forward failed, trying next peer");
            }
        }
    }
    session.send(ServerFrame::Notice {
        message: "no peers could serve this subscription".to_string(),
    });
    session.send(ServerFrame::Eose { sub_id: sub_id.to_string() });
}

/// Forwards one REQ to `peer` over its overlay connection (`POST /post/relay/{relay_key}`,
/// §6.2) and parses the NDJSON event array response.
async fn forward_req_to_peer(
    state: &Arc<AppState>,
    session: &GatewaySession,
    peer: &str,
    sub_id: &str,
    filters: &serde_json::Value,
) -> GatewayResult<Vec<RelayEvent>> {
    let conn = state.peer_connection(peer).await?;
    let path = format!("/post/relay/{}", session.relay_key);
    let body = serde_json::to_vec(&serde_json::json!(["REQ", sub_id, filters])).map_err(GatewayError::internal)?;
    let (_status, _headers, body) = conn.request("POST", &path, HashMap::new(), Some(body)).await?;
    Ok(parse_ndjson_events(body.unwrap_or_default()))
}

/// Fetches events held for this session's connection key (`GET /get/relay/{relay_key}/{connection_key}`,
/// §6.2), trying each known peer in turn until one answers.
async fn fetch_pending_events(
    state: &Arc<AppState>,
    session: &GatewaySession,
    peer: &str,
) -> GatewayResult<Vec<RelayEvent>> {
    let conn = state.peer_connection(peer).await?;
    let path = format!("/get/relay/{}/{}", session.relay_key, session.connection_key);
    let (_status, _headers, body) = conn.request("GET", &path, HashMap::new(), None).await?;
    Ok(parse_ndjson_events(body.unwrap_or_default()))
}

fn parse_ndjson_events(bytes: Vec<u8>) -> Vec<RelayEvent> {
    let text = String::from_utf8_lossy(&bytes);
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<RelayEvent>(line).ok())
        .collect()
}

/// Polls every active subscription once for newly available events (§5: one timer task per
/// session, ~1s). Tried against each known peer in turn; the first to answer wins.
pub async fn poll_events(state: &Arc<AppState>, session: &Arc<GatewaySession>) {
    let sub_ids: Vec<String> = session.subscriptions.iter().map(|e| e.key().clone()).collect();
    for sub_id in sub_ids {
        for peer in session.peers() {
            match fetch_pending_events(state, session, &peer).await {
                Ok(events) if !events.is_empty() => {
                    deliver_events(session, &sub_id, events);
                    break;
                }
                Ok(_) => break,
                Err(e) => {
                    tracing::debug!(peer = %peer, sub_id, error = %e, "event poll failed, trying next peer");
                }
            }
        }
    }
}

/// Flushes the delegated-forwarding queue: retries now that a peer is available, or, if one
/// still isn't, falls back (no local replica ships in production, so that's always a
/// `NOTICE`, per §4.5/§1's scoping of the hyperbee engine to the caller).
pub async fn flush_delegated(state: &Arc<AppState>, session: &Arc<GatewaySession>) {
    if session.peers().is_empty() {
        for frame in session.take_delegation_fallbacks() {
            if let ClientFrame::Req { sub_id, .. } = frame {
                session.send(ServerFrame::Notice {
                    message: format!("subscription {sub_id} fell back with no local replica available"),
                });
            }
        }
        return;
    }
    for frame in session.drain_delegated_for_retry() {
        if let ClientFrame::Req { sub_id, filters } = frame {
            forward_req(state, session, &sub_id, &filters).await;
        }
    }
}

/// Pushes newly observed events to the client and advances the subscription watermark,
/// deduping by id and enforcing monotone `created_at` delivery (§8 I2).
pub fn deliver_events(session: &GatewaySession, sub_id: &str, mut events: Vec<RelayEvent>) {
    events.sort_by_key(|e| e.created_at);
    let mut seen = std::collections::HashSet::new();
    let mut newest = 0i64;
    for event in events {
        if !seen.insert(event.id.clone()) {
            continue;
        }
        newest = newest.max(event.created_at);
        session.send(ServerFrame::Event {
            sub_id: sub_id.to_string(),
            event,
        });
    }
    if newest > 0 {
        session.advance_subscription(sub_id, newest);
    }
}

/// Broadcasts a token revocation to the client and force-closes the session with 4403
/// (§4.5: "Token check via TokenService, revocation broadcasts... + closes with 4403").
pub fn notify_token_revoked(session: &GatewaySession, reason: &str, sequence: u64) {
    session.send(ServerFrame::Token {
        status: TokenStatus::Revoked,
        reason: Some(reason.to_string()),
        sequence: Some(sequence),
    });
    session.force_close(close_code::AUTH_REQUIRED, reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(peers: Vec<String>) -> GatewaySession {
        let (tx, _rx) = mpsc::unbounded_channel();
        GatewaySession::new("relay:1".into(), peers, false, None, tx)
    }

    #[test]
    fn test_parse_relay_key() {
        assert_eq!(parse_relay_key("a", "b"), Some("a:b".to_string()));
        assert_eq!(parse_relay_key("", "b"), None);
    }

    #[test]
    fn test_local_only_when_no_peers() {
        let s = session(vec![]);
        assert!(s.local_only.load(Ordering::SeqCst));
        s.set_peers(vec!["peerA".into()]);
        assert!(!s.local_only.load(Ordering::SeqCst));
    }

    #[test]
    fn test_select_peer_round_robin_without_telemetry() {
        let s = session(vec!["a".into(), "b".into()]);
        let dispatcher = Dispatcher::default();
        let health = HealthManager::new();
        let first = s.select_peer(&dispatcher, &health);
        let second = s.select_peer(&dispatcher, &health);
        assert!(first.is_some());
        assert!(second.is_some());
    }

    #[test]
    fn test_select_peer_none_when_empty() {
        let s = session(vec![]);
        let dispatcher = Dispatcher::default();
        let health = HealthManager::new();
        assert_eq!(s.select_peer(&dispatcher, &health), None);
    }

    #[test]
    fn test_close_removes_subscription() {
        let s = session(vec!["a".into()]);
        s.register_subscription("s1".into(), serde_json::json!({}));
        assert!(s.subscriptions.contains_key("s1"));
        s.close_subscription("s1");
        assert!(!s.subscriptions.contains_key("s1"));
    }

    #[test]
    fn test_req_with_no_peers_and_no_delegation_enqueues_nothing() {
        let s = session(vec![]);
        s.enqueue_delegated(ClientFrame::Ping);
        assert_eq!(s.drain_delegated_for_retry().len(), 1);
    }

    #[test]
    fn test_deliver_events_dedups_and_orders() {
        let s = session(vec!["a".into()]);
        s.register_subscription("s1".into(), serde_json::json!({}));
        let events = vec![
            RelayEvent { id: "b".into(), created_at: 200, rest: serde_json::json!({}) },
            RelayEvent { id: "a".into(), created_at: 100, rest: serde_json::json!({}) },
            RelayEvent { id: "a".into(), created_at: 100, rest: serde_json::json!({}) },
        ];
        deliver_events(&s, "s1", events);
        let sub = s.subscriptions.get("s1").unwrap();
        assert_eq!(sub.last_returned_at, 200);
    }

    #[test]
    fn test_delegation_retry_budget_drops_after_n() {
        let s = session(vec![]);
        s.enqueue_delegated(ClientFrame::Ping);
        for _ in 0..=DELEGATION_MAX_RETRIES {
            let ready = s.drain_delegated_for_retry();
            if ready.is_empty() {
                break;
            }
        }
        assert!(s.drain_delegated_for_retry().is_empty());
    }

    #[test]
    fn test_force_close_sets_closed_and_sends_close_message() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let s = GatewaySession::new("relay:1".into(), vec![], false, None, tx);
        assert!(!s.is_closed());
        s.force_close(close_code::AUTH_REQUIRED, "token revoked");
        assert!(s.is_closed());
        match rx.try_recv().unwrap() {
            OutboundMessage::Close { code, .. } => assert_eq!(code, close_code::AUTH_REQUIRED),
            _ => panic!("expected a close message"),
        }
    }

    #[test]
    fn test_notify_token_revoked_sends_frame_then_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let s = GatewaySession::new("relay:1".into(), vec![], false, Some("pk".into()), tx);
        notify_token_revoked(&s, "rotated", 3);
        match rx.try_recv().unwrap() {
            OutboundMessage::Frame(ServerFrame::Token { status, sequence, .. }) => {
                assert_eq!(status, TokenStatus::Revoked);
                assert_eq!(sequence, Some(3));
            }
            _ => panic!("expected a Token frame first"),
        }
        match rx.try_recv().unwrap() {
            OutboundMessage::Close { code, .. } => assert_eq!(code, close_code::AUTH_REQUIRED),
            _ => panic!("expected a close message after the Token frame"),
        }
        assert!(s.is_closed());
    }

    #[test]
    fn test_token_pubkey_roundtrip() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let s = GatewaySession::new("relay:1".into(), vec![], false, Some("npub123".into()), tx);
        assert_eq!(s.token_pubkey(), Some("npub123".to_string()));
    }

    #[test]
    fn test_parse_ndjson_events_skips_blank_and_invalid_lines() {
        let bytes = b"{\"id\":\"a\",\"created_at\":1}\n\n not json \n{\"id\":\"b\",\"created_at\":2}\n".to_vec();
        let events = parse_ndjson_events(bytes);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "a");
        assert_eq!(events[1].id, "b");
    }
}
