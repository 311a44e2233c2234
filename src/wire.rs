//! Wire types shared by the gateway session layer and the overlay transport.
//!
//! Nostr events are treated as opaque JSON; we never parse their fields beyond `id` and
//! `created_at`, both needed for ordering and dedup (§8 I2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client-submitted filter set, forwarded to peers verbatim.
pub type Filters = Value;

/// An opaque Nostr-shaped event. Only the fields the gateway needs to order and dedup
/// events are typed; everything else rides along in `rest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEvent {
    pub id: String,
    pub created_at: i64,
    #[serde(flatten)]
    pub rest: Value,
}

/// Frames exchanged between a client and the gateway's session core over the `/:a/:b`
/// WebSocket. Mirrors the verb-first array shape of Nostr client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "UPPERCASE")]
pub enum ClientFrame {
    Req { sub_id: String, filters: Filters },
    Close { sub_id: String },
    Event { event: RelayEvent },
    Count { sub_id: String, filters: Filters },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "UPPERCASE")]
pub enum ServerFrame {
    Event { sub_id: String, event: RelayEvent },
    Eose { sub_id: String },
    Ok { id: String, accepted: bool, message: String },
    Count { sub_id: String, count: u64 },
    Notice { message: String },
    Pong,
    Token { status: TokenStatus, reason: Option<String>, sequence: Option<u64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Revoked,
}

/// Frames carried over a peer-to-peer overlay channel (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverlayFrame {
    Handshake(Handshake),
    Request {
        id: u64,
        method: String,
        path: String,
        #[serde(default)]
        headers: std::collections::HashMap<String, String>,
        body: Option<Vec<u8>>,
    },
    Response {
        id: u64,
        status_code: u16,
        #[serde(default)]
        headers: std::collections::HashMap<String, String>,
        body: Option<Vec<u8>>,
    },
    WsFrame {
        channel_id: u64,
        payload: Vec<u8>,
    },
    HealthCheck {
        probe_id: u64,
    },
    HealthResponse {
        probe_id: u64,
        telemetry: Telemetry,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub version: String,
    pub is_server: bool,
    pub role: PeerRole,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub hyperbee_key: Option<String>,
    pub hyperbee_length: Option<u64>,
    pub hyperbee_contiguous_length: Option<u64>,
    #[serde(default)]
    pub delegate_req_to_peers: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Worker,
    Gateway,
}

/// Telemetry a worker reports over `HealthResponse`, consumed by the dispatcher (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    pub peer_id: String,
    pub latency_ms: f64,
    pub in_flight_jobs: u32,
    pub failure_rate: f64,
    pub hyperbee_version: u64,
    pub hyperbee_lag: u64,
    pub queue_depth: u32,
    pub reported_at: DateTime<Utc>,
}
