//! Multiplexed peer protocol (C1).
//!
//! One logical connection carries many channels, each identified by `channel_id`. A channel
//! opens with a [`Handshake`] exchange and then carries [`OverlayFrame`] request/response
//! pairs correlated by a caller-chosen `id`, generalized from a flat peer mesh to an
//! arbitrary number of concurrently open request channels per connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::dispatch::Dispatcher;
use crate::error::{GatewayError, GatewayResult};
use crate::wire::{Handshake, OverlayFrame, PeerRole, Telemetry};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Outbound half of a multiplexed connection: frames pushed here are serialized and sent
/// over the underlying byte stream by a dedicated writer task.
pub type FrameSender = mpsc::UnboundedSender<OverlayFrame>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("duplicate channel open")]
    DuplicateChannel,
    #[error("peer returned status {0}")]
    PeerError(u16),
}

impl From<TransportError> for GatewayError {
    fn from(e: TransportError) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

/// One multiplexed logical connection to a peer. Owns the outbound sender and a table of
/// in-flight request correlation slots; the read loop that feeds `pending` lives in `pool`.
pub struct MultiplexedConnection {
    pub frame_tx: FrameSender,
    pub local_handshake: Handshake,
    pub remote_handshake: tokio::sync::OnceCell<Handshake>,
    next_request_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<OverlayFrame>>,
    open_channels: DashMap<u64, ()>,
}

impl MultiplexedConnection {
    pub fn new(frame_tx: FrameSender, local_handshake: Handshake) -> Self {
        Self {
            frame_tx,
            local_handshake,
            remote_handshake: tokio::sync::OnceCell::new(),
            next_request_id: AtomicU64::new(1),
            pending: DashMap::new(),
            open_channels: DashMap::new(),
        }
    }

    /// Waits for the remote handshake to arrive, or times out per §4.1 B1.
    pub async fn await_handshake(&self) -> Result<(), TransportError> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            loop {
                if self.remote_handshake.get().is_some() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .map_err(|_| TransportError::HandshakeTimeout)
    }

    /// Registers a freshly-observed remote handshake; called by the read loop in `pool`.
    pub fn set_remote_handshake(&self, hs: Handshake) {
        let _ = self.remote_handshake.set(hs);
    }

    pub fn is_server(&self) -> bool {
        self.remote_handshake
            .get()
            .map(|h| !h.is_server)
            .unwrap_or(false)
    }

    pub fn remote_role(&self) -> Option<PeerRole> {
        self.remote_handshake.get().map(|h| h.role)
    }

    /// Opens a new logical channel, failing if `channel_id` is already open (a peer retrying
    /// a stale open should get back `DuplicateChannel` and reuse the original).
    pub fn open_channel(&self, channel_id: u64) -> Result<(), TransportError> {
        if self.open_channels.insert(channel_id, ()).is_some() {
            return Err(TransportError::DuplicateChannel);
        }
        Ok(())
    }

    pub fn close_channel(&self, channel_id: u64) {
        self.open_channels.remove(&channel_id);
    }

    /// Sends a `Request` frame and awaits its correlated `Response`.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> GatewayResult<(u16, HashMap<String, String>, Option<Vec<u8>>)> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let frame = OverlayFrame::Request {
            id,
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body,
        };
        if self.frame_tx.send(frame).is_err() {
            self.pending.remove(&id);
            return Err(TransportError::ConnectionClosed.into());
        }

        match rx.await {
            Ok(OverlayFrame::Response {
                status_code,
                headers,
                body,
                ..
            }) => {
                if status_code >= 400 {
                    return Err(TransportError::PeerError(status_code).into());
                }
                Ok((status_code, headers, body))
            }
            Ok(_) => Err(GatewayError::internal("unexpected frame in response slot")),
            Err(_) => Err(TransportError::ConnectionClosed.into()),
        }
    }

    /// Feeds an incoming `Response` frame to its waiting caller. Called from the read loop.
    pub fn complete_response(&self, id: u64, frame: OverlayFrame) {
        if let Some((_, tx)) = self.pending.remove(&id) {
            let _ = tx.send(frame);
        }
    }

    /// Sends a `HealthCheck` and awaits the correlated `HealthResponse`'s telemetry (§4.3/§4.6).
    /// Shares the `pending`/`complete_response` correlation table with `request`: probe ids and
    /// request ids are drawn from the same counter, so they never collide.
    pub async fn probe_health(&self) -> GatewayResult<Telemetry> {
        let probe_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(probe_id, tx);

        if self.frame_tx.send(OverlayFrame::HealthCheck { probe_id }).is_err() {
            self.pending.remove(&probe_id);
            return Err(TransportError::ConnectionClosed.into());
        }

        match rx.await {
            Ok(OverlayFrame::HealthResponse { telemetry, .. }) => Ok(telemetry),
            Ok(_) => Err(GatewayError::internal("unexpected frame in health probe slot")),
            Err(_) => Err(TransportError::ConnectionClosed.into()),
        }
    }

    /// Fails every pending request; called when the underlying stream closes. Dropping each
    /// oneshot sender turns the caller's pending `.await` into a `ConnectionClosed` error.
    pub fn fail_all_pending(&self) {
        self.pending.clear();
    }
}

/// Dials a peer's overlay WebSocket endpoint and returns an established, handshaked
/// connection: splits the stream, spawns a writer task draining `frame_rx` into the sink,
/// spawns a reader task dispatching incoming frames, and exchanges handshakes.
///
/// The reader loop feeds reported telemetry into `dispatcher` (so C6 scoring sees it) and
/// answers inbound `Request` frames through `router`, since the peer on the other end of this
/// same multiplexed connection may call back into us.
pub async fn dial_peer(
    url: &str,
    role: PeerRole,
    delegate_req_to_peers: bool,
    dispatcher: Arc<Dispatcher>,
    router: Arc<RequestRouter>,
) -> GatewayResult<Arc<MultiplexedConnection>> {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| GatewayError::Transport(format!("{e}: {url}")))?;
    let (mut ws_sink, mut ws_source) = ws_stream.split();

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<OverlayFrame>();
    let conn = Arc::new(MultiplexedConnection::new(frame_tx.clone(), local_handshake(role, delegate_req_to_peers)));

    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else { continue };
            if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let _ = frame_tx.send(OverlayFrame::Handshake(local_handshake(role, delegate_req_to_peers)));

    let reader_conn = conn.clone();
    let reply_tx = frame_tx.clone();
    tokio::spawn(async move {
        while let Some(msg) = ws_source.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    if let Ok(frame) = serde_json::from_str::<OverlayFrame>(&text) {
                        match &frame {
                            OverlayFrame::Handshake(hs) => reader_conn.set_remote_handshake(hs.clone()),
                            OverlayFrame::Response { id, .. } => {
                                reader_conn.complete_response(*id, frame.clone());
                            }
                            OverlayFrame::HealthResponse { probe_id, telemetry } => {
                                dispatcher.record_telemetry(telemetry.clone());
                                reader_conn.complete_response(*probe_id, frame.clone());
                            }
                            OverlayFrame::Request { id, path, headers, body, .. } => {
                                let (status_code, resp_body) = router.dispatch(path, headers.clone(), body.clone());
                                let _ = reply_tx.send(OverlayFrame::Response {
                                    id: *id,
                                    status_code,
                                    headers: HashMap::new(),
                                    body: resp_body,
                                });
                            }
                            _ => {}
                        }
                    }
                }
                Ok(WsMessage::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        reader_conn.fail_all_pending();
    });

    conn.await_handshake().await.map_err(GatewayError::from)?;
    Ok(conn)
}

/// Builds the local side's handshake payload.
pub fn local_handshake(role: PeerRole, delegate_req_to_peers: bool) -> Handshake {
    Handshake {
        version: "2.0".to_string(),
        is_server: matches!(role, PeerRole::Worker),
        role,
        capabilities: vec!["relay".to_string()],
        hyperbee_key: None,
        hyperbee_length: None,
        hyperbee_contiguous_length: None,
        delegate_req_to_peers,
    }
}

/// A minimal in-process request router for the server side of a channel, mirroring the
/// path-keyed dispatch table an axum `Router` uses, but for frames instead of HTTP. Routes
/// may contain `:name` segments (the peer RPC surface in §6.2 is templated, e.g.
/// `/drive/:identifier/:file`), so matching walks segment-by-segment rather than hashing the
/// whole path, and first-match wins in registration order.
pub struct RequestRouter {
    routes: Vec<(
        &'static str,
        Arc<dyn Fn(HashMap<String, String>, HashMap<String, String>, Option<Vec<u8>>) -> GatewayResult<(u16, Option<Vec<u8>>)> + Send + Sync>,
    )>,
}

impl RequestRouter {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn route<F>(&mut self, pattern: &'static str, handler: F)
    where
        F: Fn(HashMap<String, String>, HashMap<String, String>, Option<Vec<u8>>) -> GatewayResult<(u16, Option<Vec<u8>>)>
            + Send
            + Sync
            + 'static,
    {
        self.routes.push((pattern, Arc::new(handler)));
    }

    fn match_path(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
        let pattern_segs: Vec<&str> = pattern.trim_matches('/').split('/').collect();
        let path_segs: Vec<&str> = path.trim_matches('/').split('/').collect();
        if pattern_segs.len() != path_segs.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (p, a) in pattern_segs.iter().zip(path_segs.iter()) {
            if let Some(name) = p.strip_prefix(':') {
                params.insert(name.to_string(), a.to_string());
            } else if p != a {
                return None;
            }
        }
        Some(params)
    }

    /// Dispatches by path, passing captured `:name` segments as the first argument to the
    /// matched handler. Unknown paths get `status_code: 404`.
    pub fn dispatch(
        &self,
        path: &str,
        headers: HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> (u16, Option<Vec<u8>>) {
        for (pattern, handler) in &self.routes {
            if let Some(params) = Self::match_path(pattern, path) {
                return handler(params, headers, body).unwrap_or_else(|e| {
                    tracing::warn!(path, error = %e, "request handler failed");
                    (500, None)
                });
            }
        }
        (404, None)
    }
}

impl Default for RequestRouter {
    fn default() -> Self {
        Self::new()
    }
}
