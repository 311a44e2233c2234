//! HTTP/WebSocket router assembly: `Router::new().route(...).layer(CorsLayer, TraceLayer)`.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app::AppState;
use crate::error::GatewayError;
use crate::escrow::{EscrowPayload, UnlockEvidence};
use crate::session::{self, close_code, GatewaySession, OutboundMessage};
use crate::wire::ClientFrame;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/.well-known/hypertuna-gateway-secret", get(gateway_secret_handler))
        .route("/api/relays", post(register_relay_handler))
        .route("/api/relays/:relay_key", delete(unregister_relay_handler))
        .route("/api/relay-tokens/issue", post(issue_token_handler))
        .route("/api/relay-tokens/refresh", post(refresh_token_handler))
        .route("/api/relay-tokens/revoke", post(revoke_token_handler))
        .route("/api/escrow/deposit", post(escrow_deposit_handler))
        .route("/api/escrow/:escrow_id/unlock", post(escrow_unlock_handler))
        .route("/api/escrow/:escrow_id/revoke", post(escrow_revoke_handler))
        .route("/stats", get(stats_handler))
        .route("/drive/:identifier/:file", get(drive_proxy_handler))
        .route("/pfp/:owner/:file", get(pfp_proxy_handler))
        .route("/post/join/:identifier", post(join_proxy_handler))
        .route("/:a/:b", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "hypertuna-relay"}))
}

async fn gateway_secret_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.discovery_config.lan_discovery && state.registry.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({"secret_hash": crate::discovery::hash_secret(&state.discovery_config.shared_secret)}))
        .into_response()
}

#[derive(Deserialize)]
struct SignedEnvelope {
    registration: serde_json::Value,
    signature: String,
}

async fn register_relay_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SignedEnvelope>,
) -> Result<impl IntoResponse, GatewayError> {
    let canonical = serde_json::to_vec(&body.registration).map_err(GatewayError::internal)?;
    if !crate::hmac_util::verify(&canonical, &body.signature, &state.config.registration_secret) {
        return Err(GatewayError::Auth("invalid signature".into()));
    }

    let relay_key = body
        .registration
        .get("relay_key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::Internal("missing relay_key".into()))?
        .to_string();
    let peers: std::collections::HashSet<String> = body
        .registration
        .get("peers")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();

    let metadata = crate::registry::RelayMetadata {
        identifier: relay_key.clone(),
        metadata_updated_at: chrono::Utc::now().timestamp(),
        is_public: true,
        ..Default::default()
    };

    let outcome = state
        .registry
        .upsert(&relay_key, peers, metadata)
        .map_err(GatewayError::internal)?;

    Ok(Json(json!({"success": true, "outcome": format!("{:?}", outcome)})))
}

async fn unregister_relay_handler(
    State(state): State<Arc<AppState>>,
    Path(relay_key): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<impl IntoResponse, GatewayError> {
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::Auth("missing x-signature".into()))?;
    let canonical = serde_json::to_vec(&json!({"relay_key": relay_key})).map_err(GatewayError::internal)?;
    if !crate::hmac_util::verify(&canonical, signature, &state.config.registration_secret) {
        return Err(GatewayError::Auth("invalid signature".into()));
    }
    state.registry.remove(&relay_key);
    Ok(Json(json!({"success": true})))
}

#[derive(Deserialize)]
struct TokenRequest {
    pubkey: String,
    scope: Option<String>,
}

async fn issue_token_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TokenRequest>,
) -> impl IntoResponse {
    let token = crate::hmac_util::issue_token(&req.pubkey, req.scope.as_deref().unwrap_or("read"), &state.config.registration_secret);
    Json(json!({"token": token}))
}

async fn refresh_token_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TokenRequest>,
) -> impl IntoResponse {
    issue_token_handler(State(state), Json(req)).await
}

#[derive(Deserialize)]
struct RevokeTokenRequest {
    pubkey: String,
    reason: Option<String>,
}

/// Broadcasts a token revocation to every live session holding that pubkey's token and closes
/// them with 4403 (§4.5).
async fn revoke_token_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RevokeTokenRequest>,
) -> impl IntoResponse {
    let reason = req.reason.unwrap_or_else(|| "token revoked".to_string());
    let mut sequence = 0u64;
    let mut sessions_closed = 0u64;
    for entry in state.sessions.iter() {
        let gateway_session = entry.value();
        if gateway_session.token_pubkey().as_deref() == Some(req.pubkey.as_str()) {
            sequence += 1;
            session::notify_token_revoked(gateway_session, &reason, sequence);
            sessions_closed += 1;
        }
    }
    Json(json!({"success": true, "sessions_closed": sessions_closed}))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "registered_relays": state.registry.len(),
        "connected_peers": state.pool.connected_count(),
        "active_sessions": state.sessions.len(),
        "active_leases": state.escrow.active_lease_count(),
    }))
}

#[derive(Deserialize)]
struct EscrowDepositRequest {
    relay_key: String,
    owner_peer_key: String,
    writer_key_b64: String,
    policy_version: u32,
    expires_at: DateTime<Utc>,
}

/// Deposits writer-key material, sealed to the gateway's escrow keypair and bound to
/// `relay_key` via `EscrowPayload` (§4.7).
async fn escrow_deposit_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EscrowDepositRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    use base64::Engine;
    let writer_key = base64::engine::general_purpose::STANDARD
        .decode(&req.writer_key_b64)
        .map_err(GatewayError::internal)?;
    let payload = EscrowPayload::encode(&req.relay_key, &writer_key);
    let package = crate::escrow::seal(&payload, &state.escrow.public_key());
    let record = state.escrow.deposit(req.relay_key, req.owner_peer_key, package, req.policy_version, req.expires_at);
    state.escrow.persist_records().await?;
    Ok(Json(json!({"escrow_id": record.id, "expires_at": record.expires_at})))
}

#[derive(Deserialize)]
struct EscrowUnlockRequest {
    session_public_key_b64: String,
    evidence: UnlockEvidence,
}

/// Evaluates escrow policy (§4.7) and, on success, reseals the writer key to the caller's
/// session key.
async fn escrow_unlock_handler(
    State(state): State<Arc<AppState>>,
    Path(escrow_id): Path<String>,
    Json(req): Json<EscrowUnlockRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    use base64::Engine;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(&req.session_public_key_b64)
        .map_err(GatewayError::internal)?;
    let arr: [u8; 32] = raw
        .try_into()
        .map_err(|_| GatewayError::Internal("session_public_key_b64 must decode to 32 bytes".into()))?;
    let session_public = x25519_dalek::PublicKey::from(arr);
    let (package, lease_id) = state.escrow.unlock(&escrow_id, &session_public, req.evidence)?;
    state.escrow.persist_records().await?;
    Ok(Json(json!({"lease_id": lease_id, "package": package})))
}

async fn escrow_revoke_handler(
    State(state): State<Arc<AppState>>,
    Path(escrow_id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    state.escrow.revoke(&escrow_id)?;
    state.escrow.persist_records().await?;
    Ok(Json(json!({"success": true})))
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

enum SessionOutcome {
    Ready {
        relay_key: String,
        peers: Vec<String>,
        delegate_req_to_peers: bool,
        token_pubkey: Option<String>,
    },
    Reject {
        code: u16,
        reason: String,
    },
}

/// Resolves the `/:a/:b` path before upgrading, so an unknown relay or a missing token still
/// produces the right close code (§6.1) instead of a bare HTTP rejection.
fn resolve_session(state: &AppState, a: &str, b: &str, token: Option<&str>) -> SessionOutcome {
    let Some(relay_key) = session::parse_relay_key(a, b) else {
        return SessionOutcome::Reject {
            code: close_code::UNKNOWN_RELAY,
            reason: "invalid relay path".to_string(),
        };
    };

    let Some(record) = state.registry.get(&relay_key) else {
        return SessionOutcome::Reject {
            code: close_code::UNKNOWN_RELAY,
            reason: "unknown relay".to_string(),
        };
    };

    let claims = token.and_then(|t| session::verify_token(t, &state.config.registration_secret));
    if record.metadata.requires_auth && claims.is_none() {
        return SessionOutcome::Reject {
            code: close_code::AUTH_REQUIRED,
            reason: "token required".to_string(),
        };
    }

    let peers: Vec<String> = record.peers.into_iter().collect();
    if peers.is_empty() && !record.metadata.delegate_req_to_peers {
        return SessionOutcome::Reject {
            code: close_code::NO_PEERS,
            reason: "no peers available".to_string(),
        };
    }

    SessionOutcome::Ready {
        relay_key,
        peers,
        delegate_req_to_peers: record.metadata.delegate_req_to_peers,
        token_pubkey: claims.map(|c| c.pubkey),
    }
}

async fn ws_handler(
    Path((a, b)): Path<(String, String)>,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let outcome = resolve_session(&state, &a, &b, query.token.as_deref());
    ws.on_upgrade(move |socket| handle_session(socket, state, outcome))
}

/// Proxies a peer RPC path (§6.2) by selecting a live peer for the relay implied by
/// `identifier` and forwarding the request over that peer's overlay connection.
async fn proxy_to_peer(state: &AppState, relay_key: &str, method: &str, path: String) -> Result<Vec<u8>, GatewayError> {
    let record = state
        .registry
        .get(relay_key)
        .ok_or_else(|| GatewayError::NotFound(format!("unknown relay {relay_key}")))?;
    let peers: Vec<String> = record.peers.into_iter().collect();
    let peer = state
        .dispatcher
        .select_peer(&peers, &state.health)
        .ok_or_else(|| GatewayError::NoPeers(relay_key.to_string()))?;

    let conn = state.peer_connection(&peer).await?;
    let (_status, _headers, body) = conn.request(method, &path, Default::default(), None).await?;
    Ok(body.unwrap_or_default())
}

async fn drive_proxy_handler(
    State(state): State<Arc<AppState>>,
    Path((identifier, file)): Path<(String, String)>,
) -> Result<Vec<u8>, GatewayError> {
    proxy_to_peer(&state, &identifier, "GET", format!("/drive/{identifier}/{file}")).await
}

async fn pfp_proxy_handler(
    State(state): State<Arc<AppState>>,
    Path((owner, file)): Path<(String, String)>,
) -> Result<Vec<u8>, GatewayError> {
    proxy_to_peer(&state, &owner, "GET", format!("/pfp/{owner}/{file}")).await
}

async fn join_proxy_handler(
    State(state): State<Arc<AppState>>,
    Path(identifier): Path<String>,
) -> Result<Vec<u8>, GatewayError> {
    proxy_to_peer(&state, &identifier, "POST", format!("/post/join/{identifier}")).await
}

async fn handle_session(socket: WebSocket, state: Arc<AppState>, outcome: SessionOutcome) {
    use futures::SinkExt;
    let (mut sender, mut receiver) = futures::StreamExt::split(socket);

    let (relay_key, peers, delegate_req_to_peers, token_pubkey) = match outcome {
        SessionOutcome::Ready {
            relay_key,
            peers,
            delegate_req_to_peers,
            token_pubkey,
        } => (relay_key, peers, delegate_req_to_peers, token_pubkey),
        SessionOutcome::Reject { code, reason } => {
            let _ = sender.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
            return;
        }
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let session = Arc::new(GatewaySession::new(relay_key, peers, delegate_req_to_peers, token_pubkey, tx));
    state.sessions.insert(session.connection_key.clone(), session.clone());

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                OutboundMessage::Frame(frame) => {
                    if let Ok(text) = serde_json::to_string(&frame) {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
                OutboundMessage::Close { code, reason } => {
                    let _ = sender.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
                    break;
                }
            }
        }
    });

    let mut poll_interval = tokio::time::interval(session::EVENT_POLL_INTERVAL);

    loop {
        use futures::StreamExt;
        tokio::select! {
            _ = poll_interval.tick() => {
                if session.is_closed() {
                    break;
                }
                session::poll_events(&state, &session).await;
                session::flush_delegated(&state, &session).await;
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) {
                            session::handle_frame(&state, &session, frame).await;
                        } else {
                            session.send(crate::wire::ServerFrame::Notice {
                                message: "unrecognized frame".to_string(),
                            });
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => {
                        session.force_close(close_code::INTERNAL, "transport error");
                        break;
                    }
                    _ => {}
                }
                if session.is_closed() {
                    break;
                }
            }
        }
    }

    state.sessions.remove(&session.connection_key);
    sender_task.abort();
}
