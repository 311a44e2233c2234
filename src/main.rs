//! Hypertuna relay runtime.
//!
//! Shared core for both the public gateway role (terminates client WebSocket/HTTP traffic,
//! C5/C6) and a worker role reachable via the peer overlay (C1/C2/C3), plus the relay
//! registration table (C4), discovery (C8), and the escrow policy engine (C7).

mod app;
mod config;
mod discovery;
mod dispatch;
mod error;
mod escrow;
mod health;
mod hmac_util;
mod http;
mod pool;
mod registry;
mod session;
mod transport;
mod wire;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::app::AppState;
use crate::config::{Args, EscrowConfig, GatewayConfig};
use crate::discovery::DiscoveryConfig;
use crate::escrow::EscrowService;

#[tokio::main]
async fn main() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hypertuna_relay=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let config = GatewayConfig::from_args(&args);
    let discovery_config = DiscoveryConfig::from_env();
    let escrow_config = EscrowConfig::from_env();

    let secret_key = EscrowService::load_or_generate_keypair(&escrow_config.storage_dir)
        .await
        .expect("escrow keypair must be loadable or generatable at startup");
    let escrow = EscrowService::new(escrow_config, secret_key);
    escrow
        .load_records()
        .await
        .expect("escrow records file, if present, must be valid JSON");

    let state = Arc::new(AppState::new(config.clone(), discovery_config, escrow));

    tracing::info!(port = config.port, region = %config.region, "starting hypertuna relay");

    // Registry pruning / lease sweep / discovery cleanup (§5).
    {
        let state = state.clone();
        let interval = Duration::from_secs(config.cleanup_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                state.cleanup_expired();
            }
        });
    }

    // Escrow records are persisted on a timer rather than per-write, matching the atomic
    // write-then-rename idiom used elsewhere in this crate.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                if let Err(e) = state.escrow.persist_records().await {
                    tracing::warn!(error = %e, "failed to persist escrow records");
                }
            }
        });
    }

    // Peer health probing (§4.3): sweep every peer known to the registry, record telemetry
    // from successful probes, and evict a peer from the registry/pool/dispatcher once its
    // circuit trips (three consecutive failures, §8 I5).
    {
        let state = state.clone();
        let interval = Duration::from_secs(config.health_check_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for peer in state.registry.all_peers() {
                    let probe_state = state.clone();
                    let probe_peer = peer.clone();
                    state
                        .health
                        .check_peer(&peer, || async move {
                            match probe_state.peer_connection(&probe_peer).await {
                                Ok(conn) => match conn.probe_health().await {
                                    Ok(telemetry) => {
                                        probe_state.dispatcher.record_telemetry(telemetry);
                                        true
                                    }
                                    Err(_) => false,
                                },
                                Err(_) => false,
                            }
                        })
                        .await;

                    if !state.health.is_selectable(&peer) {
                        tracing::warn!(peer = %peer, "peer circuit-broken, removing from registry/pool/dispatcher");
                        state.registry.remove_peer_everywhere(&peer);
                        state.pool.remove(&peer);
                        state.dispatcher.remove_peer(&peer);
                    }
                }
            }
        });
    }

    let router = http::build_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));
    tracing::info!(%addr, "listening");
    axum::serve(listener, router).await.expect("server loop exited unexpectedly");
}
