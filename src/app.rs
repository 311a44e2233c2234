//! Shared application state, cloned into every handler: a plain struct of `Arc`/`DashMap`
//! fields plus the resolved config.

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::GatewayConfig;
use crate::discovery::{DiscoveryConfig, DiscoveryStore};
use crate::dispatch::Dispatcher;
use crate::error::GatewayResult;
use crate::escrow::EscrowService;
use crate::health::HealthManager;
use crate::pool::ConnectionPool;
use crate::registry::RegistrationStore;
use crate::session::GatewaySession;
use crate::transport::{MultiplexedConnection, RequestRouter};
use crate::wire::PeerRole;

pub struct AppState {
    pub config: GatewayConfig,
    pub discovery_config: DiscoveryConfig,
    pub registry: RegistrationStore,
    pub pool: ConnectionPool,
    pub health: HealthManager,
    pub dispatcher: Arc<Dispatcher>,
    pub discovery: DiscoveryStore,
    pub escrow: EscrowService,
    pub sessions: DashMap<String, Arc<GatewaySession>>,
    pub peer_router: Arc<RequestRouter>,
}

/// Builds the handler table this gateway exposes to peers calling back over the same
/// multiplexed connection it dialed out on (§6.2).
fn build_peer_router(config: &GatewayConfig) -> RequestRouter {
    let mut router = RequestRouter::new();
    let region = config.region.clone();
    router.route("/identify", move |_params, _headers, _body| {
        let body = serde_json::json!({"role": "gateway", "region": region}).to_string().into_bytes();
        Ok((200, Some(body)))
    });
    router
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        discovery_config: DiscoveryConfig,
        escrow: EscrowService,
    ) -> Self {
        let peer_router = Arc::new(build_peer_router(&config));
        Self {
            registry: RegistrationStore::new(config.registry_ttl_secs),
            pool: ConnectionPool::new(),
            health: HealthManager::new(),
            dispatcher: Arc::new(Dispatcher::default()),
            discovery: DiscoveryStore::new(discovery_config.clone()),
            escrow,
            sessions: DashMap::new(),
            peer_router,
            config,
            discovery_config,
        }
    }

    /// Returns a live overlay connection to `peer`, dialing one via the pool if none is open.
    /// Shared by every caller that needs to reach a peer: REQ forwarding, the HTTP proxy
    /// handlers, and the health-probe sweep.
    pub async fn peer_connection(&self, peer: &str) -> GatewayResult<Arc<MultiplexedConnection>> {
        let dispatcher = self.dispatcher.clone();
        let router = self.peer_router.clone();
        let peer_owned = peer.to_string();
        self.pool
            .get_connection(peer, move || {
                let dispatcher = dispatcher.clone();
                let router = router.clone();
                let peer_owned = peer_owned.clone();
                async move { crate::transport::dial_peer(&peer_owned, PeerRole::Gateway, false, dispatcher, router).await }
            })
            .await
    }

    /// Sweeps every periodic-maintenance subsystem; called from `main`'s background tasks.
    pub fn cleanup_expired(&self) {
        let pruned = self.registry.prune_expired();
        let leases_swept = self.escrow.sweep_expired_leases();
        let discovery_swept = self.discovery.cleanup_expired(30);
        tracing::debug!(
            relays_pruned = pruned,
            leases_swept,
            discovery_swept,
            "periodic cleanup complete"
        );
    }
}
