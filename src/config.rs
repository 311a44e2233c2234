//! CLI arguments and environment-derived configuration.

use std::env;

use clap::Parser;

const DEFAULT_LEASE_TTL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_DEPOSIT_TTL_MS: u64 = 24 * 60 * 60 * 1000;
const DEFAULT_PEER_LIVENESS_TIMEOUT_MS: u64 = 60 * 1000;
const DEFAULT_MIRROR_MAX_LAG_MS: u64 = 30 * 1000;
const DEFAULT_MIRROR_WINDOW_MS: u64 = 5 * 60 * 1000;

#[derive(Parser, Debug, Clone)]
#[command(name = "hypertuna-relay", about = "Hypertuna gateway / worker runtime")]
pub struct Args {
    #[arg(long, default_value_t = 8080, env = "GATEWAY_PORT")]
    pub port: u16,

    #[arg(long, default_value_t = 3600, env = "CACHE_TTL_SECONDS")]
    pub registry_ttl_secs: u64,

    #[arg(long, default_value_t = 60, env = "CLEANUP_INTERVAL_SECS")]
    pub cleanup_interval_secs: u64,

    #[arg(long, default_value_t = 30, env = "HEALTH_CHECK_INTERVAL_SECS")]
    pub health_check_interval_secs: u64,

    #[arg(long, default_value = "", env = "RELAY_REGION")]
    pub region: String,

    #[arg(long, default_value = "", env = "RELAY_LOCATION")]
    pub location: String,

    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<String>,

    #[arg(long, value_delimiter = ',', env = "GATEWAY_SEED_PEERS")]
    pub seed_peers: Vec<String>,

    #[arg(long, default_value_t = 5, env = "DELEGATION_MAX_RETRIES")]
    pub delegation_max_retries: u32,
}

/// Resolved gateway runtime configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub registry_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub region: String,
    pub location: String,
    pub data_dir: Option<String>,
    pub seed_peers: Vec<String>,
    pub delegation_max_retries: u32,
    pub registration_secret: String,
}

impl GatewayConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            port: args.port,
            registry_ttl_secs: args.registry_ttl_secs,
            cleanup_interval_secs: args.cleanup_interval_secs,
            health_check_interval_secs: args.health_check_interval_secs,
            region: args.region.clone(),
            location: args.location.clone(),
            data_dir: args.data_dir.clone(),
            seed_peers: args.seed_peers.clone(),
            delegation_max_retries: args.delegation_max_retries,
            registration_secret: env::var("GATEWAY_REGISTRATION_SECRET")
                .unwrap_or_else(|_| "change-me-in-production".to_string()),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            registry_ttl_secs: 3600,
            cleanup_interval_secs: 60,
            health_check_interval_secs: 30,
            region: String::new(),
            location: String::new(),
            data_dir: None,
            seed_peers: Vec::new(),
            delegation_max_retries: 5,
            registration_secret: "change-me-in-production".to_string(),
        }
    }
}

/// Escrow policy engine configuration, loaded from environment (§6.5).
#[derive(Debug, Clone)]
pub struct EscrowConfig {
    pub lease_ttl_ms: u64,
    pub deposit_ttl_ms: u64,
    pub peer_liveness_timeout_ms: u64,
    pub mirror_max_lag_ms: u64,
    pub mirror_window_ms: u64,
    pub require_registration_flag: bool,
    pub storage_dir: String,
    pub max_unlocks_per_lease: u32,
}

impl EscrowConfig {
    pub fn from_env() -> Self {
        Self {
            lease_ttl_ms: env_u64("ESCROW_LEASE_TTL_MS", DEFAULT_LEASE_TTL_MS),
            deposit_ttl_ms: env_u64("ESCROW_DEPOSIT_TTL_MS", DEFAULT_DEPOSIT_TTL_MS),
            peer_liveness_timeout_ms: env_u64(
                "ESCROW_PEER_LIVENESS_TIMEOUT_MS",
                DEFAULT_PEER_LIVENESS_TIMEOUT_MS,
            ),
            mirror_max_lag_ms: env_u64("ESCROW_MIRROR_MAX_LAG_MS", DEFAULT_MIRROR_MAX_LAG_MS),
            mirror_window_ms: env_u64("ESCROW_MIRROR_WINDOW_MS", DEFAULT_MIRROR_WINDOW_MS),
            require_registration_flag: env::var("ESCROW_REQUIRE_FLAG")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            storage_dir: env::var("BLIND_PEER_STORAGE").unwrap_or_else(|_| "./data/escrow".to_string()),
            max_unlocks_per_lease: env_u64("ESCROW_MAX_UNLOCKS_PER_LEASE", 1) as u32,
        }
    }
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            deposit_ttl_ms: DEFAULT_DEPOSIT_TTL_MS,
            peer_liveness_timeout_ms: DEFAULT_PEER_LIVENESS_TIMEOUT_MS,
            mirror_max_lag_ms: DEFAULT_MIRROR_MAX_LAG_MS,
            mirror_window_ms: DEFAULT_MIRROR_WINDOW_MS,
            require_registration_flag: true,
            storage_dir: "./data/escrow".to_string(),
            max_unlocks_per_lease: 1,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_gateway_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.delegation_max_retries, 5);
    }

    #[test]
    fn test_default_escrow_config() {
        let config = EscrowConfig::default();
        assert_eq!(config.lease_ttl_ms, DEFAULT_LEASE_TTL_MS);
        assert!(config.require_registration_flag);
    }
}
