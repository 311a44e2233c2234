//! Replica & dispatcher (C6): telemetry scoreboard, peer scoring, reassignment on lag.

use dashmap::DashMap;

use crate::health::HealthManager;
use crate::wire::Telemetry;

#[derive(Debug, Clone, Copy)]
pub struct ScoringWeights {
    pub in_flight_weight: f64,
    pub latency_weight: f64,
    pub failure_weight: f64,
    pub max_concurrent_jobs_per_peer: u32,
    pub reassign_on_lag_blocks: u64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            in_flight_weight: 1.0,
            latency_weight: 0.01,
            failure_weight: 50.0,
            max_concurrent_jobs_per_peer: 64,
            reassign_on_lag_blocks: 500,
        }
    }
}

fn lag_penalty(lag: u64, reassign_threshold: u64) -> f64 {
    if lag > reassign_threshold {
        (lag - reassign_threshold) as f64 * 2.0
    } else {
        0.0
    }
}

pub struct Dispatcher {
    telemetry: DashMap<String, Telemetry>,
    weights: ScoringWeights,
}

impl Dispatcher {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            telemetry: DashMap::new(),
            weights,
        }
    }

    pub fn record_telemetry(&self, t: Telemetry) {
        self.telemetry.insert(t.peer_id.clone(), t);
    }

    pub fn telemetry_for(&self, peer: &str) -> Option<Telemetry> {
        self.telemetry.get(peer).map(|t| t.clone())
    }

    fn score(&self, t: &Telemetry) -> f64 {
        self.weights.in_flight_weight * t.in_flight_jobs as f64
            + self.weights.latency_weight * t.latency_ms
            + self.weights.failure_weight * t.failure_rate
            + lag_penalty(t.hyperbee_lag, self.weights.reassign_on_lag_blocks)
    }

    /// Picks the lowest-scoring eligible peer among `candidates`. Excludes peers at or over
    /// the concurrency cap and circuit-broken peers (per `health`). Falls back to plain
    /// round-robin (first eligible candidate) when no telemetry has been reported yet.
    pub fn select_peer(&self, candidates: &[String], health: &HealthManager) -> Option<String> {
        let mut best: Option<(String, f64)> = None;
        let mut first_eligible_without_telemetry: Option<String> = None;

        for peer in candidates {
            if !health.is_selectable(peer) {
                continue;
            }
            match self.telemetry_for(peer) {
                Some(t) => {
                    if t.in_flight_jobs >= self.weights.max_concurrent_jobs_per_peer {
                        continue;
                    }
                    let score = self.score(&t);
                    if best.as_ref().map(|(_, s)| score < *s).unwrap_or(true) {
                        best = Some((peer.clone(), score));
                    }
                }
                None => {
                    if first_eligible_without_telemetry.is_none() {
                        first_eligible_without_telemetry = Some(peer.clone());
                    }
                }
            }
        }

        best.map(|(peer, _)| peer).or(first_eligible_without_telemetry)
    }

    /// True when the currently assigned peer's reported lag exceeds the reassignment
    /// threshold and a subscription should migrate to a better peer.
    pub fn should_reassign(&self, current_peer: &str) -> bool {
        self.telemetry_for(current_peer)
            .map(|t| t.hyperbee_lag > self.weights.reassign_on_lag_blocks)
            .unwrap_or(false)
    }

    pub fn remove_peer(&self, peer: &str) {
        self.telemetry.remove(peer);
    }
}

/// Composite key encodings for local-replica range scans (§6.2).
pub mod composite_key {
    pub fn by_created_at(created_at: i64, id_hex: &str) -> String {
        format!("created_at:{:010}:id:{}", created_at, id_hex)
    }

    pub fn by_kind(kind: u32, created_at: i64, id_hex: &str) -> String {
        format!("kind:{:05}:created_at:{:010}:id:{}", kind, created_at, id_hex)
    }

    pub fn by_pubkey(pubkey_hex: &str, created_at: i64, id_hex: &str) -> String {
        format!("pubkey:{}:created_at:{:010}:id:{}", pubkey_hex, created_at, id_hex)
    }

    pub fn by_tag(tag_key: &str, tag_value: &str, created_at: i64, id_hex: &str) -> String {
        format!(
            "tagKey:{}:tagValue:{}:created_at:{:010}:id:{}",
            tag_key, tag_value, created_at, id_hex
        )
    }

    /// Exclusive-upper-bound form of a prefix, per §6.2 ("append `#` for exclusive upper").
    pub fn exclusive_upper(prefix: &str) -> String {
        format!("{}#", prefix)
    }
}

/// Minimal range-scan interface a local replica must satisfy; the hyperbee engine itself is
/// out of scope (§1) and is provided by the caller. Tests exercise this against a `BTreeMap` fake.
pub trait LocalReplica: Send + Sync {
    fn range(&self, start: &str, end_exclusive: &str) -> Vec<(String, Vec<u8>)>;
    fn lag_ms(&self) -> u64;
}

pub struct BTreeReplica {
    pub data: std::collections::BTreeMap<String, Vec<u8>>,
    pub lag_ms: u64,
}

impl LocalReplica for BTreeReplica {
    fn range(&self, start: &str, end_exclusive: &str) -> Vec<(String, Vec<u8>)> {
        self.data
            .range(start.to_string()..end_exclusive.to_string())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn lag_ms(&self) -> u64 {
        self.lag_ms
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(ScoringWeights::default())
    }
}
