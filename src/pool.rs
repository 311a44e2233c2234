//! Connection pool (C2): at most one open connection per peer key.
//!
//! Coalesces concurrent connect attempts for the same peer behind a per-slot lock, and
//! exposes an exponential-backoff reconnect helper (1s, doubling, capped at 60s, reset
//! to 1s on clean close).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::GatewayResult;
use crate::transport::MultiplexedConnection;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Connected,
    HandshakeComplete,
    ConnectionClosed,
}

pub type PeerKey = String;

/// Per-peer connect coordination: a lock so concurrent callers share one in-flight attempt,
/// plus the connection itself once established.
struct Slot {
    connect_lock: Mutex<()>,
    connection: std::sync::RwLock<Option<Arc<MultiplexedConnection>>>,
}

pub struct ConnectionPool {
    slots: DashMap<PeerKey, Arc<Slot>>,
    event_tx: tokio::sync::broadcast::Sender<(PeerKey, PoolEvent)>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        let (event_tx, _rx) = tokio::sync::broadcast::channel(256);
        Self {
            slots: DashMap::new(),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<(PeerKey, PoolEvent)> {
        self.event_tx.subscribe()
    }

    fn slot_for(&self, peer: &str) -> Arc<Slot> {
        self.slots
            .entry(peer.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    connect_lock: Mutex::new(()),
                    connection: std::sync::RwLock::new(None),
                })
            })
            .clone()
    }

    /// Returns an open connection for `peer`, establishing one via `connect` if absent.
    /// Concurrent callers for the same peer share the single in-flight attempt.
    pub async fn get_connection<F, Fut>(
        &self,
        peer: &str,
        connect: F,
    ) -> GatewayResult<Arc<MultiplexedConnection>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = GatewayResult<Arc<MultiplexedConnection>>>,
    {
        let slot = self.slot_for(peer);

        if let Some(conn) = slot.connection.read().unwrap().clone() {
            return Ok(conn);
        }

        let _guard = slot.connect_lock.lock().await;
        if let Some(conn) = slot.connection.read().unwrap().clone() {
            return Ok(conn);
        }

        let conn = connect().await?;
        *slot.connection.write().unwrap() = Some(conn.clone());
        let _ = self.event_tx.send((peer.to_string(), PoolEvent::Connected));
        Ok(conn)
    }

    /// Replaces any existing connection for `peer` with a freshly accepted inbound one.
    pub fn replace_inbound(&self, peer: &str, conn: Arc<MultiplexedConnection>) {
        let slot = self.slot_for(peer);
        *slot.connection.write().unwrap() = Some(conn);
        let _ = self.event_tx.send((peer.to_string(), PoolEvent::Connected));
    }

    pub fn remove(&self, peer: &str) {
        if let Some(slot) = self.slots.get(peer) {
            *slot.connection.write().unwrap() = None;
        }
        let _ = self.event_tx.send((peer.to_string(), PoolEvent::ConnectionClosed));
    }

    pub fn is_connected(&self, peer: &str) -> bool {
        self.slots
            .get(peer)
            .map(|s| s.connection.read().unwrap().is_some())
            .unwrap_or(false)
    }

    pub fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| e.connection.read().unwrap().is_some())
            .count()
    }

    /// Tears down every connection (used on shutdown).
    pub fn destroy(&self) {
        for entry in self.slots.iter() {
            *entry.connection.write().unwrap() = None;
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the next exponential-backoff delay, doubling from `INITIAL_BACKOFF` and
/// capping at `MAX_BACKOFF`. A clean close resets the caller's delay back to `INITIAL_BACKOFF`.
pub fn next_backoff(current: Duration) -> Duration {
    std::cmp::min(current * 2, MAX_BACKOFF)
}

pub fn initial_backoff() -> Duration {
    INITIAL_BACKOFF
}

pub async fn reconnect_loop<F, Fut>(peer_url: String, mut attempt: F)
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = GatewayResult<()>>,
{
    let mut backoff = initial_backoff();
    loop {
        match attempt(peer_url.clone()).await {
            Ok(()) => {
                backoff = initial_backoff();
            }
            Err(e) => {
                tracing::warn!(peer = %peer_url, error = %e, backoff_secs = backoff.as_secs(), "peer connection failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = initial_backoff();
        assert_eq!(b, Duration::from_secs(1));
        b = next_backoff(b);
        assert_eq!(b, Duration::from_secs(2));
        b = next_backoff(b);
        assert_eq!(b, Duration::from_secs(4));
        for _ in 0..10 {
            b = next_backoff(b);
        }
        assert_eq!(b, MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_concurrent_get_connection_coalesces() {
        let pool = Arc::new(ConnectionPool::new());
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                pool.get_connection("peer-a", || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
                        Ok(Arc::new(MultiplexedConnection::new(
                            tx,
                            crate::transport::local_handshake(crate::wire::PeerRole::Gateway, false),
                        )))
                    }
                })
                .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inbound_replaces_existing() {
        let pool = ConnectionPool::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let first = Arc::new(MultiplexedConnection::new(
            tx,
            crate::transport::local_handshake(crate::wire::PeerRole::Gateway, false),
        ));
        pool.replace_inbound("peer-b", first);
        assert!(pool.is_connected("peer-b"));

        let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel();
        let second = Arc::new(MultiplexedConnection::new(
            tx2,
            crate::transport::local_handshake(crate::wire::PeerRole::Gateway, false),
        ));
        pool.replace_inbound("peer-b", second);
        assert!(pool.is_connected("peer-b"));
        assert_eq!(pool.connected_count(), 1);
    }

    #[test]
    fn test_remove_marks_disconnected() {
        let pool = ConnectionPool::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = Arc::new(MultiplexedConnection::new(
            tx,
            crate::transport::local_handshake(crate::wire::PeerRole::Gateway, false),
        ));
        pool.replace_inbound("peer-c", conn);
        pool.remove("peer-c");
        assert!(!pool.is_connected("peer-c"));
    }
}
