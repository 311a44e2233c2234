//! Registration store (C4): `relay -> {peers, metadata}` with TTL and LWW metadata merge.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("relay key is empty")]
    EmptyKey,
}

#[derive(Debug, Clone, Default)]
pub struct RelayMetadata {
    pub identifier: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub gateway_path: Option<String>,
    pub path_aliases: Vec<String>,
    pub is_public: bool,
    pub requires_auth: bool,
    pub metadata_updated_at: i64,
    pub gateway_relay: bool,
    pub delegate_req_to_peers: bool,
}

#[derive(Debug, Clone)]
pub struct RelayRecord {
    pub peers: HashSet<String>,
    pub metadata: RelayMetadata,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a registration call, returned as a small enum instead of a bare boolean so
/// callers can tell a brand-new relay from a merge and act on peers_added/metadata_updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created,
    Merged { peers_added: usize, metadata_updated: bool },
}

pub struct RegistrationStore {
    relays: DashMap<String, RelayRecord>,
    ttl_secs: i64,
}

impl RegistrationStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            relays: DashMap::new(),
            ttl_secs: ttl_secs as i64,
        }
    }

    /// Idempotent upsert: peers merge by union, metadata applies only if its
    /// `metadata_updated_at` is >= the stored value (last-writer-wins, monotone).
    pub fn upsert(
        &self,
        relay_key: &str,
        peers: HashSet<String>,
        metadata: RelayMetadata,
    ) -> Result<RegistrationOutcome, RegistryError> {
        if relay_key.is_empty() {
            return Err(RegistryError::EmptyKey);
        }
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(self.ttl_secs);

        match self.relays.get_mut(relay_key) {
            None => {
                self.relays.insert(
                    relay_key.to_string(),
                    RelayRecord {
                        peers,
                        metadata,
                        expires_at,
                    },
                );
                Ok(RegistrationOutcome::Created)
            }
            Some(mut existing) => {
                let before = existing.peers.len();
                existing.peers.extend(peers);
                let peers_added = existing.peers.len() - before;

                let metadata_updated = metadata.metadata_updated_at >= existing.metadata.metadata_updated_at;
                if metadata_updated {
                    existing.metadata = metadata;
                }
                existing.expires_at = expires_at;
                Ok(RegistrationOutcome::Merged {
                    peers_added,
                    metadata_updated,
                })
            }
        }
    }

    /// Returns `None` if absent or expired, lazily evicting expired entries on read.
    pub fn get(&self, relay_key: &str) -> Option<RelayRecord> {
        let expired = self
            .relays
            .get(relay_key)
            .map(|r| r.expires_at < Utc::now())
            .unwrap_or(false);
        if expired {
            self.relays.remove(relay_key);
            return None;
        }
        self.relays.get(relay_key).map(|r| r.clone())
    }

    pub fn remove(&self, relay_key: &str) {
        self.relays.remove(relay_key);
    }

    /// Removes `peer` from every relay's peer set. Called when health/pool marks it unreachable.
    pub fn remove_peer_everywhere(&self, peer: &str) {
        for mut entry in self.relays.iter_mut() {
            entry.peers.remove(peer);
        }
    }

    pub fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .relays
            .iter()
            .filter(|e| e.expires_at < now)
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.relays.remove(key);
        }
        expired.len()
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.relays.iter().map(|e| e.key().clone()).collect()
    }

    /// Every peer known across every registered relay, deduplicated. Used by the health-probe
    /// sweep (§4.3) to decide which peers to check without tying it to a single relay.
    pub fn all_peers(&self) -> HashSet<String> {
        let mut peers = HashSet::new();
        for entry in self.relays.iter() {
            peers.extend(entry.peers.iter().cloned());
        }
        peers
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
}

/// Registration backend (§4.4): `RegistrationStore` is the default in-memory implementation;
/// an external-cache-backed store (e.g. Redis, for sharing registrations across gateway
/// replicas) can implement this trait and drop in without touching callers.
pub trait RegistrationBackend: Send + Sync {
    fn upsert(
        &self,
        relay_key: &str,
        peers: HashSet<String>,
        metadata: RelayMetadata,
    ) -> Result<RegistrationOutcome, RegistryError>;
    fn get(&self, relay_key: &str) -> Option<RelayRecord>;
    fn remove(&self, relay_key: &str);
    fn remove_peer_everywhere(&self, peer: &str);
    fn prune_expired(&self) -> usize;
    fn list_keys(&self) -> Vec<String>;
    fn all_peers(&self) -> HashSet<String>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
}

impl RegistrationBackend for RegistrationStore {
    fn upsert(
        &self,
        relay_key: &str,
        peers: HashSet<String>,
        metadata: RelayMetadata,
    ) -> Result<RegistrationOutcome, RegistryError> {
        RegistrationStore::upsert(self, relay_key, peers, metadata)
    }

    fn get(&self, relay_key: &str) -> Option<RelayRecord> {
        RegistrationStore::get(self, relay_key)
    }

    fn remove(&self, relay_key: &str) {
        RegistrationStore::remove(self, relay_key)
    }

    fn remove_peer_everywhere(&self, peer: &str) {
        RegistrationStore::remove_peer_everywhere(self, peer)
    }

    fn prune_expired(&self) -> usize {
        RegistrationStore::prune_expired(self)
    }

    fn list_keys(&self) -> Vec<String> {
        RegistrationStore::list_keys(self)
    }

    fn all_peers(&self) -> HashSet<String> {
        RegistrationStore::all_peers(self)
    }

    fn len(&self) -> usize {
        RegistrationStore::len(self)
    }

    fn is_empty(&self) -> bool {
        RegistrationStore::is_empty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(updated_at: i64) -> RelayMetadata {
        RelayMetadata {
            metadata_updated_at: updated_at,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_upsert_creates() {
        let store = RegistrationStore::new(3600);
        let result = store
            .upsert("relay:1", HashSet::from(["peerA".to_string()]), meta(1))
            .unwrap();
        assert_eq!(result, RegistrationOutcome::Created);
    }

    #[test]
    fn test_upsert_merges_peers_union() {
        let store = RegistrationStore::new(3600);
        store
            .upsert("relay:1", HashSet::from(["peerA".to_string()]), meta(1))
            .unwrap();
        let result = store
            .upsert("relay:1", HashSet::from(["peerB".to_string()]), meta(1))
            .unwrap();
        assert_eq!(
            result,
            RegistrationOutcome::Merged {
                peers_added: 1,
                metadata_updated: true
            }
        );
        let record = store.get("relay:1").unwrap();
        assert_eq!(record.peers.len(), 2);
    }

    #[test]
    fn test_metadata_lww_ignores_stale_update() {
        let store = RegistrationStore::new(3600);
        store.upsert("relay:1", HashSet::new(), meta(10)).unwrap();
        let mut stale = meta(5);
        stale.name = Some("stale".to_string());
        store.upsert("relay:1", HashSet::new(), stale).unwrap();
        let record = store.get("relay:1").unwrap();
        assert_eq!(record.metadata.metadata_updated_at, 10);
        assert_eq!(record.metadata.name, None);
    }

    #[test]
    fn test_repeated_identical_registration_is_noop_on_peers() {
        let store = RegistrationStore::new(3600);
        let peers = HashSet::from(["peerA".to_string()]);
        store.upsert("relay:1", peers.clone(), meta(1)).unwrap();
        let result = store.upsert("relay:1", peers, meta(1)).unwrap();
        assert_eq!(
            result,
            RegistrationOutcome::Merged {
                peers_added: 0,
                metadata_updated: true
            }
        );
    }

    #[test]
    fn test_empty_key_rejected() {
        let store = RegistrationStore::new(3600);
        assert!(matches!(
            store.upsert("", HashSet::new(), meta(1)),
            Err(RegistryError::EmptyKey)
        ));
    }

    #[test]
    fn test_remove_peer_everywhere() {
        let store = RegistrationStore::new(3600);
        store
            .upsert("relay:1", HashSet::from(["peerA".to_string(), "peerB".to_string()]), meta(1))
            .unwrap();
        store.remove_peer_everywhere("peerA");
        let record = store.get("relay:1").unwrap();
        assert!(!record.peers.contains("peerA"));
        assert!(record.peers.contains("peerB"));
    }

    #[test]
    fn test_all_peers_dedups_across_relays() {
        let store = RegistrationStore::new(3600);
        store
            .upsert("relay:1", HashSet::from(["peerA".to_string(), "peerB".to_string()]), meta(1))
            .unwrap();
        store
            .upsert("relay:2", HashSet::from(["peerB".to_string(), "peerC".to_string()]), meta(1))
            .unwrap();
        let peers = store.all_peers();
        assert_eq!(peers.len(), 3);
        assert!(peers.contains("peerA") && peers.contains("peerB") && peers.contains("peerC"));
    }

    #[test]
    fn test_registration_backend_trait_object() {
        let store = RegistrationStore::new(3600);
        store.upsert("relay:1", HashSet::from(["peerA".to_string()]), meta(1)).unwrap();
        let backend: &dyn RegistrationBackend = &store;
        assert_eq!(backend.len(), 1);
        assert!(backend.get("relay:1").is_some());
    }

    #[test]
    fn test_prune_expired() {
        let store = RegistrationStore::new(0);
        store.upsert("relay:1", HashSet::new(), meta(1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(store.prune_expired(), 1);
        assert!(store.get("relay:1").is_none());
    }
}
