//! Escrow policy engine + lease vault (C7).
//!
//! Record/keypair persistence follows an atomic-write pattern (write `.tmp`, rename). The
//! sealed-box primitive (X25519 + HKDF-SHA256 + AES-256-GCM) uses `x25519-dalek`/`hkdf`/
//! `aes-gcm`/`zeroize` for ephemeral key agreement, key derivation, authenticated encryption,
//! and secret-material zeroing respectively.

use std::path::PathBuf;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::config::EscrowConfig;
use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    #[error("sealed-box decrypt failed")]
    DecryptFailed,
    #[error("relay key mismatch on unseal")]
    RelayKeyMismatch,
    #[error("escrow record not found")]
    NotFound,
    #[error("escrow record revoked")]
    Revoked,
    #[error("escrow record expired")]
    Expired,
    #[error("lease unlock budget exhausted")]
    UnlockBudgetExhausted,
    #[error("policy rejected unlock: {0:?}")]
    PolicyRejected(Vec<String>),
    #[error("io error: {0}")]
    Io(String),
}

impl From<EscrowError> for GatewayError {
    fn from(e: EscrowError) -> Self {
        match e {
            EscrowError::NotFound => GatewayError::NotFound(e.to_string()),
            EscrowError::PolicyRejected(reasons) => GatewayError::Policy(reasons),
            _ => GatewayError::Internal(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------------------
// Sealed-box primitive (§1.2, §8 R2)
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedPackage {
    pub cipher_text: Vec<u8>,
    pub nonce: [u8; 12],
    pub sender_public_key: [u8; 32],
}

/// Seals `plaintext` to `receiver_public`, generating an ephemeral X25519 keypair so the
/// sender's long-term key never needs to be transmitted.
pub fn seal(plaintext: &[u8], receiver_public: &PublicKey) -> SealedPackage {
    let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(receiver_public);

    let key = derive_aead_key(shared.as_bytes());
    let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher_text = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-GCM encryption does not fail for valid key/nonce");

    SealedPackage {
        cipher_text,
        nonce: nonce_bytes,
        sender_public_key: ephemeral_public.to_bytes(),
    }
}

/// Opens a sealed package using the receiver's long-term secret key.
pub fn open(package: &SealedPackage, receiver_secret: &StaticSecret) -> Result<Vec<u8>, EscrowError> {
    let sender_public = PublicKey::from(package.sender_public_key);
    let shared = receiver_secret.diffie_hellman(&sender_public);
    let key = derive_aead_key(shared.as_bytes());
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| EscrowError::DecryptFailed)?;
    let nonce = Nonce::from_slice(&package.nonce);
    cipher
        .decrypt(nonce, package.cipher_text.as_ref())
        .map_err(|_| EscrowError::DecryptFailed)
}

fn derive_aead_key(shared_secret: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hk.expand(b"hypertuna-escrow-seal", &mut key)
        .expect("32 bytes is a valid HKDF output length");
    key
}

// ---------------------------------------------------------------------------------------
// Policy evidence and evaluation (§4.7)
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationEvidence {
    pub escrow_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerHealthEvidence {
    pub healthy_count: u32,
    pub last_healthy_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorEvidence {
    pub lag_ms: u64,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnlockEvidence {
    pub registration: RegistrationEvidence,
    pub peer_health: PeerHealthEvidence,
    pub mirror: MirrorEvidence,
}

/// Evaluates the six policy rules of §4.7 against `evidence`; returns every failing reason
/// so the audit log (and the HTTP 412 body) can report all of them, not just the first.
fn evaluate_policy(config: &EscrowConfig, evidence: &UnlockEvidence) -> Vec<String> {
    let now = Utc::now();
    let mut reasons = Vec::new();

    if config.require_registration_flag && !evidence.registration.escrow_enabled {
        reasons.push("registration_escrow_disabled".to_string());
    }
    if evidence.peer_health.healthy_count != 0 {
        reasons.push("peers_still_healthy".to_string());
    }
    let liveness_elapsed_ms = (now - evidence.peer_health.last_healthy_at)
        .num_milliseconds()
        .max(0) as u64;
    if liveness_elapsed_ms < config.peer_liveness_timeout_ms {
        reasons.push("peer_liveness_timeout_not_elapsed".to_string());
    }
    if evidence.mirror.lag_ms > config.mirror_max_lag_ms {
        reasons.push("mirror_lag_too_high".to_string());
    }
    let since_sync_ms = (now - evidence.mirror.last_synced_at).num_milliseconds().max(0) as u64;
    if since_sync_ms > config.mirror_window_ms {
        reasons.push("mirror_sync_stale".to_string());
    }

    reasons
}

// ---------------------------------------------------------------------------------------
// Escrow records, lease vault, persistence
// ---------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub id: String,
    pub relay_key: String,
    pub owner_peer_key: String,
    pub encrypted_package: SealedPackage,
    pub policy_version: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Plaintext shape sealed into every escrow deposit: binds the writer-key material to the
/// relay it was deposited for, so `unlock` can refuse to hand back a lease whose payload
/// doesn't match the record it was filed under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowPayload {
    pub relay_key: String,
    pub writer_key_b64: String,
}

impl EscrowPayload {
    pub fn encode(relay_key: &str, writer_key: &[u8]) -> Vec<u8> {
        use base64::Engine;
        let payload = EscrowPayload {
            relay_key: relay_key.to_string(),
            writer_key_b64: base64::engine::general_purpose::STANDARD.encode(writer_key),
        };
        serde_json::to_vec(&payload).expect("EscrowPayload serializes")
    }

    pub fn writer_key(&self) -> Result<Vec<u8>, EscrowError> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&self.writer_key_b64)
            .map_err(|_| EscrowError::DecryptFailed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub kind: String,
    pub escrow_id: String,
    pub at: DateTime<Utc>,
    pub reasons: Vec<String>,
}

/// Writer-key bytes held only as long as a lease is active; zeroized on every exit path.
pub struct LeaseSecret(Vec<u8>);

impl Drop for LeaseSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

pub struct Lease {
    pub lease_id: String,
    pub escrow_id: String,
    pub relay_key: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payload_digest: String,
    pub secret: LeaseSecret,
    unlocks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedRecords {
    version: u32,
    records: Vec<EscrowRecord>,
}

pub struct EscrowService {
    config: EscrowConfig,
    secret_key: StaticSecret,
    public_key: PublicKey,
    records: DashMap<String, EscrowRecord>,
    leases: DashMap<String, Lease>,
    audit_log: Mutex<Vec<AuditEntry>>,
    persist_lock: Mutex<()>,
}

impl EscrowService {
    pub fn new(config: EscrowConfig, secret_key: StaticSecret) -> Self {
        let public_key = PublicKey::from(&secret_key);
        Self {
            config,
            secret_key,
            public_key,
            records: DashMap::new(),
            leases: DashMap::new(),
            audit_log: Mutex::new(Vec::new()),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn keypair_path(&self) -> PathBuf {
        PathBuf::from(&self.config.storage_dir).join("keypair.json")
    }

    fn records_path(&self) -> PathBuf {
        PathBuf::from(&self.config.storage_dir).join("escrow-records.json")
    }

    /// Loads persisted keypair bytes, generating and persisting a fresh one if absent, using
    /// the same atomic write-then-rename discipline as `persist_records`.
    pub async fn load_or_generate_keypair(storage_dir: &str) -> GatewayResult<StaticSecret> {
        let path = PathBuf::from(storage_dir).join("keypair.json");
        if let Ok(bytes) = tokio::fs::read(&path).await {
            #[derive(Deserialize)]
            struct KeypairFile {
                secret_key: String,
            }
            let parsed: KeypairFile =
                serde_json::from_slice(&bytes).map_err(GatewayError::internal)?;
            use base64::Engine;
            let raw = base64::engine::general_purpose::STANDARD
                .decode(parsed.secret_key)
                .map_err(GatewayError::internal)?;
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&raw);
            return Ok(StaticSecret::from(arr));
        }

        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        #[derive(Serialize)]
        struct KeypairFile {
            public_key: String,
            secret_key: String,
        }
        use base64::Engine;
        let file = KeypairFile {
            public_key: base64::engine::general_purpose::STANDARD.encode(public.to_bytes()),
            secret_key: base64::engine::general_purpose::STANDARD.encode(secret.to_bytes()),
        };
        tokio::fs::create_dir_all(storage_dir)
            .await
            .map_err(GatewayError::internal)?;
        atomic_write_json(&path, &file).await?;
        Ok(secret)
    }

    pub async fn persist_records(&self) -> GatewayResult<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = PersistedRecords {
            version: 1,
            records: self.records.iter().map(|e| e.value().clone()).collect(),
        };
        tokio::fs::create_dir_all(&self.config.storage_dir)
            .await
            .map_err(GatewayError::internal)?;
        atomic_write_json(&self.records_path(), &snapshot).await
    }

    pub async fn load_records(&self) -> GatewayResult<()> {
        match tokio::fs::read(self.records_path()).await {
            Ok(bytes) => {
                let parsed: PersistedRecords =
                    serde_json::from_slice(&bytes).map_err(GatewayError::internal)?;
                for record in parsed.records {
                    self.records.insert(record.id.clone(), record);
                }
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    /// Deposits a new escrow record, clamping `expires_at` to the configured TTL cap (§8 B3).
    pub fn deposit(
        &self,
        relay_key: String,
        owner_peer_key: String,
        encrypted_package: SealedPackage,
        policy_version: u32,
        requested_expires_at: DateTime<Utc>,
    ) -> EscrowRecord {
        let now = Utc::now();
        let max_expiry = now + chrono::Duration::milliseconds(self.config.deposit_ttl_ms as i64);
        let expires_at = requested_expires_at.min(max_expiry);

        let record = EscrowRecord {
            id: Uuid::new_v4().to_string(),
            relay_key,
            owner_peer_key,
            encrypted_package,
            policy_version,
            created_at: now,
            expires_at,
            revoked_at: None,
        };
        self.records.insert(record.id.clone(), record.clone());
        self.audit(&record.id, "deposit", Vec::new());
        record
    }

    fn audit(&self, escrow_id: &str, kind: &str, reasons: Vec<String>) {
        if let Ok(mut log) = self.audit_log.try_lock() {
            log.push(AuditEntry {
                kind: kind.to_string(),
                escrow_id: escrow_id.to_string(),
                at: Utc::now(),
                reasons,
            });
        }
    }

    /// Evaluates policy and, on success, mints a lease sealed to `session_public`.
    pub fn unlock(
        &self,
        escrow_id: &str,
        session_public: &PublicKey,
        evidence: UnlockEvidence,
    ) -> Result<(SealedPackage, String), EscrowError> {
        let record = self.records.get(escrow_id).ok_or(EscrowError::NotFound)?.clone();

        if record.revoked_at.is_some() {
            self.audit(escrow_id, "unlock_rejected", vec!["revoked".to_string()]);
            return Err(EscrowError::Revoked);
        }
        if record.expires_at < Utc::now() {
            self.audit(escrow_id, "unlock_rejected", vec!["expired".to_string()]);
            return Err(EscrowError::Expired);
        }

        let reasons = evaluate_policy(&self.config, &evidence);
        if !reasons.is_empty() {
            self.audit(escrow_id, "unlock_rejected", reasons.clone());
            return Err(EscrowError::PolicyRejected(reasons));
        }

        let plaintext = open(&record.encrypted_package, &self.secret_key)?;
        let payload: EscrowPayload =
            serde_json::from_slice(&plaintext).map_err(|_| EscrowError::DecryptFailed)?;
        if payload.relay_key != record.relay_key {
            self.audit(escrow_id, "unlock_rejected", vec!["relay_key_mismatch".to_string()]);
            return Err(EscrowError::RelayKeyMismatch);
        }
        let resealed = seal(&plaintext, session_public);
        let digest = {
            use sha2::Digest;
            hex::encode(Sha256::digest(&plaintext))
        };

        let lease_id = Uuid::new_v4().to_string();
        let lease = Lease {
            lease_id: lease_id.clone(),
            escrow_id: escrow_id.to_string(),
            relay_key: record.relay_key.clone(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::milliseconds(self.config.lease_ttl_ms as i64),
            payload_digest: digest,
            secret: LeaseSecret(plaintext),
            unlocks: 1,
        };
        self.leases.insert(lease_id.clone(), lease);
        self.audit(escrow_id, "unlock_granted", Vec::new());
        Ok((resealed, lease_id))
    }

    /// Enforces §4.7's "at most `max_unlocks_per_lease` active unlocks" invariant.
    pub fn record_additional_unlock(&self, lease_id: &str) -> Result<(), EscrowError> {
        let mut lease = self.leases.get_mut(lease_id).ok_or(EscrowError::NotFound)?;
        if lease.unlocks >= self.config.max_unlocks_per_lease {
            return Err(EscrowError::UnlockBudgetExhausted);
        }
        lease.unlocks += 1;
        Ok(())
    }

    pub fn revoke(&self, escrow_id: &str) -> Result<(), EscrowError> {
        let mut record = self.records.get_mut(escrow_id).ok_or(EscrowError::NotFound)?;
        record.revoked_at = Some(Utc::now());
        drop(record);
        self.leases.retain(|_, lease| lease.escrow_id != escrow_id);
        self.audit(escrow_id, "revoke", Vec::new());
        Ok(())
    }

    /// Sweeps expired leases, zeroizing their secret material on removal. Run every 30s.
    pub fn sweep_expired_leases(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .leases
            .iter()
            .filter(|e| e.expires_at < now)
            .map(|e| e.key().clone())
            .collect();
        for id in &expired {
            self.leases.remove(id);
        }
        expired.len()
    }

    pub fn active_lease_count(&self) -> usize {
        self.leases.len()
    }

    pub fn has_active_lease_for_relay(&self, relay_key: &str) -> bool {
        self.leases.iter().any(|e| e.relay_key == relay_key)
    }

    pub fn audit_log_snapshot(&self) -> Vec<AuditEntry> {
        self.audit_log
            .try_lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

async fn atomic_write_json<T: Serialize>(path: &PathBuf, value: &T) -> GatewayResult<()> {
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value).map_err(GatewayError::internal)?;
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(GatewayError::internal)?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(GatewayError::internal)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_secret(byte: u8) -> StaticSecret {
        StaticSecret::from([byte; 32])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let receiver_secret = fixed_secret(7);
        let receiver_public = PublicKey::from(&receiver_secret);
        let package = seal(b"writer-key-material", &receiver_public);
        let opened = open(&package, &receiver_secret).unwrap();
        assert_eq!(opened, b"writer-key-material");
    }

    #[test]
    fn test_open_fails_with_wrong_secret() {
        let receiver_secret = fixed_secret(7);
        let receiver_public = PublicKey::from(&receiver_secret);
        let package = seal(b"writer-key-material", &receiver_public);
        let wrong_secret = fixed_secret(9);
        assert!(open(&package, &wrong_secret).is_err());
    }

    #[test]
    fn test_open_fails_on_tampered_ciphertext() {
        let receiver_secret = fixed_secret(7);
        let receiver_public = PublicKey::from(&receiver_secret);
        let mut package = seal(b"writer-key-material", &receiver_public);
        package.cipher_text[0] ^= 0xFF;
        assert!(open(&package, &receiver_secret).is_err());
    }

    fn fresh_service() -> EscrowService {
        let config = EscrowConfig {
            peer_liveness_timeout_ms: 0,
            mirror_max_lag_ms: 1000,
            mirror_window_ms: 10_000,
            require_registration_flag: true,
            ..EscrowConfig::default()
        };
        EscrowService::new(config, fixed_secret(3))
    }

    fn healthy_evidence() -> UnlockEvidence {
        UnlockEvidence {
            registration: RegistrationEvidence { escrow_enabled: true },
            peer_health: PeerHealthEvidence {
                healthy_count: 2,
                last_healthy_at: Utc::now(),
            },
            mirror: MirrorEvidence {
                lag_ms: 0,
                last_synced_at: Utc::now(),
            },
        }
    }

    fn silent_evidence() -> UnlockEvidence {
        UnlockEvidence {
            registration: RegistrationEvidence { escrow_enabled: true },
            peer_health: PeerHealthEvidence {
                healthy_count: 0,
                last_healthy_at: Utc::now() - chrono::Duration::seconds(120),
            },
            mirror: MirrorEvidence {
                lag_ms: 0,
                last_synced_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_unlock_rejected_while_peers_healthy() {
        let service = fresh_service();
        let session_secret = fixed_secret(11);
        let session_public = PublicKey::from(&session_secret);
        let package = seal(&EscrowPayload::encode("relay:1", b"key-bytes"), &service.public_key());
        let record = service.deposit(
            "relay:1".into(),
            "peerA".into(),
            package,
            1,
            Utc::now() + chrono::Duration::hours(1),
        );
        let result = service.unlock(&record.id, &session_public, healthy_evidence());
        assert!(result.is_err());
        assert_eq!(service.active_lease_count(), 0);
    }

    #[test]
    fn test_unlock_granted_once_peers_silent() {
        let service = fresh_service();
        let session_secret = fixed_secret(11);
        let session_public = PublicKey::from(&session_secret);
        let package = seal(&EscrowPayload::encode("relay:1", b"key-bytes"), &service.public_key());
        let record = service.deposit(
            "relay:1".into(),
            "peerA".into(),
            package,
            1,
            Utc::now() + chrono::Duration::hours(1),
        );
        let (resealed, lease_id) = service.unlock(&record.id, &session_public, silent_evidence()).unwrap();
        let opened = open(&resealed, &session_secret).unwrap();
        let payload: EscrowPayload = serde_json::from_slice(&opened).unwrap();
        assert_eq!(payload.writer_key().unwrap(), b"key-bytes");
        assert_eq!(service.active_lease_count(), 1);

        service.leases.get_mut(&lease_id).unwrap().expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert_eq!(service.sweep_expired_leases(), 1);
        assert_eq!(service.active_lease_count(), 0);
    }

    #[test]
    fn test_revoke_releases_leases() {
        let service = fresh_service();
        let session_secret = fixed_secret(11);
        let session_public = PublicKey::from(&session_secret);
        let package = seal(&EscrowPayload::encode("relay:1", b"key-bytes"), &service.public_key());
        let record = service.deposit(
            "relay:1".into(),
            "peerA".into(),
            package,
            1,
            Utc::now() + chrono::Duration::hours(1),
        );
        service.unlock(&record.id, &session_public, silent_evidence()).unwrap();
        service.revoke(&record.id).unwrap();
        assert_eq!(service.active_lease_count(), 0);
        assert!(matches!(
            service.unlock(&record.id, &session_public, silent_evidence()),
            Err(EscrowError::Revoked)
        ));
    }

    #[test]
    fn test_unlock_rejects_relay_key_mismatch() {
        let service = fresh_service();
        let session_secret = fixed_secret(11);
        let session_public = PublicKey::from(&session_secret);
        let package = seal(&EscrowPayload::encode("relay:other", b"key-bytes"), &service.public_key());
        let record = service.deposit(
            "relay:1".into(),
            "peerA".into(),
            package,
            1,
            Utc::now() + chrono::Duration::hours(1),
        );
        assert!(matches!(
            service.unlock(&record.id, &session_public, silent_evidence()),
            Err(EscrowError::RelayKeyMismatch)
        ));
    }

    #[test]
    fn test_deposit_clamps_expiry_to_ttl_cap() {
        let mut config = EscrowConfig::default();
        config.deposit_ttl_ms = 1000;
        let service = EscrowService::new(config, fixed_secret(3));
        let package = seal(b"k", &service.public_key());
        let far_future = Utc::now() + chrono::Duration::days(365);
        let record = service.deposit("relay:1".into(), "peerA".into(), package, 1, far_future);
        assert!(record.expires_at <= Utc::now() + chrono::Duration::milliseconds(1100));
    }
}
