//! Custodial keys and nonce allocation (spec §4.1, component C1).
//!
//! One [`KeyEntry`] per live session's public key, held in a sharded map
//! guarded by its own mutex so two handlers racing to submit on the same
//! key serialize instead of corrupting the nonce sequence. Ed25519 work
//! follows `dmrl789-IPPAN/crates/crypto/src/signature_schemes.rs`'s use of
//! `ed25519_dalek::SigningKey` + `rand_core::OsRng`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use protocol::wire::{assemble_transaction, build_signature_payload, parse_transaction, NAMESPACE};

/// Per-key nonce state. `current` is the next unused nonce; `pending`
/// tracks submitted-but-unconfirmed ones (spec §3 `NonceEntry`).
#[derive(Debug, Default)]
pub struct NonceEntry {
    pub current: u64,
    pub pending: BTreeSet<u64>,
}

impl NonceEntry {
    /// Atomically hands out the next nonce and marks it pending.
    fn allocate(&mut self) -> u64 {
        let nonce = self.current;
        self.current += 1;
        self.pending.insert(nonce);
        nonce
    }

    fn confirm(&mut self, nonce: u64) {
        self.pending.remove(&nonce);
    }

    /// Backend-restart guard (spec §4.1): a reported `0` is ignored if we
    /// already have forward progress locally; every other report is adopted.
    fn sync_from_backend(&mut self, backend_nonce: u64) {
        if backend_nonce == 0 && self.current > 0 {
            tracing::warn!(
                local_current = self.current,
                "backend reported nonce 0 with local progress, retaining local nonce"
            );
        } else {
            self.current = backend_nonce;
        }
        self.pending.clear();
    }

    /// Nonce-mismatch detection (spec §4.1): clears `pending` without
    /// touching `current`, so the next allocation still moves forward.
    fn clear_pending(&mut self) {
        self.pending.clear();
    }
}

/// One session's ephemeral signing identity plus its serialized nonce state.
pub struct KeyEntry {
    pub signing_key: SigningKey,
    pub nonce: Mutex<NonceEntry>,
}

impl KeyEntry {
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }
}

/// Generates a fresh Ed25519 keypair from the OS CSPRNG, rejecting
/// degenerate (all-zero / all-same-byte) keys per spec §4.1.
pub fn generate_keypair() -> SigningKey {
    loop {
        let key = SigningKey::generate(&mut OsRng);
        let bytes = key.to_bytes();
        let first = bytes[0];
        if bytes.iter().all(|b| *b == 0) || bytes.iter().all(|b| *b == first) {
            continue;
        }
        return key;
    }
}

/// Sharded registry of per-key signing identities, keyed by the session id
/// that owns each key (spec §9 "per-key mutex map"). One key per session,
/// so the shard key doubles as the session id.
#[derive(Default)]
pub struct KeyRegistry {
    keys: Mutex<HashMap<String, Arc<KeyEntry>>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, session_id: &str) -> Arc<KeyEntry> {
        self.create_with_key(session_id, generate_keypair()).await
    }

    /// Registers an already-generated signing key under `session_id`. Used
    /// when the key's public hex must be known before the session itself is
    /// constructed (spec §4.1 "session id and public key are assigned
    /// together").
    pub async fn create_with_key(&self, session_id: &str, signing_key: SigningKey) -> Arc<KeyEntry> {
        let entry = Arc::new(KeyEntry {
            signing_key,
            nonce: Mutex::new(NonceEntry::default()),
        });
        self.keys
            .lock()
            .await
            .insert(session_id.to_string(), entry.clone());
        entry
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<KeyEntry>> {
        self.keys.lock().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &str) {
        self.keys.lock().await.remove(session_id);
    }
}

/// Builds and signs a transaction for `instruction` under `key`'s per-key
/// lock, returning the wire bytes and the nonce consumed. Holds the lock
/// for the shortest span that keeps allocation+signing atomic.
pub async fn build_signed_transaction(key: &KeyEntry, instruction: &[u8]) -> (Vec<u8>, u64) {
    let mut nonce_guard = key.nonce.lock().await;
    let nonce = nonce_guard.allocate();
    drop(nonce_guard);

    let payload = build_signature_payload(nonce, instruction);
    let signature = key.signing_key.sign(&payload);
    let pubkey = key.signing_key.verifying_key().to_bytes();
    let tx = assemble_transaction(nonce, instruction, &pubkey, &signature.to_bytes());
    (tx, nonce)
}

/// Marks a submitted nonce confirmed once the backend accepts it.
pub async fn confirm_nonce(key: &KeyEntry, nonce: u64) {
    key.nonce.lock().await.confirm(nonce);
}

/// Applies the backend-restart guard after an account refresh.
pub async fn sync_nonce_from_backend(key: &KeyEntry, backend_nonce: u64) {
    key.nonce.lock().await.sync_from_backend(backend_nonce);
}

/// Clears in-flight nonces after a detected nonce-mismatch rejection,
/// scheduling the caller to resync without losing forward progress.
pub async fn clear_pending_on_mismatch(key: &KeyEntry) {
    key.nonce.lock().await.clear_pending();
}

/// Derives the backend's numeric session id from a session's public key,
/// so it is known before any backend event names it (spec §9 open
/// question: "the backend's notion of session_id... preserved by the
/// gateway"). Taking the first 8 bytes of the key's digest keeps it stable
/// for the lifetime of the key without round-tripping through the backend.
pub fn derive_backend_session_id(public_key_hex: &str) -> u64 {
    let digest = Sha256::digest(public_key_hex.as_bytes());
    u64::from_be_bytes(digest[0..8].try_into().expect("digest is 32 bytes"))
}

/// Verifies a wire-format transaction's signature against the domain
/// separation namespace. Used by tests and by any replay validation.
pub fn verify_transaction(bytes: &[u8]) -> bool {
    let Some(parsed) = parse_transaction(bytes) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&parsed.pubkey) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&parsed.signature);
    let payload = build_signature_payload(parsed.nonce, &parsed.instruction);
    verifying_key.verify(&payload, &signature).is_ok()
}
