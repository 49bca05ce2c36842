//! Session lifecycle (spec §3 `Session`, §4.1 C6). One `Session` per live
//! client connection; mutated only by the dispatch task that owns its
//! socket, plus the updates subscriber for balance/game-end fields guarded
//! behind the same lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub public_key_hex: String,
    pub balance: u128,
    pub registered: bool,
    pub has_balance: bool,
    pub active_game_id: Option<u64>,
    pub game_type: Option<String>,
    pub client_ip: String,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub backend_session_id: Option<u64>,
}

pub struct Session {
    pub id: String,
    pub public_key_hex: String,
    pub client_ip: String,
    pub created_at: Instant,
    inner: RwLock<Mutable>,
}

struct Mutable {
    balance: u128,
    registered: bool,
    has_balance: bool,
    active_game_id: Option<u64>,
    game_type: Option<String>,
    last_activity_at: Instant,
    backend_session_id: Option<u64>,
}

impl Session {
    pub fn new(public_key_hex: String, client_ip: String) -> Self {
        let now = Instant::now();
        Session {
            id: Uuid::new_v4().to_string(),
            public_key_hex,
            client_ip,
            created_at: now,
            inner: RwLock::new(Mutable {
                balance: 0,
                registered: false,
                has_balance: false,
                active_game_id: None,
                game_type: None,
                last_activity_at: now,
                backend_session_id: None,
            }),
        }
    }

    pub async fn touch(&self) {
        self.inner.write().await.last_activity_at = Instant::now();
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.read().await;
        SessionSnapshot {
            id: self.id.clone(),
            public_key_hex: self.public_key_hex.clone(),
            balance: inner.balance,
            registered: inner.registered,
            has_balance: inner.has_balance,
            active_game_id: inner.active_game_id,
            game_type: inner.game_type.clone(),
            client_ip: self.client_ip.clone(),
            created_at: self.created_at,
            last_activity_at: inner.last_activity_at,
            backend_session_id: inner.backend_session_id,
        }
    }

    /// Binds the backend's numeric session id to this connection, once
    /// learned from a registration response or the first backend event
    /// naming this session (spec §3 `Event`, §9).
    pub async fn bind_backend_id(&self, backend_session_id: u64) {
        self.inner.write().await.backend_session_id = Some(backend_session_id);
    }

    pub async fn backend_session_id(&self) -> Option<u64> {
        self.inner.read().await.backend_session_id
    }

    pub async fn set_balance(&self, balance: u128, registered: bool, has_balance: bool) {
        let mut inner = self.inner.write().await;
        inner.balance = balance;
        inner.registered = registered;
        inner.has_balance = has_balance;
    }

    /// Applies a `game_started` event's server-assigned id. A zero id
    /// preserves whatever the client optimistically set (spec §4.1).
    pub async fn apply_server_game_id(&self, server_game_id: u64, game_type: impl Into<String>) {
        if server_game_id == 0 {
            return;
        }
        let mut inner = self.inner.write().await;
        inner.active_game_id = Some(server_game_id);
        inner.game_type = Some(game_type.into());
    }

    pub async fn clear_active_game(&self) {
        let mut inner = self.inner.write().await;
        inner.active_game_id = None;
        inner.game_type = None;
    }

    pub async fn is_idle(&self, ttl: Duration) -> bool {
        let inner = self.inner.read().await;
        inner.last_activity_at.elapsed() > ttl
    }
}

/// Process-wide session indices: by socket-owned id and by public key
/// (spec §5 "Shared resources" — coarse lock only during insert/remove).
#[derive(Default)]
pub struct SessionManager {
    by_id: RwLock<HashMap<String, Arc<Session>>>,
    by_pubkey: RwLock<HashMap<String, Arc<Session>>>,
    by_backend_id: RwLock<HashMap<u64, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<Session>) {
        let mut by_id = self.by_id.write().await;
        let mut by_pubkey = self.by_pubkey.write().await;
        by_id.insert(session.id.clone(), session.clone());
        by_pubkey.insert(session.public_key_hex.clone(), session);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.by_id.read().await.get(id).cloned()
    }

    pub async fn get_by_pubkey(&self, public_key_hex: &str) -> Option<Arc<Session>> {
        self.by_pubkey.read().await.get(public_key_hex).cloned()
    }

    pub async fn get_by_backend_id(&self, backend_session_id: u64) -> Option<Arc<Session>> {
        self.by_backend_id.read().await.get(&backend_session_id).cloned()
    }

    /// Binds a backend session id to a live session and indexes it,
    /// letting later events routed by that id reach the right connection.
    pub async fn bind_backend_id(&self, id: &str, backend_session_id: u64) {
        if let Some(session) = self.get(id).await {
            session.bind_backend_id(backend_session_id).await;
            self.by_backend_id
                .write()
                .await
                .insert(backend_session_id, session);
        }
    }

    /// Removes a session from every index atomically (spec §3 lifecycle,
    /// §8 invariant 4).
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let mut by_id = self.by_id.write().await;
        let mut by_pubkey = self.by_pubkey.write().await;
        let session = by_id.remove(id)?;
        by_pubkey.remove(&session.public_key_hex);
        if let Some(backend_id) = session.backend_session_id().await {
            self.by_backend_id.write().await.remove(&backend_id);
        }
        Some(session)
    }

    pub async fn len(&self) -> usize {
        self.by_id.read().await.len()
    }

    pub async fn sweep_idle(&self, ttl: Duration) -> Vec<Arc<Session>> {
        let snapshot: Vec<Arc<Session>> = self.by_id.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for session in snapshot {
            if session.is_idle(ttl).await {
                expired.push(session);
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_server_game_id_preserves_local_value() {
        let session = Session::new("abc".into(), "127.0.0.1".into());
        session.apply_server_game_id(0, "blackjack").await;
        assert_eq!(session.snapshot().await.active_game_id, None);
    }

    #[tokio::test]
    async fn nonzero_server_game_id_overrides_optimistic_value() {
        let session = Session::new("abc".into(), "127.0.0.1".into());
        session.apply_server_game_id(99999, "blackjack").await;
        assert_eq!(session.snapshot().await.active_game_id, Some(99999));
    }

    #[tokio::test]
    async fn removed_session_disappears_from_both_indices() {
        let manager = SessionManager::new();
        let session = Arc::new(Session::new("pk1".into(), "127.0.0.1".into()));
        let id = session.id.clone();
        manager.insert(session).await;
        assert!(manager.get(&id).await.is_some());
        manager.remove(&id).await;
        assert!(manager.get(&id).await.is_none());
        assert!(manager.get_by_pubkey("pk1").await.is_none());
    }

    #[tokio::test]
    async fn idle_boundary_is_not_expired_but_one_tick_past_is() {
        let session = Session::new("pk1".into(), "127.0.0.1".into());
        assert!(!session.is_idle(Duration::from_secs(60)).await);
        assert!(session.is_idle(Duration::from_millis(0)).await);
    }
}
