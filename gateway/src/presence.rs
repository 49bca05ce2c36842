//! Presence & Clock (spec §4.6, C10). Tracks live sockets and how many
//! have an active game, and stamps a monotonic server time + strictly
//! increasing sequence on every `clock_sync` emission.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::RwLock;

use protocol::messages::OutboundMessage;

pub struct PresenceTracker {
    sockets: RwLock<HashSet<String>>,
    active_games: RwLock<HashSet<String>>,
    seq: AtomicU64,
    started_at: Instant,
}

impl PresenceTracker {
    pub fn new() -> Self {
        PresenceTracker {
            sockets: RwLock::new(HashSet::new()),
            active_games: RwLock::new(HashSet::new()),
            seq: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub async fn add(&self, socket_id: &str) {
        self.sockets.write().await.insert(socket_id.to_string());
    }

    pub async fn remove(&self, socket_id: &str) {
        self.sockets.write().await.remove(socket_id);
        self.active_games.write().await.remove(socket_id);
    }

    pub async fn mark_active_game(&self, socket_id: &str) {
        self.active_games.write().await.insert(socket_id.to_string());
    }

    pub async fn clear_active_game(&self, socket_id: &str) {
        self.active_games.write().await.remove(socket_id);
    }

    pub async fn online_count(&self) -> u64 {
        self.sockets.read().await.len() as u64
    }

    pub async fn active_game_count(&self) -> u64 {
        self.active_games.read().await.len() as u64
    }

    pub fn server_time_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Every call returns a strictly larger sequence than the last.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn presence_message(&self) -> OutboundMessage {
        OutboundMessage::Presence {
            online_count: self.online_count().await,
            active_games: Some(self.active_game_count().await),
        }
    }

    pub fn clock_sync_message(&self) -> OutboundMessage {
        OutboundMessage::ClockSync {
            server_time: self.server_time_ms(),
            seq: Some(self.next_seq()),
        }
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn online_count_reflects_add_and_remove() {
        let presence = PresenceTracker::new();
        presence.add("a").await;
        presence.add("b").await;
        assert_eq!(presence.online_count().await, 2);
        presence.remove("a").await;
        assert_eq!(presence.online_count().await, 1);
    }

    #[test]
    fn sequence_strictly_increases() {
        let presence = PresenceTracker::new();
        let a = presence.next_seq();
        let b = presence.next_seq();
        assert!(b > a);
    }
}
