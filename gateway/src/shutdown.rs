//! Drain coordinator (spec §4.9/§9 C11). Shutdown is driven by a single
//! "drain" flag observed by every worker: new connections are refused with
//! WS close code 1013 ("try again later"), live sessions with no active
//! game are closed immediately, and sessions still mid-game get up to
//! `drain_timeout` before being force-closed with `SESSION_EXPIRED`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use protocol::ErrorCode;

use crate::presence::PresenceTracker;
use crate::session::SessionManager;

pub const CLOSE_CODE_TRY_AGAIN_LATER: u16 = 1013;
pub const CLOSE_CODE_GOING_AWAY: u16 = 1001;

/// Coordinates graceful shutdown plus the force-close signal both `run_drain`
/// and the idle-session sweeper use to tell an already-open connection's own
/// task to send `SESSION_EXPIRED` and close, since neither can reach into
/// another task's socket directly.
pub struct DrainCoordinator {
    draining: AtomicBool,
    force_close: Mutex<HashSet<String>>,
}

impl DrainCoordinator {
    pub fn new() -> Self {
        DrainCoordinator {
            draining: AtomicBool::new(false),
            force_close: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Starts a drain. A second call is a no-op (spec §4.9 "second shutdown
    /// signal is a no-op").
    pub fn begin(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Marks a session for force-close. The owning connection's task polls
    /// `should_close` and closes its own socket once it observes this.
    pub async fn mark_for_close(&self, session_id: &str) {
        self.force_close.lock().await.insert(session_id.to_string());
    }

    pub async fn should_close(&self, session_id: &str) -> bool {
        self.force_close.lock().await.contains(session_id)
    }

    pub async fn clear_close(&self, session_id: &str) {
        self.force_close.lock().await.remove(session_id);
    }
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls every `poll_interval` for sessions still holding an active game;
/// force-closes any session still alive once `drain_timeout` elapses (or
/// active game count reaches zero first). Marks each remaining session on
/// `coordinator` so its own connection task sends `SESSION_EXPIRED` and
/// closes with code 1001, and returns their ids for logging.
pub async fn run_drain(
    coordinator: Arc<DrainCoordinator>,
    sessions: Arc<SessionManager>,
    presence: Arc<PresenceTracker>,
    poll_interval: Duration,
    drain_timeout: Duration,
) -> Vec<String> {
    if !coordinator.begin() {
        return Vec::new();
    }

    let deadline = tokio::time::Instant::now() + drain_timeout;
    loop {
        let active = presence.active_game_count().await;
        if active == 0 || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(poll_interval).await;
    }

    // Whoever is still connected at this point gets force-closed.
    let remaining: Vec<String> = sessions
        .sweep_idle(Duration::from_secs(0))
        .await
        .into_iter()
        .map(|s| s.id.clone())
        .collect();
    for id in &remaining {
        coordinator.mark_for_close(id).await;
    }
    remaining
}

pub fn expired_error_code() -> ErrorCode {
    ErrorCode::SessionExpired
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_call_is_a_no_op() {
        let coordinator = DrainCoordinator::new();
        assert!(coordinator.begin());
        assert!(!coordinator.begin());
        assert!(coordinator.is_draining());
    }

    #[tokio::test]
    async fn run_drain_returns_quickly_once_no_games_are_active() {
        let coordinator = Arc::new(DrainCoordinator::new());
        let sessions = Arc::new(SessionManager::new());
        let presence = Arc::new(PresenceTracker::new());
        let result = run_drain(
            coordinator,
            sessions,
            presence,
            Duration::from_millis(5),
            Duration::from_secs(30),
        )
        .await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn marked_session_reports_as_should_close_until_cleared() {
        let coordinator = DrainCoordinator::new();
        assert!(!coordinator.should_close("s1").await);
        coordinator.mark_for_close("s1").await;
        assert!(coordinator.should_close("s1").await);
        coordinator.clear_close("s1").await;
        assert!(!coordinator.should_close("s1").await);
    }
}
