//! Updates Subscriber (spec §4.4/§4.5 C5): a long-lived consumer of the
//! backend's binary event stream. Frames are decoded with
//! `protocol::wire::extract_casino_events` and fanned out to an
//! `EventWaiter` registry (spec §9 "Async control flow") so a handler can
//! await the matching event after a submit, and to session/presence state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{oneshot, Mutex};

use protocol::wire::{extract_casino_events, CasinoEvent};

use crate::presence::PresenceTracker;
use crate::session::SessionManager;

/// Registry of in-flight "wait for this backend session's next event"
/// requests, keyed by the backend's numeric session id (spec §3 `Event`).
#[derive(Default)]
pub struct EventWaiter {
    pending: Mutex<HashMap<u64, oneshot::Sender<CasinoEvent>>>,
}

impl EventWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in the next event for `backend_session_id` and
    /// waits up to `timeout`. Returns `None` on timeout or cancellation —
    /// the caller returns a best-effort, nonce-already-consumed response
    /// in that case (spec §7 "timeout").
    pub async fn wait_for(&self, backend_session_id: u64, timeout: Duration) -> Option<CasinoEvent> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(backend_session_id, tx);
        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().await.remove(&backend_session_id);
        result.ok().and_then(|r| r.ok())
    }

    pub async fn fulfill(&self, backend_session_id: u64, event: CasinoEvent) {
        if let Some(tx) = self.pending.lock().await.remove(&backend_session_id) {
            let _ = tx.send(event);
        }
    }

    /// Drops every pending waiter without fulfilling them, e.g. on shutdown.
    pub async fn cancel_all(&self) {
        self.pending.lock().await.clear();
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn backend_session_id_of(event: &CasinoEvent) -> Option<u64> {
    match event {
        CasinoEvent::GameStarted { session_id, .. }
        | CasinoEvent::GameMove { session_id, .. }
        | CasinoEvent::GameResult { session_id, .. }
        | CasinoEvent::BalanceSnapshot { session_id, .. }
        | CasinoEvent::PlayerSettled { session_id, .. }
        | CasinoEvent::BetAccepted { session_id, .. }
        | CasinoEvent::BetRejected { session_id, .. } => Some(*session_id),
        CasinoEvent::RoundOpened { .. }
        | CasinoEvent::Locked { .. }
        | CasinoEvent::Outcome { .. }
        | CasinoEvent::Finalized { .. } => None,
    }
}

/// Applies one decoded event to session state and wakes any handler
/// awaiting it. `activeGames` presence tracking is driven from here rather
/// than from the client-initiated subscribe handler, since only a confirmed
/// `game_started`/`game_result` from the backend reflects whether a session
/// actually holds an active game. Round-level events (`round_opened`/
/// `locked`/`outcome`/`finalized`) carry no session id; publishing those
/// onto broadcast topics is the caller's job (kept out of this module, spec
/// §4.5).
pub async fn apply_event(
    event: &CasinoEvent,
    sessions: &SessionManager,
    waiter: &EventWaiter,
    presence: &PresenceTracker,
) {
    match event {
        CasinoEvent::GameStarted {
            session_id,
            server_game_id,
            ..
        } => {
            if let Some(session) = sessions.get_by_backend_id(*session_id).await {
                session.apply_server_game_id(*server_game_id, "unknown").await;
                presence.mark_active_game(&session.id).await;
            }
        }
        CasinoEvent::GameResult { session_id, .. } => {
            if let Some(session) = sessions.get_by_backend_id(*session_id).await {
                session.clear_active_game().await;
                presence.clear_active_game(&session.id).await;
            }
        }
        CasinoEvent::PlayerSettled { session_id, .. } => {
            if let Some(session) = sessions.get_by_backend_id(*session_id).await {
                session.clear_active_game().await;
                presence.clear_active_game(&session.id).await;
            }
        }
        CasinoEvent::BalanceSnapshot {
            session_id,
            balance,
            registered,
            has_balance,
        } => {
            if let Some(session) = sessions.get_by_backend_id(*session_id).await {
                session
                    .set_balance(*balance as u128, *registered, *has_balance)
                    .await;
            }
        }
        _ => {}
    }
    if let Some(id) = backend_session_id_of(event) {
        waiter.fulfill(id, event.clone()).await;
    }
}

/// A sink the subscriber hands decoded events to. Applying them to session
/// state and publishing round-level events onto broadcast topics is the
/// caller's responsibility, kept out of this module so it stays I/O-only.
pub trait EventSink: Send + Sync {
    fn handle_event(&self, event: CasinoEvent) -> impl Future<Output = ()> + Send;
}

/// Runs the long-lived HTTP stream loop against `stream_url`, decoding
/// framed updates as they arrive and handing each to `sink`. Reconnects
/// with a fixed backoff on stream failure or EOF; exits once `shutdown`
/// is signaled.
pub async fn run_subscriber<S: EventSink>(
    client: reqwest::Client,
    stream_url: String,
    sink: Arc<S>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        match client.get(&stream_url).send().await {
            Ok(response) => {
                let mut body = response.bytes_stream();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        chunk = body.next() => {
                            match chunk {
                                Some(Ok(bytes)) => {
                                    for op in extract_casino_events(&bytes) {
                                        sink.handle_event(op.event).await;
                                    }
                                }
                                Some(Err(err)) => {
                                    tracing::warn!(?err, "updates subscriber stream read failed");
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(?err, "updates subscriber stream connect failed");
            }
        }
        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waiter_returns_none_on_timeout_when_never_fulfilled() {
        let waiter = EventWaiter::new();
        let result = waiter.wait_for(1, Duration::from_millis(20)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn fulfilled_waiter_returns_the_event() {
        let waiter = Arc::new(EventWaiter::new());
        let w = waiter.clone();
        let handle = tokio::spawn(async move { w.wait_for(7, Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter
            .fulfill(
                7,
                CasinoEvent::GameMove {
                    session_id: 7,
                    move_number: 1,
                },
            )
            .await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Some(CasinoEvent::GameMove { .. })));
    }

    #[tokio::test]
    async fn apply_event_binds_server_game_id_to_the_matching_session() {
        use crate::session::Session;

        let sessions = SessionManager::new();
        let session = Arc::new(Session::new("pk1".into(), "127.0.0.1".into()));
        let id = session.id.clone();
        sessions.insert(session).await;
        sessions.bind_backend_id(&id, 42).await;

        let waiter = EventWaiter::new();
        let presence = PresenceTracker::new();
        apply_event(
            &CasinoEvent::GameStarted {
                session_id: 42,
                server_game_id: 123456,
                bet: 100,
            },
            &sessions,
            &waiter,
            &presence,
        )
        .await;

        let snapshot = sessions.get(&id).await.unwrap().snapshot().await;
        assert_eq!(snapshot.active_game_id, Some(123456));
        assert_eq!(presence.active_game_count().await, 1);
    }

    #[tokio::test]
    async fn game_result_clears_presence_active_game() {
        use crate::session::Session;

        let sessions = SessionManager::new();
        let session = Arc::new(Session::new("pk1".into(), "127.0.0.1".into()));
        let id = session.id.clone();
        sessions.insert(session).await;
        sessions.bind_backend_id(&id, 42).await;

        let waiter = EventWaiter::new();
        let presence = PresenceTracker::new();
        presence.mark_active_game(&id).await;

        apply_event(
            &CasinoEvent::GameResult {
                session_id: 42,
                payout: 50,
                final_chips: 150,
                won: true,
            },
            &sessions,
            &waiter,
            &presence,
        )
        .await;

        assert_eq!(presence.active_game_count().await, 0);
    }
}
