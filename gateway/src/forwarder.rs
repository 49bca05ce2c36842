//! Engine Forwarder (spec §4.2, C4): at-most-once submission to the
//! backend via an idempotency store, with bounded exponential-backoff
//! retries for transient failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::backend_client::{BackendClient, BackendClientError, SubmitRequest, SubmitResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct IdempotencyEntry {
    pub fingerprint: [u8; 32],
    pub status: EntryStatus,
    pub result: Option<SubmitResponse>,
    pub created_at: Instant,
}

fn fingerprint(payload: &[u8]) -> [u8; 32] {
    Sha256::digest(payload).into()
}

#[derive(Debug, Clone)]
pub struct ForwardResult {
    pub response: SubmitResponse,
    pub deduplicated: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("idempotency key already used with a different payload")]
    FingerprintConflict,
    #[error("a submission for this idempotency key is already in flight")]
    InFlight,
    #[error("backend rejected the submission: {0}")]
    Backend(#[from] BackendClientError),
}

#[derive(Default)]
pub struct ForwarderMetrics {
    pub total_entries: std::sync::atomic::AtomicU64,
    pub completed: std::sync::atomic::AtomicU64,
    pub failed: std::sync::atomic::AtomicU64,
    pub retries: std::sync::atomic::AtomicU64,
    pub deduplicated: std::sync::atomic::AtomicU64,
}

pub struct Forwarder<B: BackendClient> {
    backend: Arc<B>,
    entries: Mutex<HashMap<(String, String), IdempotencyEntry>>,
    ttl: Duration,
    max_retries: u32,
    pub metrics: ForwarderMetrics,
}

impl<B: BackendClient> Forwarder<B> {
    pub fn new(backend: Arc<B>, ttl: Duration, max_retries: u32) -> Self {
        Forwarder {
            backend,
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_retries,
            metrics: ForwarderMetrics::default(),
        }
    }

    /// Submits `payload` under `(session_id, idempotency_key)`, honoring the
    /// idempotency rules from spec §4.2. `skip_retries` disables the retry
    /// loop for this submission only.
    pub async fn forward(
        &self,
        session_id: &str,
        idempotency_key: &str,
        payload: Vec<u8>,
        skip_retries: bool,
    ) -> Result<ForwardResult, ForwardError> {
        let fp = fingerprint(&payload);
        let key = (session_id.to_string(), idempotency_key.to_string());

        {
            let mut entries = self.entries.lock().await;
            if let Some(existing) = entries.get(&key) {
                if existing.fingerprint != fp {
                    return Err(ForwardError::FingerprintConflict);
                }
                match existing.status {
                    EntryStatus::Completed => {
                        self.metrics
                            .deduplicated
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        return Ok(ForwardResult {
                            response: existing.result.clone().unwrap_or(SubmitResponse {
                                accepted: true,
                                error_code: None,
                                error_message: None,
                            }),
                            deduplicated: true,
                        });
                    }
                    EntryStatus::Pending => {
                        return Err(ForwardError::InFlight);
                    }
                    EntryStatus::Failed => {
                        // Same fingerprint, allowed to retry below.
                    }
                }
            } else {
                entries.insert(
                    key.clone(),
                    IdempotencyEntry {
                        fingerprint: fp,
                        status: EntryStatus::Pending,
                        result: None,
                        created_at: Instant::now(),
                    },
                );
                self.metrics
                    .total_entries
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }

        let submission_b64 = base64::engine::general_purpose::STANDARD.encode(&payload);
        let attempt = self
            .submit_with_retry(submission_b64, skip_retries)
            .await;

        let mut entries = self.entries.lock().await;
        match &attempt {
            Ok(response) => {
                entries.insert(
                    key,
                    IdempotencyEntry {
                        fingerprint: fp,
                        status: EntryStatus::Completed,
                        result: Some(response.clone()),
                        created_at: Instant::now(),
                    },
                );
                self.metrics
                    .completed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(ForwardResult {
                    response: response.clone(),
                    deduplicated: false,
                })
            }
            Err(_) => {
                entries.insert(
                    key,
                    IdempotencyEntry {
                        fingerprint: fp,
                        status: EntryStatus::Failed,
                        result: None,
                        created_at: Instant::now(),
                    },
                );
                self.metrics
                    .failed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                attempt.map(|response| ForwardResult {
                    response,
                    deduplicated: false,
                })
            }
        }
    }

    async fn submit_with_retry(
        &self,
        submission_b64: String,
        skip_retries: bool,
    ) -> Result<SubmitResponse, ForwardError> {
        let initial = Duration::from_millis(200);
        let max_delay = Duration::from_secs(5);
        let multiplier = 2u32;

        let mut attempt = 0u32;
        loop {
            let result = self
                .backend
                .submit(SubmitRequest {
                    submission_b64: submission_b64.clone(),
                })
                .await;

            match result {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let retryable = !skip_retries && err.is_retryable() && attempt < self.max_retries;
                    if !retryable {
                        return Err(ForwardError::Backend(err));
                    }
                    self.metrics
                        .retries
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let base = initial.saturating_mul(multiplier.saturating_pow(attempt));
                    let delay = base.min(max_delay);
                    let jitter_frac = rand::thread_rng().gen_range(-0.1f64..=0.1f64);
                    let jittered = delay.mul_f64((1.0 + jitter_frac).max(0.0));
                    tokio::time::sleep(jittered).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Removes entries older than the configured TTL. Intended to be driven
    /// by a periodic sweeper task.
    pub async fn sweep_expired(&self) {
        let mut entries = self.entries.lock().await;
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.created_at.elapsed() < ttl);
    }

    /// Removes every entry owned by a closing session (spec §4.2 "Session
    /// cleanup").
    pub async fn remove_session(&self, session_id: &str) {
        let mut entries = self.entries.lock().await;
        entries.retain(|(sid, _), _| sid != session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_client::mock::MockBackendClient;

    #[tokio::test]
    async fn first_submission_completes_and_is_recorded() {
        let backend = Arc::new(MockBackendClient::new());
        let forwarder = Forwarder::new(backend.clone(), Duration::from_secs(60), 3);
        let result = forwarder
            .forward("s1", "idem-1", b"deal:100".to_vec(), false)
            .await
            .unwrap();
        assert!(!result.deduplicated);
        assert_eq!(backend.submissions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn identical_replay_is_deduplicated() {
        let backend = Arc::new(MockBackendClient::new());
        let forwarder = Forwarder::new(backend.clone(), Duration::from_secs(60), 3);
        forwarder
            .forward("s1", "idem-1", b"deal:100".to_vec(), false)
            .await
            .unwrap();
        let second = forwarder
            .forward("s1", "idem-1", b"deal:100".to_vec(), false)
            .await
            .unwrap();
        assert!(second.deduplicated);
        assert_eq!(backend.submissions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn different_payload_with_same_key_is_refused() {
        let backend = Arc::new(MockBackendClient::new());
        let forwarder = Forwarder::new(backend.clone(), Duration::from_secs(60), 3);
        forwarder
            .forward("s1", "idem-1", b"deal:100".to_vec(), false)
            .await
            .unwrap();
        let err = forwarder
            .forward("s1", "idem-1", b"deal:200".to_vec(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::FingerprintConflict));
    }

    #[tokio::test]
    async fn concurrent_attempt_while_pending_is_refused() {
        let backend = Arc::new(MockBackendClient::new());
        let forwarder = Forwarder::new(backend.clone(), Duration::from_secs(60), 3);
        {
            let mut entries = forwarder.entries.lock().await;
            entries.insert(
                ("s1".to_string(), "idem-1".to_string()),
                IdempotencyEntry {
                    fingerprint: fingerprint(b"deal:100"),
                    status: EntryStatus::Pending,
                    result: None,
                    created_at: Instant::now(),
                },
            );
        }
        let err = forwarder
            .forward("s1", "idem-1", b"deal:100".to_vec(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::InFlight));
        assert!(backend.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_cleanup_removes_only_that_sessions_entries() {
        let backend = Arc::new(MockBackendClient::new());
        let forwarder = Forwarder::new(backend.clone(), Duration::from_secs(60), 3);
        forwarder
            .forward("s1", "idem-1", b"a".to_vec(), false)
            .await
            .unwrap();
        forwarder
            .forward("s2", "idem-1", b"b".to_vec(), false)
            .await
            .unwrap();
        forwarder.remove_session("s1").await;
        let entries = forwarder.entries.lock().await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key(&("s2".to_string(), "idem-1".to_string())));
    }

}
