//! Health/readiness/metrics endpoints (spec §6 "HTTP endpoints").
//!
//! `/livez` never checks dependencies; `/healthz`/`/readyz` probe the
//! backend; `/metrics` requires a `Bearer`/`x-metrics-token` credential
//! compared in constant time, refusing obvious placeholder values.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::backend_client::BackendClient;
use crate::config::GatewayConfig;
use crate::forwarder::Forwarder;
use crate::presence::PresenceTracker;
use crate::session::SessionManager;
use crate::shutdown::DrainCoordinator;

pub struct HealthState<B: BackendClient> {
    pub config: GatewayConfig,
    pub backend: Arc<B>,
    pub forwarder: Arc<Forwarder<B>>,
    pub sessions: Arc<SessionManager>,
    pub presence: Arc<PresenceTracker>,
    pub drain: Arc<DrainCoordinator>,
}

pub async fn livez() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

pub async fn healthz<B: BackendClient>(State(state): State<Arc<HealthState<B>>>) -> impl IntoResponse {
    readiness_response(&state).await
}

pub async fn readyz<B: BackendClient>(State(state): State<Arc<HealthState<B>>>) -> impl IntoResponse {
    readiness_response(&state).await
}

async fn readiness_response<B: BackendClient>(state: &HealthState<B>) -> (StatusCode, Json<serde_json::Value>) {
    if state.drain.is_draining() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "draining"})),
        );
    }
    if state.backend.health().await {
        (StatusCode::OK, Json(json!({"status": "ok"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unreachable"})),
        )
    }
}

fn is_development(environment: &str) -> bool {
    matches!(environment, "development" | "test")
}

fn is_placeholder(token: &str) -> bool {
    token.starts_with("your_") || token.starts_with("PLACEHOLDER_")
}

/// Constant-time credential check against `METRICS_AUTH_TOKEN`, honoring
/// either `Authorization: Bearer <token>` or `x-metrics-token`.
fn metrics_authorized(headers: &HeaderMap, expected: &str) -> bool {
    let presented = headers
        .get("x-metrics-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        });

    match presented {
        Some(token) => token.as_bytes().ct_eq(expected.as_bytes()).into(),
        None => false,
    }
}

pub async fn metrics<B: BackendClient>(
    State(state): State<Arc<HealthState<B>>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !is_development(&state.config.environment) {
        match &state.config.metrics_auth_token {
            None => return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "unauthorized"}))),
            Some(token) if is_placeholder(token) => {
                return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "unauthorized"})))
            }
            Some(token) if !metrics_authorized(&headers, token) => {
                return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "unauthorized"})))
            }
            Some(_) => {}
        }
    }

    let metrics = &state.forwarder.metrics;
    (
        StatusCode::OK,
        Json(json!({
            "sessions_active": state.sessions.len().await,
            "online_count": state.presence.online_count().await,
            "active_games": state.presence.active_game_count().await,
            "forwarder_total_entries": metrics.total_entries.load(Ordering::Relaxed),
            "forwarder_completed": metrics.completed.load(Ordering::Relaxed),
            "forwarder_failed": metrics.failed.load(Ordering::Relaxed),
            "forwarder_retries": metrics.retries.load(Ordering::Relaxed),
            "forwarder_deduplicated": metrics.deduplicated.load(Ordering::Relaxed),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_tokens_are_rejected() {
        assert!(is_placeholder("your_token_here"));
        assert!(is_placeholder("PLACEHOLDER_TOKEN"));
        assert!(!is_placeholder("a-real-looking-secret"));
    }

    #[test]
    fn development_environments_bypass_auth() {
        assert!(is_development("development"));
        assert!(is_development("test"));
        assert!(!is_development("production"));
    }

    #[test]
    fn metrics_token_must_match_exactly() {
        let mut headers = HeaderMap::new();
        headers.insert("x-metrics-token", "correct-token".parse().unwrap());
        assert!(metrics_authorized(&headers, "correct-token"));
        assert!(!metrics_authorized(&headers, "wrong-token"));
    }

    #[test]
    fn bearer_header_is_also_honored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer correct-token".parse().unwrap(),
        );
        assert!(metrics_authorized(&headers, "correct-token"));
    }
}
