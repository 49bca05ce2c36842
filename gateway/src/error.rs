//! The gateway's single error type. Every failure a handler can produce
//! collapses into a [`GatewayError`] carrying the machine-readable code
//! from the outbound `{type:"error", code, ...}` envelope (spec §6/§7),
//! mirroring how `x402-rs`'s `FacilitatorClientError` carries a `context`
//! alongside each variant.

use protocol::ErrorCode;
use protocol::messages::OutboundMessage;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{code}: {message}")]
    Protocol {
        code: ErrorCode,
        message: String,
        retry_after: Option<u64>,
    },

    #[error("backend request failed: {0}")]
    Backend(#[from] reqwest::Error),

    #[error("idempotency key already used with a different payload")]
    IdempotencyConflict,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(code: ErrorCode, message: impl Into<String>) -> Self {
        GatewayError::Protocol {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        GatewayError::Protocol {
            code: ErrorCode::RateLimited,
            message: "rate limit exceeded".to_string(),
            retry_after: Some(retry_after_secs),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Protocol { code, .. } => *code,
            GatewayError::Backend(_) => ErrorCode::BackendUnavailable,
            GatewayError::IdempotencyConflict => ErrorCode::InvalidMessage,
            GatewayError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::Protocol { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Renders this error as the outbound JSON envelope clients expect.
    pub fn to_outbound(&self) -> OutboundMessage {
        match self.retry_after() {
            Some(secs) => OutboundMessage::error_with_retry(self.code(), self.to_string(), secs),
            None => OutboundMessage::error(self.code(), self.to_string()),
        }
    }
}

/// Aggregated configuration failure: every invalid/missing key at once,
/// grounded in `x402-rs-x402-rs/facilitator/src/config.rs::ConfigError`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", format_invalid(.0))]
    Invalid(Vec<(String, String)>),
}

fn format_invalid(entries: &[(String, String)]) -> String {
    entries
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}
