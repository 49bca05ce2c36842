//! Machine-readable error codes shared by every outbound `error` envelope
//! and by the CORS/admission problem-details responses (spec §6, §7).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidMessage,
    InvalidGameType,
    InvalidBet,
    NoActiveGame,
    InsufficientBalance,
    NotRegistered,
    BackendUnavailable,
    TransactionRejected,
    NonceMismatch,
    InternalError,
    SessionExpired,
    GameInProgress,
    RegistrationFailed,
    RateLimited,
    CorsOriginNotAllowed,
    CorsOriginRequired,
    IpLimitExceeded,
    SessionCapReached,
}

impl ErrorCode {
    /// The exact `SCREAMING_SNAKE_CASE` wire form used in JSON payloads.
    pub fn as_str(self) -> &'static str {
        use ErrorCode::*;
        match self {
            InvalidMessage => "INVALID_MESSAGE",
            InvalidGameType => "INVALID_GAME_TYPE",
            InvalidBet => "INVALID_BET",
            NoActiveGame => "NO_ACTIVE_GAME",
            InsufficientBalance => "INSUFFICIENT_BALANCE",
            NotRegistered => "NOT_REGISTERED",
            BackendUnavailable => "BACKEND_UNAVAILABLE",
            TransactionRejected => "TRANSACTION_REJECTED",
            NonceMismatch => "NONCE_MISMATCH",
            InternalError => "INTERNAL_ERROR",
            SessionExpired => "SESSION_EXPIRED",
            GameInProgress => "GAME_IN_PROGRESS",
            RegistrationFailed => "REGISTRATION_FAILED",
            RateLimited => "RATE_LIMITED",
            CorsOriginNotAllowed => "CORS_ORIGIN_NOT_ALLOWED",
            CorsOriginRequired => "CORS_ORIGIN_REQUIRED",
            IpLimitExceeded => "IP_LIMIT_EXCEEDED",
            SessionCapReached => "SESSION_CAP_REACHED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a backend-reported numeric error code to our taxonomy (spec §6).
/// Unknown codes fall back to `TransactionRejected`, with the backend's own
/// message preserved by the caller as the user-facing text.
pub fn map_backend_error_code(code: i64) -> ErrorCode {
    match code {
        3 => ErrorCode::InsufficientBalance,
        6 => ErrorCode::NoActiveGame,
        15 => ErrorCode::SessionExpired,
        _ => ErrorCode::TransactionRejected,
    }
}

/// True if a backend error message matches the nonce-mismatch/replay
/// patterns that must clear the pending set and schedule a resync
/// (spec §4.1 "Nonce-mismatch detection").
pub fn is_nonce_mismatch_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("invalid nonce") || lower.contains("nonce mismatch") || lower.contains("replay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_backend_codes_map_per_table() {
        assert_eq!(map_backend_error_code(3), ErrorCode::InsufficientBalance);
        assert_eq!(map_backend_error_code(6), ErrorCode::NoActiveGame);
        assert_eq!(map_backend_error_code(15), ErrorCode::SessionExpired);
        assert_eq!(map_backend_error_code(9999), ErrorCode::TransactionRejected);
    }

    #[test]
    fn nonce_mismatch_patterns_are_detected_case_insensitively() {
        assert!(is_nonce_mismatch_message("Invalid Nonce supplied"));
        assert!(is_nonce_mismatch_message("nonce mismatch on account"));
        assert!(is_nonce_mismatch_message("possible REPLAY detected"));
        assert!(!is_nonce_mismatch_message("insufficient funds"));
    }
}
