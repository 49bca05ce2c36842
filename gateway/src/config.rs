//! Environment-driven configuration, resolved the way `x402-rs`'s
//! `config_defaults` resolves `$PORT`/`$HOST`: every field has a typed
//! parse and a default, aggregated into one fallible load so a bad
//! deployment fails with every broken key at once instead of one at a time.

use std::env;
use std::time::Duration;

use crate::error::ConfigError;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, (String, String)> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) if raw.is_empty() => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| (key.to_string(), raw)),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, (String, String)> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) if raw.is_empty() => Ok(default),
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err((key.to_string(), raw)),
        },
    }
}

/// Redacts a secret for inclusion in an error message: short values are
/// wholly hidden, longer ones keep a short prefix. Per spec §7.
pub fn redact(secret: &str) -> String {
    if secret.len() < 8 {
        "[REDACTED]".to_string()
    } else {
        format!("{}…", &secret[..4])
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub backend_url: String,
    pub environment: String,

    pub allowed_origins: Vec<String>,
    pub allow_no_origin: bool,
    pub trusted_proxy_cidrs: Vec<String>,

    pub session_rate_limit_points: u32,
    pub max_connections_per_ip: u32,
    pub max_total_sessions: u32,

    pub event_timeout: Duration,
    pub drain_timeout: Duration,
    pub idle_session_ttl: Duration,

    pub idempotency_ttl: Duration,
    pub forwarder_max_retries: u32,

    pub metrics_auth_token: Option<String>,
}

impl GatewayConfig {
    fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Loads configuration from the process environment, aggregating every
    /// invalid or (in production) missing-required key into one error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut invalid: Vec<(String, String)> = Vec::new();
        let mut note = |result: Result<(), (String, String)>| {
            if let Err(e) = result {
                invalid.push(e);
            }
        };

        let environment = env_string("GATEWAY_ENV", "development");
        let bind_addr = env_string("GATEWAY_BIND_ADDR", "127.0.0.1:8080");
        let backend_url = env_string("GATEWAY_BACKEND_URL", "http://127.0.0.1:9090");

        let allowed_origins_raw = env::var("GATEWAY_ALLOWED_ORIGINS").unwrap_or_default();
        let allowed_origins: Vec<String> = allowed_origins_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let mut allow_no_origin = true;
        note(env_bool("GATEWAY_ALLOW_NO_ORIGIN", true).map(|v| allow_no_origin = v));

        let trusted_proxy_cidrs_raw = env::var("TRUSTED_PROXY_CIDRS").unwrap_or_default();
        let trusted_proxy_cidrs: Vec<String> = trusted_proxy_cidrs_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let mut session_rate_limit_points = 10u32;
        note(
            env_parsed("GATEWAY_SESSION_RATE_LIMIT_POINTS", 10u32)
                .map(|v| session_rate_limit_points = v),
        );

        let mut max_connections_per_ip = 20u32;
        note(
            env_parsed("GATEWAY_MAX_CONNECTIONS_PER_IP", 20u32)
                .map(|v| max_connections_per_ip = v),
        );

        let mut max_total_sessions = 10_000u32;
        note(env_parsed("GATEWAY_MAX_TOTAL_SESSIONS", 10_000u32).map(|v| max_total_sessions = v));

        let default_event_timeout_ms: u64 = if environment == "production" { 30_000 } else { 60_000 };
        let mut event_timeout_ms = default_event_timeout_ms;
        note(
            env_parsed("GATEWAY_EVENT_TIMEOUT_MS", default_event_timeout_ms)
                .map(|v| event_timeout_ms = v),
        );

        let mut drain_timeout_ms = 30_000u64;
        note(env_parsed("GATEWAY_DRAIN_TIMEOUT_MS", 30_000u64).map(|v| drain_timeout_ms = v));

        let mut idle_session_ttl_secs = 300u64;
        note(
            env_parsed("GATEWAY_IDLE_SESSION_TTL_SECS", 300u64)
                .map(|v| idle_session_ttl_secs = v),
        );

        let mut idempotency_ttl_secs = 300u64;
        note(
            env_parsed("GATEWAY_IDEMPOTENCY_TTL_SECS", 300u64).map(|v| idempotency_ttl_secs = v),
        );

        let mut forwarder_max_retries = 3u32;
        note(env_parsed("GATEWAY_FORWARDER_MAX_RETRIES", 3u32).map(|v| forwarder_max_retries = v));

        let metrics_auth_token = env::var("METRICS_AUTH_TOKEN").ok().filter(|v| !v.is_empty());

        let config = GatewayConfig {
            bind_addr,
            backend_url,
            environment,
            allowed_origins,
            allow_no_origin,
            trusted_proxy_cidrs,
            session_rate_limit_points,
            max_connections_per_ip,
            max_total_sessions,
            event_timeout: Duration::from_millis(event_timeout_ms),
            drain_timeout: Duration::from_millis(drain_timeout_ms),
            idle_session_ttl: Duration::from_secs(idle_session_ttl_secs),
            idempotency_ttl: Duration::from_secs(idempotency_ttl_secs),
            forwarder_max_retries,
            metrics_auth_token,
        };

        if config.is_production() && config.allowed_origins.is_empty() {
            invalid.push((
                "GATEWAY_ALLOWED_ORIGINS".to_string(),
                "(missing, required in production)".to_string(),
            ));
        }

        if !invalid.is_empty() {
            return Err(ConfigError::Invalid(
                invalid
                    .into_iter()
                    .map(|(key, value)| (key, redact(&value)))
                    .collect(),
            ));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_hides_short_secrets_entirely() {
        assert_eq!(redact("abc"), "[REDACTED]");
    }

    #[test]
    fn redact_truncates_long_secrets() {
        assert_eq!(redact("abcdefghijk"), "abcd…");
    }
}
