//! Admission & Rate-Limit Layer (spec §4.3, C7): trusted-proxy IP
//! extraction, per-IP/global connection caps, and a per-session token
//! bucket. `ping` bypasses the bucket so liveness always succeeds.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::GatewayError;
use protocol::ErrorCode;

/// Normalizes an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) to its IPv4
/// form; every other address is returned unchanged.
pub fn normalize_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        other => other,
    }
}

/// A minimal CIDR matcher: supports explicit `a.b.c.d/n` / IPv6 CIDRs and
/// the shorthand tags `loopback`, `private`, `docker` (spec §4.3). No CIDR
/// crate is carried anywhere in the reference pack for this shape of
/// problem, so the bit arithmetic is hand-rolled here rather than pulling
/// in a dependency with no precedent in the corpus.
pub fn ip_in_trusted_set(addr: IpAddr, cidrs: &[String]) -> bool {
    for entry in cidrs {
        match entry.as_str() {
            "loopback" => {
                if addr.is_loopback() {
                    return true;
                }
                continue;
            }
            "private" => {
                if is_private(addr) {
                    return true;
                }
                continue;
            }
            "docker" => {
                if matches_cidr(addr, "172.17.0.0/16") {
                    return true;
                }
                continue;
            }
            cidr => {
                if matches_cidr(addr, cidr) {
                    return true;
                }
            }
        }
    }
    false
}

fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(_) => addr.is_loopback(),
    }
}

fn matches_cidr(addr: IpAddr, cidr: &str) -> bool {
    let Some((base, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(prefix_len) = prefix.parse::<u32>() else {
        return false;
    };
    match (addr, base.parse::<Ipv4Addr>()) {
        (IpAddr::V4(addr), Ok(base)) if prefix_len <= 32 => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - prefix_len)
            };
            u32::from(addr) & mask == u32::from(base) & mask
        }
        _ => false,
    }
}

/// Extracts the normalized client IP, honoring `X-Forwarded-For` (falling
/// back to `X-Real-IP`) only when the direct peer is in the trusted set.
pub fn extract_client_ip(
    peer_addr: IpAddr,
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    trusted_cidrs: &[String],
) -> IpAddr {
    let peer = normalize_ip(peer_addr);
    if !ip_in_trusted_set(peer, trusted_cidrs) {
        return peer;
    }
    if let Some(header) = forwarded_for {
        if let Some(first) = header.split(',').next() {
            if let Ok(parsed) = first.trim().parse::<IpAddr>() {
                return normalize_ip(parsed);
            }
        }
    }
    if let Some(header) = real_ip {
        if let Ok(parsed) = header.trim().parse::<IpAddr>() {
            return normalize_ip(parsed);
        }
    }
    peer
}

/// Connection cap tracker: per-IP and global.
#[derive(Default)]
pub struct ConnectionLimiter {
    per_ip: Mutex<HashMap<IpAddr, u32>>,
    total: AtomicU32,
    max_per_ip: u32,
    max_total: u32,
}

impl ConnectionLimiter {
    pub fn new(max_per_ip: u32, max_total: u32) -> Self {
        ConnectionLimiter {
            per_ip: Mutex::new(HashMap::new()),
            total: AtomicU32::new(0),
            max_per_ip,
            max_total,
        }
    }

    pub async fn try_register(&self, ip: IpAddr) -> Result<(), GatewayError> {
        if self.total.load(Ordering::SeqCst) >= self.max_total {
            return Err(GatewayError::validation(
                ErrorCode::SessionCapReached,
                "global session cap reached",
            ));
        }
        let mut per_ip = self.per_ip.lock().await;
        let count = per_ip.entry(ip).or_insert(0);
        if *count >= self.max_per_ip {
            return Err(GatewayError::validation(
                ErrorCode::IpLimitExceeded,
                "per-IP connection limit exceeded",
            ));
        }
        *count += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub async fn unregister(&self, ip: IpAddr) {
        let mut per_ip = self.per_ip.lock().await;
        if let Some(count) = per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(&ip);
            }
            self.total.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Fixed-window per-session message bucket (spec §4.3).
pub struct RateBucketState {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

pub struct SessionRateLimiter {
    buckets: Mutex<HashMap<String, RateBucketState>>,
    max_messages: u32,
    window: Duration,
    block: Duration,
}

impl SessionRateLimiter {
    pub fn new(max_messages: u32, window: Duration, block: Duration) -> Self {
        SessionRateLimiter {
            buckets: Mutex::new(HashMap::new()),
            max_messages,
            window,
            block,
        }
    }

    /// `true` is always returned for `ping` by the caller skipping this
    /// check entirely; this method only ever gates non-liveness messages.
    pub async fn check(&self, session_id: &str) -> Result<(), GatewayError> {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(session_id.to_string()).or_insert_with(|| RateBucketState {
            count: 0,
            window_start: now,
            blocked_until: None,
        });

        if let Some(blocked_until) = bucket.blocked_until {
            if now < blocked_until {
                let retry_after = blocked_until.duration_since(now).as_secs().max(1);
                return Err(GatewayError::rate_limited(retry_after));
            }
            bucket.blocked_until = None;
            bucket.count = 0;
            bucket.window_start = now;
        }

        if now.duration_since(bucket.window_start) > self.window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        bucket.count += 1;
        if bucket.count > self.max_messages {
            bucket.blocked_until = Some(now + self.block);
            return Err(GatewayError::rate_limited(self.block.as_secs().max(1)));
        }
        Ok(())
    }

    pub async fn remove(&self, session_id: &str) {
        self.buckets.lock().await.remove(session_id);
    }
}

/// Byte-exact origin check per spec §4.3.
pub fn origin_allowed(origin: Option<&str>, allowed: &[String], allow_no_origin: bool) -> bool {
    match origin {
        None => allow_no_origin,
        Some(o) if o == "null" => allow_no_origin,
        Some(o) => allowed.iter().any(|a| a == o),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_mapped_ipv6_normalizes_to_ipv4() {
        let mapped: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
        assert_eq!(normalize_ip(mapped), "192.0.2.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn loopback_shorthand_matches_127_addresses() {
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(ip_in_trusted_set(addr, &["loopback".to_string()]));
    }

    #[test]
    fn explicit_cidr_matches_within_range_only() {
        let cidrs = vec!["10.0.0.0/8".to_string()];
        assert!(ip_in_trusted_set("10.1.2.3".parse().unwrap(), &cidrs));
        assert!(!ip_in_trusted_set("11.1.2.3".parse().unwrap(), &cidrs));
    }

    #[test]
    fn forwarded_for_is_only_honored_from_a_trusted_peer() {
        let trusted = vec!["10.0.0.0/8".to_string()];
        let untrusted_peer: IpAddr = "203.0.113.5".parse().unwrap();
        let resolved = extract_client_ip(untrusted_peer, Some("198.51.100.9"), None, &trusted);
        assert_eq!(resolved, untrusted_peer);

        let trusted_peer: IpAddr = "10.0.0.5".parse().unwrap();
        let resolved = extract_client_ip(trusted_peer, Some("198.51.100.9, 10.0.0.5"), None, &trusted);
        assert_eq!(resolved, "198.51.100.9".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn connection_cap_refuses_once_per_ip_limit_hit() {
        let limiter = ConnectionLimiter::new(1, 100);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        limiter.try_register(ip).await.unwrap();
        let err = limiter.try_register(ip).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::IpLimitExceeded);
    }

    #[tokio::test]
    async fn rate_bucket_allows_exactly_the_limit_then_blocks() {
        let limiter = SessionRateLimiter::new(2, Duration::from_secs(60), Duration::from_secs(30));
        limiter.check("s1").await.unwrap();
        limiter.check("s1").await.unwrap();
        let err = limiter.check("s1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimited);
        assert_eq!(err.retry_after(), Some(30));
    }

    #[test]
    fn origin_must_match_byte_exactly() {
        let allowed = vec!["https://game.example".to_string()];
        assert!(origin_allowed(Some("https://game.example"), &allowed, false));
        assert!(!origin_allowed(Some("https://game.example/"), &allowed, false));
        assert!(!origin_allowed(Some("null"), &allowed, false));
        assert!(origin_allowed(Some("null"), &allowed, true));
    }
}
