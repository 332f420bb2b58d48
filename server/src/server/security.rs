//! Upgrade admission and per-IP security limits (C5's security surface).
//!
//! Rate-limit and DoS-heuristic counters are keyed by client IP
//! (extracted via the same pattern as the rest of the corpus' upgrade
//! path) rather than session id, since pre-Connect frames have no
//! session id yet to key on.

use crate::config::{Config, Environment};
use axum::http::HeaderMap;
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use thiserror::Error;

const SUSPICIOUS_UA_PATTERNS: &[&str] = &["bot", "crawler", "spider", "scraper", "curl", "wget"];
const DOS_REQUEST_THRESHOLD: u64 = 500;
const DOS_LARGE_MESSAGE_BYTES: usize = 32 * 1024;
const DOS_LARGE_MESSAGE_REQUEST_FLOOR: u64 = 10;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SecurityRejection {
    #[error("malformed upgrade request")]
    BadUpgrade,
    #[error("origin not allowed")]
    BadOrigin,
    #[error("suspicious user agent")]
    SuspiciousUserAgent,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("flagged by DoS heuristic")]
    DosFlagged,
}

/// Extract the caller's IP, trusting `X-Forwarded-For`/`X-Real-IP` only
/// when the deployment is configured to sit behind a trusted proxy.
#[must_use]
pub fn extract_client_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                if let Ok(ip) = first.trim().parse() {
                    return ip;
                }
            }
        }
        if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            if let Ok(ip) = real_ip.trim().parse() {
                return ip;
            }
        }
    }
    peer.ip()
}

struct Window {
    start_ms: u64,
    requests: u64,
    large_messages: u64,
}

impl Window {
    fn fresh(now_ms: u64) -> Self {
        Self {
            start_ms: now_ms,
            requests: 0,
            large_messages: 0,
        }
    }
}

pub struct SecurityState {
    allowed_origins: std::collections::HashSet<String>,
    is_production: bool,
    rate_limit_window_ms: u64,
    rate_limit_max_requests: u64,
    max_payload_bytes: usize,
    windows: DashMap<String, Mutex<Window>>,
}

impl SecurityState {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            allowed_origins: config.security.allowed_origins.clone(),
            is_production: config.environment.is_production(),
            rate_limit_window_ms: config.security.rate_limit_window_ms,
            rate_limit_max_requests: config.security.rate_limit_max_requests,
            max_payload_bytes: config.security.max_payload_bytes,
            windows: DashMap::new(),
        }
    }

    /// Validate upgrade admission headers per §4.5: `User-Agent` present
    /// and not matching a suspicious pattern, and `Origin` in the
    /// allowed set (wildcard permitted outside production).
    pub fn admit_upgrade(&self, headers: &HeaderMap) -> Result<(), SecurityRejection> {
        let sec_key_len = headers
            .get("sec-websocket-key")
            .and_then(|v| v.to_str().ok())
            .map(str::len)
            .unwrap_or(0);
        if sec_key_len != 24 {
            return Err(SecurityRejection::BadUpgrade);
        }

        let user_agent = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if user_agent.len() < 10 {
            return Err(SecurityRejection::BadUpgrade);
        }
        let ua_lower = user_agent.to_lowercase();
        if SUSPICIOUS_UA_PATTERNS.iter().any(|p| ua_lower.contains(p)) {
            return Err(SecurityRejection::SuspiciousUserAgent);
        }

        let origin = headers.get("origin").and_then(|v| v.to_str().ok());
        let origin_ok = match origin {
            Some(o) => {
                self.allowed_origins.contains(o)
                    || (!self.is_production && self.allowed_origins.contains("*"))
            }
            None => !self.is_production,
        };
        if !origin_ok {
            return Err(SecurityRejection::BadOrigin);
        }

        Ok(())
    }

    /// Per-frame size bound, applied to every inbound frame regardless
    /// of deployment mode.
    #[must_use]
    pub fn payload_within_bounds(&self, len: usize) -> bool {
        len <= self.max_payload_bytes
    }

    /// Rate-limit and DoS-heuristic check for an inbound `Data` frame.
    /// Only applied in production, per §4.5.
    pub fn check_data_frame(&self, ip: &str, payload_len: usize, now_ms: u64) -> Result<(), SecurityRejection> {
        if !self.is_production {
            return Ok(());
        }

        let entry = self
            .windows
            .entry(ip.to_string())
            .or_insert_with(|| Mutex::new(Window::fresh(now_ms)));
        let mut window = entry.lock().unwrap();

        if now_ms.saturating_sub(window.start_ms) >= self.rate_limit_window_ms {
            *window = Window::fresh(now_ms);
        }

        window.requests += 1;
        if payload_len > DOS_LARGE_MESSAGE_BYTES {
            window.large_messages += 1;
        }

        if window.requests > self.rate_limit_max_requests {
            return Err(SecurityRejection::RateLimited);
        }
        if window.requests > DOS_REQUEST_THRESHOLD {
            return Err(SecurityRejection::DosFlagged);
        }
        if window.large_messages > 0 && window.requests > DOS_LARGE_MESSAGE_REQUEST_FLOOR {
            return Err(SecurityRejection::DosFlagged);
        }

        Ok(())
    }
}

#[must_use]
pub fn fallback_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn headers_with(ua: &str, origin: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("sec-websocket-key", "x".repeat(24).parse().unwrap());
        h.insert("user-agent", ua.parse().unwrap());
        if let Some(o) = origin {
            h.insert("origin", o.parse().unwrap());
        }
        h
    }

    fn dev_config() -> Config {
        Config::default_for_test()
    }

    #[test]
    fn short_user_agent_rejected() {
        let state = SecurityState::from_config(&dev_config());
        let headers = headers_with("short", Some("http://localhost"));
        assert_eq!(state.admit_upgrade(&headers), Err(SecurityRejection::BadUpgrade));
    }

    #[test]
    fn suspicious_user_agent_rejected() {
        let state = SecurityState::from_config(&dev_config());
        let headers = headers_with("Mozilla curl/7.0 client", Some("http://localhost"));
        assert_eq!(
            state.admit_upgrade(&headers),
            Err(SecurityRejection::SuspiciousUserAgent)
        );
    }

    #[test]
    fn wildcard_origin_allowed_outside_production() {
        let state = SecurityState::from_config(&dev_config());
        let headers = headers_with("Mozilla/5.0 Harness Runner", Some("http://anything"));
        assert_eq!(state.admit_upgrade(&headers), Ok(()));
    }

    #[test]
    fn production_rejects_unlisted_origin() {
        let mut config = dev_config();
        config.environment = Environment::Production;
        config.security.allowed_origins = std::collections::HashSet::from(["https://app.example.com".to_string()]);
        let state = SecurityState::from_config(&config);
        let headers = headers_with("Mozilla/5.0 Real Browser", Some("https://evil.example.com"));
        assert_eq!(state.admit_upgrade(&headers), Err(SecurityRejection::BadOrigin));
    }

    #[test]
    fn data_frame_checks_are_skipped_outside_production() {
        let state = SecurityState::from_config(&dev_config());
        for _ in 0..1000 {
            assert_eq!(state.check_data_frame("1.2.3.4", 100, 0), Ok(()));
        }
    }

    #[test]
    fn dos_heuristic_flags_high_request_volume_in_production() {
        let mut config = dev_config();
        config.environment = Environment::Production;
        let state = SecurityState::from_config(&config);
        let mut last = Ok(());
        for _ in 0..600 {
            last = state.check_data_frame("1.2.3.4", 10, 0);
        }
        assert_eq!(last, Err(SecurityRejection::DosFlagged));
    }

    #[test]
    fn extract_ip_prefers_connect_info_without_trust_proxy() {
        let headers = HeaderMap::new();
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 9000);
        assert_eq!(extract_client_ip(&headers, peer, false), peer.ip());
    }
}
