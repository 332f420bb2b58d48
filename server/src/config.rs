//! Gateway Configuration
//!
//! Loads configuration from environment variables.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::env;

/// Deployment environment, gates the production-only security checks
/// described in the server core (rate limiting, DoS heuristics, and
/// strict `Origin` validation all relax outside of production).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Security-related configuration.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Allowed `Origin` header values. `"*"` is only honored outside production.
    pub allowed_origins: HashSet<String>,
    /// Token-bucket window for per-client rate limiting, in milliseconds.
    pub rate_limit_window_ms: u64,
    /// Maximum requests allowed per client within `rate_limit_window_ms`.
    pub rate_limit_max_requests: u64,
    /// Maximum size of a single inbound frame, in bytes.
    pub max_payload_bytes: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: HashSet::new(),
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 10_000,
            max_payload_bytes: 65_536,
        }
    }
}

/// Gateway configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind host (e.g. "0.0.0.0").
    pub host: String,
    /// Server bind port.
    pub port: u16,

    /// Deployment environment.
    pub environment: Environment,

    /// Nominal heartbeat interval, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Minimum adaptive heartbeat interval, in milliseconds.
    pub min_heartbeat_interval_ms: u64,
    /// Maximum adaptive heartbeat interval, in milliseconds.
    pub max_heartbeat_interval_ms: u64,
    /// Whether the adaptive heartbeat controller is enabled; when disabled
    /// the interval stays pinned at `heartbeat_interval_ms`.
    pub adaptive_heartbeat_enabled: bool,
    /// Quality score below which `recommended_action()` returns `Disconnect`.
    pub connection_quality_threshold: f64,

    /// Number of latency samples retained per session.
    pub latency_window_size: usize,
    /// Interval between quality recomputation ticks, in milliseconds.
    pub quality_check_interval_ms: u64,

    /// Time a suspended session may remain un-resumed before expiry, in milliseconds.
    pub session_timeout_ms: u64,
    /// Ceiling on concurrently attached sessions.
    pub max_connections: usize,
    /// Frame scratch buffer size, in bytes.
    pub buffer_size: usize,

    /// Maximum number of outbound messages buffered per suspended session.
    pub max_buffered_messages: usize,
    /// Maximum total bytes buffered per suspended session.
    pub max_buffered_bytes: usize,

    /// Default pool idle timeout, in milliseconds.
    pub idle_timeout_ms: u64,

    /// Security block.
    pub security: SecurityConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port: u16 = env::var("PORT")
            .context("PORT must be set")?
            .parse()
            .context("PORT must be a valid u16")?;

        let environment = match env::var("ENVIRONMENT").ok().as_deref() {
            Some("production") => Environment::Production,
            _ => Environment::Development,
        };

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect::<HashSet<_>>()
            })
            .unwrap_or_default();

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port,
            environment,
            heartbeat_interval_ms: env_u64("HEARTBEAT_INTERVAL_MS", 30_000),
            min_heartbeat_interval_ms: env_u64("MIN_HEARTBEAT_INTERVAL_MS", 5_000),
            max_heartbeat_interval_ms: env_u64("MAX_HEARTBEAT_INTERVAL_MS", 60_000),
            adaptive_heartbeat_enabled: env::var("ADAPTIVE_HEARTBEAT_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
            connection_quality_threshold: env::var("CONNECTION_QUALITY_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.7),
            latency_window_size: env::var("LATENCY_WINDOW_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            quality_check_interval_ms: env_u64("QUALITY_CHECK_INTERVAL_MS", 10_000),
            session_timeout_ms: env_u64("SESSION_TIMEOUT_MS", 300_000),
            max_connections: env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000),
            buffer_size: env::var("BUFFER_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4_096),
            max_buffered_messages: env::var("MAX_BUFFERED_MESSAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_024),
            max_buffered_bytes: env::var("MAX_BUFFERED_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4 * 1024 * 1024),
            idle_timeout_ms: env_u64("IDLE_TIMEOUT_MS", 120_000),
            security: SecurityConfig {
                allowed_origins,
                rate_limit_window_ms: env_u64("RATE_LIMIT_WINDOW_MS", 60_000),
                rate_limit_max_requests: env_u64("RATE_LIMIT_MAX_REQUESTS", 10_000),
                max_payload_bytes: env::var("MAX_PAYLOAD_BYTES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(65_536),
            },
        })
    }

    /// Bind address in `host:port` form.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Create a default configuration for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            environment: Environment::Development,
            heartbeat_interval_ms: 30_000,
            min_heartbeat_interval_ms: 5_000,
            max_heartbeat_interval_ms: 60_000,
            adaptive_heartbeat_enabled: true,
            connection_quality_threshold: 0.7,
            latency_window_size: 10,
            quality_check_interval_ms: 10_000,
            session_timeout_ms: 300_000,
            max_connections: 1_000,
            buffer_size: 4_096,
            max_buffered_messages: 1_024,
            max_buffered_bytes: 4 * 1024 * 1024,
            idle_timeout_ms: 120_000,
            security: SecurityConfig {
                allowed_origins: HashSet::from(["*".to_string()]),
                ..SecurityConfig::default()
            },
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_for_test_is_internally_consistent() {
        let cfg = Config::default_for_test();
        assert!(cfg.min_heartbeat_interval_ms <= cfg.heartbeat_interval_ms);
        assert!(cfg.heartbeat_interval_ms <= cfg.max_heartbeat_interval_ms);
        assert!(!cfg.environment.is_production());
    }
}
