//! Persistent connection pool (C3).
//!
//! Decides whether each connect request reuses an existing pool entry
//! or creates a new one, enforces capacity via LRU eviction of idle
//! entries, and tracks per-client behavior to drive adaptive idle
//! timeouts. None of this affects session correctness — it is purely
//! an optimization layer over C4.
//!
//! Timestamps are passed in by the caller (`now_ms`) rather than read
//! from the wall clock internally, so the eviction and timeout logic
//! stays deterministic and testable without sleeping.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

const MIN_IDLE_TIMEOUT_MS: u64 = 30_000;
const MAX_IDLE_TIMEOUT_MS: u64 = 300_000;
const UNKNOWN_CLIENT_TIMEOUT_MS: u64 = 10_000;
const RECENCY_WINDOW_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool is at capacity with no idle entry to evict")]
    Full,
}

/// Why a pool entry was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Evicted to make room for a new acquire (LRU victim).
    ForcedClose,
    /// Idle timeout elapsed with no reuse.
    Timeout,
    /// Closed by the owning session (normal lifecycle).
    Normal,
}

/// Outcome of an [`PersistentPool::acquire`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Reused,
    Created,
}

#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub client_id: String,
    pub created_at: u64,
    pub last_activity: u64,
    pub request_count: u64,
    pub is_active: bool,
    pub is_idle: bool,
    pub idle_timeout_ms: u64,
    pub lru_timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct BehaviorProfile {
    pub client_id: String,
    pub total_connections: u64,
    pub total_requests: u64,
    pub reuse_count: u64,
    pub reuse_rate: f64,
    pub last_seen: u64,
    pub behavior_score: f64,
}

impl BehaviorProfile {
    fn new(client_id: &str, now_ms: u64) -> Self {
        Self {
            client_id: client_id.to_string(),
            total_connections: 0,
            total_requests: 0,
            reuse_count: 0,
            reuse_rate: 0.0,
            last_seen: now_ms,
            behavior_score: 0.0,
        }
    }

    fn recompute(&mut self, now_ms: u64) {
        let attempts = self.reuse_count + self.total_connections;
        self.reuse_rate = if attempts == 0 {
            0.0
        } else {
            self.reuse_count as f64 / attempts as f64
        };
        let elapsed = (now_ms.saturating_sub(self.last_seen)) as f64;
        let recency = (1.0 - elapsed / RECENCY_WINDOW_MS).clamp(0.0, 1.0);
        self.behavior_score = 0.6 * self.reuse_rate
            + 0.3 * (self.total_requests as f64 / 100.0).min(1.0)
            + 0.1 * recency;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub total_requests: u64,
    pub reused_connections: u64,
    pub forced_closes: u64,
    pub timeout_closes: u64,
    pub pool_size: usize,
    pub hit_rate: f64,
    pub pool_utilization: f64,
}

/// Informational, non-mutating recommendations derived from current stats.
#[derive(Debug, Clone)]
pub struct OptimizationAdvice {
    pub recommendations: Vec<String>,
    pub optimization_score: f64,
}

/// The pool's default idle timeout, used as the baseline for adaptive
/// timeouts before a client's behavior profile adjusts it.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub default_idle_timeout_ms: u64,
}

pub struct PersistentPool {
    config: PoolConfig,
    entries: DashMap<String, PoolEntry>,
    profiles: DashMap<String, BehaviorProfile>,
    total_requests: AtomicU64,
    reused_connections: AtomicU64,
    forced_closes: AtomicU64,
    timeout_closes: AtomicU64,
}

impl PersistentPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            profiles: DashMap::new(),
            total_requests: AtomicU64::new(0),
            reused_connections: AtomicU64::new(0),
            forced_closes: AtomicU64::new(0),
            timeout_closes: AtomicU64::new(0),
        }
    }

    /// Acquire a pool entry for `client_id`, reusing an existing entry
    /// (active or idle) when one exists, otherwise creating one, evicting
    /// the LRU idle entry under pressure if necessary.
    pub fn acquire(&self, client_id: &str, now_ms: u64) -> Result<AcquireOutcome, PoolError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Some(mut entry) = self.entries.get_mut(client_id) {
            entry.is_active = true;
            entry.is_idle = false;
            entry.last_activity = now_ms;
            entry.lru_timestamp = now_ms;
            entry.request_count += 1;
            drop(entry);
            self.record_reuse(client_id, now_ms);
            self.reused_connections.fetch_add(1, Ordering::Relaxed);
            return Ok(AcquireOutcome::Reused);
        }

        if self.entries.len() < self.config.max_connections {
            self.create_entry(client_id, now_ms);
            return Ok(AcquireOutcome::Created);
        }

        if let Some(victim) = self.lru_idle_candidate() {
            self.entries.remove(&victim);
            self.forced_closes.fetch_add(1, Ordering::Relaxed);
            self.create_entry(client_id, now_ms);
            return Ok(AcquireOutcome::Created);
        }

        Err(PoolError::Full)
    }

    fn create_entry(&self, client_id: &str, now_ms: u64) {
        let idle_timeout_ms = self.adaptive_timeout(client_id, now_ms);
        self.entries.insert(
            client_id.to_string(),
            PoolEntry {
                client_id: client_id.to_string(),
                created_at: now_ms,
                last_activity: now_ms,
                request_count: 1,
                is_active: true,
                is_idle: false,
                idle_timeout_ms,
                lru_timestamp: now_ms,
            },
        );
        self.record_new_connection(client_id, now_ms);
    }

    fn record_reuse(&self, client_id: &str, now_ms: u64) {
        let mut profile = self
            .profiles
            .entry(client_id.to_string())
            .or_insert_with(|| BehaviorProfile::new(client_id, now_ms));
        profile.reuse_count += 1;
        profile.total_requests += 1;
        profile.last_seen = now_ms;
        profile.recompute(now_ms);
    }

    fn record_new_connection(&self, client_id: &str, now_ms: u64) {
        let mut profile = self
            .profiles
            .entry(client_id.to_string())
            .or_insert_with(|| BehaviorProfile::new(client_id, now_ms));
        profile.total_connections += 1;
        profile.total_requests += 1;
        profile.last_seen = now_ms;
        profile.recompute(now_ms);
    }

    fn lru_idle_candidate(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|e| e.is_idle)
            .min_by_key(|e| e.lru_timestamp)
            .map(|e| e.client_id.clone())
    }

    /// Mark `client_id`'s entry idle, starting its idle-timeout clock.
    pub fn mark_idle(&self, client_id: &str, now_ms: u64) {
        if let Some(mut entry) = self.entries.get_mut(client_id) {
            entry.is_idle = true;
            entry.is_active = false;
            entry.lru_timestamp = now_ms;
        }
    }

    /// Close (remove) `client_id`'s entry for the given reason.
    pub fn close(&self, client_id: &str, reason: CloseReason) {
        if self.entries.remove(client_id).is_some() {
            match reason {
                CloseReason::ForcedClose => {
                    self.forced_closes.fetch_add(1, Ordering::Relaxed);
                }
                CloseReason::Timeout => {
                    self.timeout_closes.fetch_add(1, Ordering::Relaxed);
                }
                CloseReason::Normal => {}
            }
        }
    }

    /// Sweep idle entries whose idle timeout has elapsed, closing them
    /// with reason `Timeout`. Returns the closed client ids.
    pub fn expire_idle(&self, now_ms: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_idle && now_ms.saturating_sub(e.lru_timestamp) >= e.idle_timeout_ms)
            .map(|e| e.client_id.clone())
            .collect();
        for client_id in &expired {
            self.close(client_id, CloseReason::Timeout);
        }
        expired
    }

    /// Adaptive idle timeout for `client_id`, derived from its reuse rate.
    #[must_use]
    pub fn adaptive_timeout(&self, client_id: &str, now_ms: u64) -> u64 {
        let default = self.config.default_idle_timeout_ms;
        let Some(profile) = self.profiles.get(client_id) else {
            return default.min(UNKNOWN_CLIENT_TIMEOUT_MS);
        };
        let _ = now_ms;
        if profile.reuse_rate > 0.8 {
            (2 * default).min(MAX_IDLE_TIMEOUT_MS)
        } else if profile.reuse_rate > 0.5 {
            default
        } else {
            (default / 2).max(MIN_IDLE_TIMEOUT_MS)
        }
    }

    #[must_use]
    pub fn behavior_score(&self, client_id: &str) -> Option<f64> {
        self.profiles.get(client_id).map(|p| p.behavior_score)
    }

    #[must_use]
    pub fn entry(&self, client_id: &str) -> Option<PoolEntry> {
        self.entries.get(client_id).map(|e| e.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let reused_connections = self.reused_connections.load(Ordering::Relaxed);
        let hit_rate = if total_requests == 0 {
            0.0
        } else {
            reused_connections as f64 / total_requests as f64
        };
        let pool_size = self.entries.len();
        let pool_utilization = if self.config.max_connections == 0 {
            0.0
        } else {
            pool_size as f64 / self.config.max_connections as f64 * 100.0
        };
        PoolStats {
            total_requests,
            reused_connections,
            forced_closes: self.forced_closes.load(Ordering::Relaxed),
            timeout_closes: self.timeout_closes.load(Ordering::Relaxed),
            pool_size,
            hit_rate,
            pool_utilization,
        }
    }

    /// Informational recommendations derived from current statistics.
    /// Does not mutate any pool state.
    #[must_use]
    pub fn advisor(&self) -> OptimizationAdvice {
        let stats = self.stats();
        let mut recommendations = Vec::new();

        if stats.hit_rate < 0.3 {
            recommendations.push("low reuse rate: consider raising idle timeouts".to_string());
        }
        if stats.pool_utilization > 90.0 {
            recommendations
                .push("pool near capacity: consider raising max_connections".to_string());
        }
        if stats.pool_utilization < 20.0 && stats.pool_size > 0 {
            recommendations.push("pool underutilized relative to capacity".to_string());
        }

        let avg_reuse_rate = if self.profiles.is_empty() {
            0.0
        } else {
            self.profiles.iter().map(|p| p.reuse_rate).sum::<f64>() / self.profiles.len() as f64
        };
        let utilization_in_range = if (50.0..=90.0).contains(&stats.pool_utilization) {
            1.0
        } else {
            0.0
        };
        let optimization_score =
            0.4 * (2.0 * stats.hit_rate).min(1.0) + 0.3 * utilization_in_range + 0.3 * avg_reuse_rate;

        OptimizationAdvice {
            recommendations,
            optimization_score,
        }
    }
}
