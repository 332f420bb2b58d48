//! Quality tracker (C2).
//!
//! Per-session latency window, jitter, loss, and score, plus the
//! adaptive heartbeat interval transition. Pure state transitions: no
//! I/O, no hidden state beyond the tracker's own fields, deterministic
//! given the input sequence.

use std::collections::VecDeque;

/// What the server should do about a session given its current score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendedAction {
    Maintain,
    ReduceInterval,
    Disconnect,
}

/// Bounded latency window plus the derived quality block for one session.
#[derive(Debug, Clone)]
pub struct Quality {
    window: usize,
    latency_history: VecDeque<u64>,
    missed: u32,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
    pub stability: f64,
    pub score: f64,
    pub last_updated: u64,
}

impl Quality {
    /// Initialize a fresh quality block for a new session.
    #[must_use]
    pub fn initialize(window: usize) -> Self {
        Self {
            window: window.max(1),
            latency_history: VecDeque::new(),
            missed: 0,
            latency_ms: 0.0,
            jitter_ms: 0.0,
            packet_loss: 0.0,
            stability: 1.0,
            score: 1.0,
            last_updated: 0,
        }
    }

    /// Record a latency sample (ms) and recompute derived quantities.
    pub fn record_latency(&mut self, ms: u64, now_ms: u64) {
        if self.latency_history.len() == self.window {
            self.latency_history.pop_front();
        }
        self.latency_history.push_back(ms);
        self.recompute(now_ms);
    }

    /// Record a heartbeat tick with no pong observed since the last ping.
    pub fn record_missed_heartbeat(&mut self, now_ms: u64) {
        self.missed += 1;
        self.recompute(now_ms);
    }

    /// Clear the missed-heartbeat counter (called on pong).
    pub fn reset_missed(&mut self, now_ms: u64) {
        self.missed = 0;
        self.recompute(now_ms);
    }

    #[must_use]
    pub fn latency_history_len(&self) -> usize {
        self.latency_history.len()
    }

    fn recompute(&mut self, now_ms: u64) {
        let n = self.latency_history.len();
        let avg_latency = if n == 0 {
            0.0
        } else {
            self.latency_history.iter().sum::<u64>() as f64 / n as f64
        };
        let variance = if n == 0 {
            0.0
        } else {
            self.latency_history
                .iter()
                .map(|&v| {
                    let d = v as f64 - avg_latency;
                    d * d
                })
                .sum::<f64>()
                / n as f64
        };
        let jitter = variance.sqrt();

        let denom = n + self.missed as usize;
        let packet_loss = if denom == 0 {
            0.0
        } else {
            self.missed as f64 / denom as f64
        };

        let stability = (1.0 - jitter / 100.0 - packet_loss).max(0.0);
        let lat_score = (1.0 - avg_latency / 1000.0).max(0.0);
        let jit_score = (1.0 - jitter / 500.0).max(0.0);
        let score = 0.2 * lat_score + 0.2 * jit_score + 0.3 * (1.0 - packet_loss) + 0.3 * stability;

        self.latency_ms = avg_latency;
        self.jitter_ms = jitter;
        self.packet_loss = packet_loss;
        self.stability = stability;
        self.score = score;
        self.last_updated = now_ms;
    }

    /// Compute the next adaptive heartbeat interval given the current one,
    /// clamped to `[min_hb, max_hb]`.
    #[must_use]
    pub fn next_interval(&self, current_ms: u64, min_hb: u64, max_hb: u64) -> u64 {
        let next = if self.score >= 0.9 {
            (current_ms as f64 * 1.2) as u64
        } else if self.score >= 0.7 {
            current_ms
        } else if self.score >= 0.5 {
            (current_ms as f64 * 0.8) as u64
        } else {
            min_hb
        };
        next.clamp(min_hb, max_hb)
    }

    #[must_use]
    pub fn recommended_action(&self) -> RecommendedAction {
        if self.score >= 0.7 {
            RecommendedAction::Maintain
        } else if self.score >= 0.3 {
            RecommendedAction::ReduceInterval
        } else {
            RecommendedAction::Disconnect
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_history_is_bounded_by_window() {
        let mut q = Quality::initialize(3);
        for ms in [10, 20, 30, 40, 50] {
            q.record_latency(ms, 0);
        }
        assert_eq!(q.latency_history_len(), 3);
    }

    #[test]
    fn fresh_session_has_perfect_score() {
        let q = Quality::initialize(10);
        assert_eq!(q.score, 1.0);
        assert_eq!(q.recommended_action(), RecommendedAction::Maintain);
    }

    #[test]
    fn packet_loss_zero_when_no_samples_and_no_misses() {
        let q = Quality::initialize(10);
        assert_eq!(q.packet_loss, 0.0);
    }

    #[test]
    fn score_is_monotone_in_latency_when_other_inputs_fixed() {
        let mut low = Quality::initialize(10);
        low.record_latency(50, 0);
        let mut high = Quality::initialize(10);
        high.record_latency(900, 0);
        assert!(low.score > high.score);
    }

    /// S4 — adaptive interval under sustained poor quality.
    #[test]
    fn adaptive_interval_under_poor_quality_bottoms_out_at_min() {
        let min_hb = 5_000;
        let max_hb = 60_000;
        let mut current = 30_000;
        let mut q = Quality::initialize(10);

        for ms in [800, 900, 1200, 1500, 2000] {
            q.record_latency(ms, 0);
            current = q.next_interval(current, min_hb, max_hb);
        }

        assert!(q.score < 0.5);
        assert_eq!(current, min_hb);
    }

    #[test]
    fn high_quality_relaxes_interval_up_to_max() {
        let mut q = Quality::initialize(10);
        for _ in 0..5 {
            q.record_latency(5, 0);
        }
        assert!(q.score >= 0.9);
        let next = q.next_interval(50_000, 5_000, 60_000);
        assert_eq!(next, 60_000);
    }

    #[test]
    fn missed_heartbeats_drive_recommended_action_to_disconnect() {
        let mut q = Quality::initialize(10);
        for _ in 0..10 {
            q.record_missed_heartbeat(0);
        }
        assert_eq!(q.recommended_action(), RecommendedAction::Disconnect);
    }

    #[test]
    fn reset_missed_clears_packet_loss_contribution() {
        let mut q = Quality::initialize(10);
        q.record_latency(10, 0);
        q.record_missed_heartbeat(0);
        assert!(q.packet_loss > 0.0);
        q.reset_missed(0);
        assert_eq!(q.packet_loss, 0.0);
    }
}
