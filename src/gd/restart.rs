//! Restart backoff and crash-loop cooldown.
//!
//! Everything here is a pure function of the restart history and the configured limits; the
//! supervisor owns the clock and the timers.

use crate::gd::config::GuardianConfig;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub window_ms: u64,
    pub max_restarts: usize,
    pub cooldown_ms: u64,
}

impl RestartPolicy {
    pub fn from_config(cfg: &GuardianConfig) -> Self {
        Self {
            base_delay_ms: cfg.restart_base_delay_ms,
            max_delay_ms: cfg.restart_max_delay_ms,
            window_ms: cfg.restart_window_ms,
            max_restarts: cfg.restart_max_count,
            cooldown_ms: cfg.restart_cooldown_ms,
        }
    }
}

/// Restart timestamps (epoch ms), oldest first, kept to the rolling window.
#[derive(Debug, Clone, Default)]
pub struct RestartHistory {
    stamps: VecDeque<i64>,
}

impl RestartHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every stamp older than `window_ms` relative to `now_ms`.
    pub fn prune(&mut self, now_ms: i64, window_ms: u64) {
        while let Some(front) = self.stamps.front() {
            if now_ms.saturating_sub(*front) > window_ms as i64 {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record(&mut self, now_ms: i64) {
        self.stamps.push_back(now_ms);
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Count of restarts inside the window, without mutating.
    pub fn recent(&self, now_ms: i64, window_ms: u64) -> usize {
        self.stamps
            .iter()
            .filter(|t| now_ms.saturating_sub(**t) <= window_ms as i64)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartDecision {
    pub attempt: u32,
    pub delay_ms: u64,
    /// Set when the window limit was exceeded.
    pub cooldown_until_ms: Option<i64>,
}

/// `min(max_delay, base_delay * 2^(attempt-1))`, with `attempt` 1-indexed.
pub fn backoff_delay_ms(policy: &RestartPolicy, attempt: u32) -> u64 {
    let exp = attempt.max(1) - 1;
    let factor = 1u64.checked_shl(exp.min(63)).unwrap_or(u64::MAX);
    policy
        .base_delay_ms
        .saturating_mul(factor)
        .min(policy.max_delay_ms)
}

/// Decide the next automatic restart.
///
/// `recent_restarts` is the number of restarts inside the window including the one being
/// scheduled; it doubles as the attempt number.
pub fn next_restart(policy: &RestartPolicy, recent_restarts: usize, now_ms: i64) -> RestartDecision {
    let attempt = recent_restarts.clamp(1, u32::MAX as usize) as u32;
    let mut delay_ms = backoff_delay_ms(policy, attempt);
    let mut cooldown_until_ms = None;
    if recent_restarts > policy.max_restarts {
        cooldown_until_ms = Some(now_ms.saturating_add(policy.cooldown_ms as i64));
        delay_ms = delay_ms.max(policy.cooldown_ms);
    }
    RestartDecision {
        attempt,
        delay_ms,
        cooldown_until_ms,
    }
}

/// Milliseconds left before `cooldown_until_ms`, zero when none or expired.
pub fn cooldown_remaining_ms(cooldown_until_ms: Option<i64>, now_ms: i64) -> u64 {
    match cooldown_until_ms {
        Some(until) if until > now_ms => (until - now_ms) as u64,
        _ => 0,
    }
}
