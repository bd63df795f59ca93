use crate::config::MonitorConfig;
use tracing::warn;

/// Delay before a repair attempt for the given consecutive-failure count.
///
/// The first failure is repaired immediately (0). After that the delay is
/// `base * 2^(counter-1)`, clamped to `cap`.
pub fn backoff_delay(base_secs: u64, counter: u32, cap_secs: u64) -> u64 {
    if counter <= 1 {
        return 0;
    }
    let shift = 1u64.checked_shl(counter - 1).unwrap_or(u64::MAX);
    base_secs.saturating_mul(shift).min(cap_secs)
}

/// What the loop does after a failed repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Sleep the normal check interval.
    Retry,
    /// Retries exhausted: sleep the long cooldown instead.
    Cooldown,
}

/// Consecutive unhealthy iterations. Owned by the monitor loop.
#[derive(Debug, Clone)]
pub struct FailureCounter {
    base_secs: u64,
    cap_secs: u64,
    max_retries: u32,
    count: u32,
}

impl FailureCounter {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            base_secs: config.base_delay_secs,
            cap_secs: config.cap_secs,
            max_retries: config.max_retries,
            count: 0,
        }
    }

    /// Count one more unhealthy iteration. Returns the backoff (secs) to wait
    /// before repairing.
    pub fn record_failure(&mut self) -> u64 {
        self.count = self.count.saturating_add(1);
        backoff_delay(self.base_secs, self.count, self.cap_secs)
    }

    /// Decide how to wait after a failed repair.
    pub fn after_failed_repair(&self) -> FailureDecision {
        if self.count >= self.max_retries {
            warn!(
                consecutive_failures = self.count,
                max_retries = self.max_retries,
                "recovery retries exhausted, entering cooldown"
            );
            FailureDecision::Cooldown
        } else {
            FailureDecision::Retry
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
