use std::time::{Duration, Instant};

/// Exponential backoff for resync pages that failed or timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let calculated = self.base_delay_ms.saturating_mul(1_u64 << shift);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        Duration::from_millis(calculated.max(hinted).min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(500, 30_000)
    }
}

/// Per-chat retry bookkeeping driven by the engine tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySchedule {
    attempt: u32,
    due_at: Option<Instant>,
}

impl RetrySchedule {
    /// Record a failure and schedule the next attempt.
    pub fn schedule(
        &mut self,
        policy: &RetryPolicy,
        now: Instant,
        retry_after_hint_ms: Option<u64>,
    ) -> Duration {
        let delay = policy.delay_for_attempt(self.attempt, retry_after_hint_ms);
        self.attempt = self.attempt.saturating_add(1);
        self.due_at = Some(now + delay);
        delay
    }

    /// Consume the pending retry if it is due.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.due_at {
            Some(due_at) if due_at <= now => {
                self.due_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.due_at.is_some()
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Forget failures after a success.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Drop the pending retry but keep the attempt count.
    pub fn cancel(&mut self) {
        self.due_at = None;
    }
}
