use std::time::Duration;

const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential reconnect schedule with an attempt cap.
///
/// Attempts are 1-based: the first retry after a drop is attempt 1 and waits
/// exactly the base delay; each later attempt doubles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay_ms: u64,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_attempts,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.max(1).saturating_sub(1).min(32);
        let multiplier = 1_u64 << shift;
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS)
    }
}

/// What to do after the transport dropped or a connect attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Arm a timer and try again.
    Retry { attempt: u32, delay: Duration },
    /// Stop retrying; surface the terminal condition.
    Exhausted { attempts: u32 },
}

/// Attempt counter driven by connection transitions.
#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl ReconnectTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Attempts made since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn on_connected(&mut self) {
        self.attempt = 0;
    }

    /// Manual `Open` starts a fresh schedule.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn on_disconnected(&mut self) -> ReconnectDecision {
        let next = self.attempt.saturating_add(1);
        if !self.policy.should_retry(next) {
            return ReconnectDecision::Exhausted {
                attempts: self.attempt,
            };
        }
        self.attempt = next;
        ReconnectDecision::Retry {
            attempt: next,
            delay: self.policy.next_delay(next),
        }
    }
}
