use std::time::Duration;

/// Growth factor applied to the retry interval after every failed attempt.
pub const BACKOFF_FACTOR: u32 = 2;

/// Exponential backoff with a ceiling and an optional attempt limit.
///
/// `next_delay` is consulted after each failed attempt. It returns the time
/// to wait before retrying and advances the schedule, or `None` once the
/// attempt limit is reached.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    ceiling: Duration,
    current: Duration,
    attempts: u32,
    max_attempts: Option<u32>,
}

impl Backoff {
    /// `max_attempts` of `None` retries forever.
    pub fn new(initial: Duration, ceiling: Duration, max_attempts: Option<u32>) -> Self {
        let initial = initial.min(ceiling);
        Self {
            initial,
            ceiling,
            current: initial,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempts >= max) {
            return None;
        }
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(BACKOFF_FACTOR)
            .unwrap_or(self.ceiling)
            .min(self.ceiling);
        self.attempts += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Retries performed since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
