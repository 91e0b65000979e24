use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Limits on how fast a participant may skip partners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipLimit {
    pub max_attempts: usize,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for SkipLimit {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window: Duration::from_secs(5),
            cooldown: Duration::from_secs(5),
        }
    }
}

/// Sliding-window skip limiter. Going over the limit starts a cooldown during
/// which every attempt is refused.
#[derive(Debug)]
pub struct SkipGuard {
    limit: SkipLimit,
    attempts: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl SkipGuard {
    pub fn new(limit: SkipLimit) -> Self {
        Self {
            limit,
            attempts: VecDeque::new(),
            cooldown_until: None,
        }
    }

    /// Records an attempt at `now`. On refusal returns the cooldown remaining.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Err(until - now);
            }
            self.cooldown_until = None;
        }

        while let Some(oldest) = self.attempts.front() {
            if now.duration_since(*oldest) >= self.limit.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        self.attempts.push_back(now);

        if self.attempts.len() > self.limit.max_attempts {
            self.attempts.clear();
            self.cooldown_until = Some(now + self.limit.cooldown);
            return Err(self.limit.cooldown);
        }
        Ok(())
    }

    pub fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}
