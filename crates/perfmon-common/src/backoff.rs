use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff bounds, shared by client reconnects and server-side
/// sink retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    /// Retries allowed before giving up. `0` means unbounded.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            max_attempts: 0,
        }
    }
}

fn default_initial_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    30_000
}

/// Doubling delay, capped at `max`, with an optional attempt budget.
///
/// # Examples
///
/// ```
/// use perfmon_common::backoff::{Backoff, BackoffConfig};
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(&BackoffConfig { initial_ms: 100, max_ms: 250, max_attempts: 0 });
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(250)));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_ms.max(1));
        let max = Duration::from_millis(config.max_ms.max(config.initial_ms.max(1)));
        Self {
            initial,
            max,
            current: initial,
            max_attempts: config.max_attempts,
            attempts: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt,
    /// or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    /// Reset after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Failures recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}
