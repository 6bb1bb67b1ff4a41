//! Client auto-reconnect policy.
//!
//! When a client connection observes a close, the policy decides whether a
//! fresh attempt is scheduled and how long to wait: delays grow as
//! `base_delay × backoff^attempts`, capped at `max_delay`, and the attempt
//! counter resets to zero every time a connection reaches `Open`. The
//! supervisor loop that applies this policy lives in
//! [`Connection::connect_with`](crate::Connection::connect_with).

use std::sync::Arc;
use std::time::Duration;

use crate::connection::CloseEvent;

/// Predicate deciding whether a close event warrants a reconnect.
pub type ShouldReconnect = Arc<dyn Fn(&CloseEvent) -> bool + Send + Sync>;

/// Auto-reconnect configuration.
///
/// ```rust
/// use std::time::Duration;
/// use wavesock::ReconnectOptions;
///
/// let policy = ReconnectOptions::default()
///     .with_max_attempts(5)
///     .with_base_delay(Duration::from_millis(250))
///     .with_backoff(2.0);
///
/// assert_eq!(policy.delay_for(0), Duration::from_millis(250));
/// assert_eq!(policy.delay_for(1), Duration::from_millis(500));
/// ```
#[derive(Clone)]
pub struct ReconnectOptions {
    /// Maximum consecutive failed attempts before giving up. `0` means
    /// unlimited.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per consecutive attempt.
    pub backoff: f64,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Decides whether a given close event triggers a reconnect. The
    /// default retries everything except a clean normal closure (1000).
    pub should_reconnect: ShouldReconnect,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_secs(1),
            backoff: 2.0,
            max_delay: Duration::from_secs(30),
            should_reconnect: Arc::new(|event| !(event.was_clean && event.code == 1000)),
        }
    }
}

impl ReconnectOptions {
    /// Bounds the number of consecutive attempts; `0` is unlimited.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the delay before the first retry.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the per-attempt delay multiplier.
    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    /// Caps the delay between attempts.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Installs a custom reconnect predicate.
    pub fn with_should_reconnect<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CloseEvent) -> bool + Send + Sync + 'static,
    {
        self.should_reconnect = Arc::new(predicate);
        self
    }

    /// The delay before attempt number `attempt` (zero-based):
    /// `min(base_delay × backoff^attempt, max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(attempt.min(64) as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}
