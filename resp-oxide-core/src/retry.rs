//! Retry policies for reconnects and cluster redirects
//!
//! A policy maps an attempt number (starting at 1) to the delay before that
//! attempt, or `None` to stop. Connections and the cluster router each hold
//! their own policy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether and when to retry
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Delay before attempt `attempt`, or `None` to give up
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Exponential backoff with an optional attempt cap
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Maximum number of attempts (None = infinite)
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ExponentialBackoff {
    /// Backoff starting at `initial_delay`, capped at `max_delay`
    #[must_use]
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Stop after `attempts` attempts
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the growth factor
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Some(Duration::from_millis(millis as u64))
    }
}

/// Never retry
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Constant delay with an attempt cap
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    /// Delay before each attempt
    pub delay: Duration,
    /// Maximum number of attempts
    pub max_attempts: u32,
}

impl RetryPolicy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt <= self.max_attempts).then_some(self.delay)
    }
}

/// Adapts a closure into a policy
pub struct FnRetry<F>(pub F);

impl<F> fmt::Debug for FnRetry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnRetry")
    }
}

impl<F> RetryPolicy for FnRetry<F>
where
    F: Fn(u32) -> Option<Duration> + Send + Sync,
{
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (self.0)(attempt)
    }
}

/// Cloneable handle to a policy, so configuration stays `Clone`
#[derive(Debug, Clone)]
pub struct SharedRetryPolicy(Arc<dyn RetryPolicy>);

impl SharedRetryPolicy {
    /// Wrap a policy
    pub fn new(policy: impl RetryPolicy + 'static) -> Self {
        Self(Arc::new(policy))
    }

    /// Build a policy from a closure
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(u32) -> Option<Duration> + Send + Sync + 'static,
    {
        Self::new(FnRetry(f))
    }
}

impl RetryPolicy for SharedRetryPolicy {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.0.next_delay(attempt)
    }
}

impl Default for SharedRetryPolicy {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_growth_and_cap() {
        let policy = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(500))
            .with_max_attempts(5);
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(5), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(6), None);
    }

    #[test]
    fn test_no_retry_and_fixed() {
        assert_eq!(NoRetry.next_delay(1), None);
        let fixed = FixedDelay {
            delay: Duration::from_millis(10),
            max_attempts: 2,
        };
        assert_eq!(fixed.next_delay(2), Some(Duration::from_millis(10)));
        assert_eq!(fixed.next_delay(3), None);
    }

    #[test]
    fn test_closure_policy() {
        let policy = SharedRetryPolicy::from_fn(|attempt| {
            (attempt < 3).then(|| Duration::from_millis(u64::from(attempt)))
        });
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(2)));
        assert_eq!(policy.next_delay(3), None);
        let cloned = policy.clone();
        assert_eq!(cloned.next_delay(1), Some(Duration::from_millis(1)));
    }
}
