use std::time::Duration;

/// What the runner does after an attempt failed with a restart error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Start a new attempt after pausing for `delay`. A zero delay still
    /// yields to the scheduler once.
    Retry { delay: Duration },
    /// Stop and report the restart error to the caller.
    GiveUp,
}

/// Decides whether another attempt is made after a retryable failure.
///
/// Only restart errors ever reach the policy; fatal errors end the
/// invocation regardless of it.
pub trait RetryPolicy: Send + Sync {
    /// `attempt` is the 1-based number of the attempt that just failed.
    fn next(&self, attempt: u32) -> RetryDecision;
}

impl<P: RetryPolicy + ?Sized> RetryPolicy for Box<P> {
    fn next(&self, attempt: u32) -> RetryDecision {
        (**self).next(attempt)
    }
}

impl<P: RetryPolicy + ?Sized> RetryPolicy for &P {
    fn next(&self, attempt: u32) -> RetryDecision {
        (**self).next(attempt)
    }
}

/// Retry forever without delay, relying on contention to resolve.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl RetryPolicy for Unbounded {
    fn next(&self, _attempt: u32) -> RetryDecision {
        RetryDecision::Retry {
            delay: Duration::ZERO,
        }
    }
}

/// Retry without delay until `max_attempts` attempts have been made.
#[derive(Debug, Clone, Copy)]
pub struct Bounded {
    max_attempts: u32,
}

impl Bounded {
    /// `max_attempts` counts the first attempt; values below 1 are treated as 1.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl RetryPolicy for Bounded {
    fn next(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                delay: Duration::ZERO,
            }
        }
    }
}

/// Doubling backoff between attempts, capped at `max_delay`, with an
/// optional attempt ceiling.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_attempts: None,
        }
    }

    /// Give up once `max_attempts` attempts have failed.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Delay before the attempt following failed attempt number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let mut delay = self.base_delay;
        for _ in 1..attempt {
            delay = delay.saturating_mul(2).min(self.max_delay);
            if delay == self.max_delay {
                break;
            }
        }
        delay
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_millis(100))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next(&self, attempt: u32) -> RetryDecision {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_never_gives_up() {
        for attempt in [1, 10, 10_000, u32::MAX] {
            assert_eq!(
                Unbounded.next(attempt),
                RetryDecision::Retry {
                    delay: Duration::ZERO
                }
            );
        }
    }

    #[test]
    fn test_bounded_counts_first_attempt() {
        let policy = Bounded::new(3);
        assert!(matches!(policy.next(1), RetryDecision::Retry { .. }));
        assert!(matches!(policy.next(2), RetryDecision::Retry { .. }));
        assert_eq!(policy.next(3), RetryDecision::GiveUp);

        assert_eq!(Bounded::new(0).max_attempts(), 1);
        assert_eq!(Bounded::new(0).next(1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(30));
        assert_eq!(policy.delay_for(1), Duration::from_millis(5));
        assert_eq!(policy.delay_for(2), Duration::from_millis(10));
        assert_eq!(policy.delay_for(3), Duration::from_millis(20));
        assert_eq!(policy.delay_for(4), Duration::from_millis(30));
        assert_eq!(policy.delay_for(50), Duration::from_millis(30));
    }

    #[test]
    fn test_zero_base_backoff_stays_zero() {
        let policy = ExponentialBackoff::new(Duration::ZERO, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(u32::MAX), Duration::ZERO);
    }

    #[test]
    fn test_backoff_with_ceiling() {
        let policy = ExponentialBackoff::default().max_attempts(2);
        assert_eq!(
            policy.next(1),
            RetryDecision::Retry {
                delay: Duration::from_millis(5)
            }
        );
        assert_eq!(policy.next(2), RetryDecision::GiveUp);
    }

    #[test]
    fn test_boxed_policy_delegates() {
        let policy: Box<dyn RetryPolicy> = Box::new(Bounded::new(1));
        assert_eq!(policy.next(1), RetryDecision::GiveUp);
    }
}
