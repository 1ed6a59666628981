use std::time::Duration;

/// Linear-capped reconnection backoff.
///
/// The delay before retry `n` (1-based) is `base * min(n, cap)`, so with the
/// defaults the retries wait 1s, 2s, 3s, 4s, 5s, 5s, ... The policy is pure;
/// attempt counting lives with the connection that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    /// Attempt count beyond which the delay stops growing.
    pub cap: u32,
    /// Retries allowed before the connection gives up for good.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub const DEFAULT_BASE: Duration = Duration::from_millis(1000);
    pub const DEFAULT_CAP: u32 = 5;
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    pub fn new(base: Duration, cap: u32, max_attempts: u32) -> Self {
        Self { base, cap: cap.max(1), max_attempts }
    }

    /// Delay before retry number `attempt`. Attempt 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = attempt.clamp(1, self.cap);
        self.base.saturating_mul(factor)
    }

    /// Whether another retry is allowed after `attempts` retries so far.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_CAP, Self::DEFAULT_MAX_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_linearly_until_cap() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 3000, 4000, 5000, 5000, 5000]);
    }

    #[test]
    fn attempt_zero_uses_base() {
        let policy = BackoffPolicy::new(Duration::from_millis(250), 3, 10);
        assert_eq!(policy.delay(0), Duration::from_millis(250));
    }

    #[test]
    fn zero_cap_is_treated_as_one() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 0, 3);
        assert_eq!(policy.delay(4), Duration::from_millis(100));
    }

    #[test]
    fn allows_until_max_attempts() {
        let policy = BackoffPolicy::new(Duration::from_millis(1), 5, 2);
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = BackoffPolicy::new(Duration::from_secs(u64::MAX / 2), u32::MAX, u32::MAX);
        assert_eq!(policy.delay(u32::MAX), Duration::MAX);
    }
}
