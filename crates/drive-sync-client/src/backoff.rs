use std::time::Duration;

pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(1000);
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_millis(15_000);

/// Exponential reconnect delay: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RECONNECT_BASE,
            max: DEFAULT_RECONNECT_MAX,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_then_clamp() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u128> = (0..7).map(|attempt| policy.delay(attempt).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 15000, 15000, 15000]);
    }

    #[test]
    fn huge_attempts_saturate_at_max() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(31), policy.max);
        assert_eq!(policy.delay(32), policy.max);
        assert_eq!(policy.delay(u32::MAX), policy.max);
    }

    #[test]
    fn max_is_never_below_base() {
        let policy = ReconnectPolicy::new(Duration::from_millis(500), Duration::from_millis(100));
        assert_eq!(policy.delay(0), Duration::from_millis(500));
    }
}
