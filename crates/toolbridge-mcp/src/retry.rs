//! Retry policy for tool calls.

use std::time::Duration;

use toolbridge_core::RetryConfig;

/// Bounded fixed-delay retry schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Delay before each retry; the last one repeats if the list is short.
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delays: config.delays_ms.iter().copied().map(Duration::from_millis).collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delays: Vec::new(),
        }
    }

    /// Same retry count with every delay replaced; handy in tests.
    pub fn with_delays(mut self, delays: Vec<Duration>) -> Self {
        self.delays = delays;
        self
    }

    /// Delay before retry number `retry` (1-based), or `None` once exhausted.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let index = (retry as usize - 1).min(self.delays.len().saturating_sub(1));
        Some(self.delays.get(index).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(600)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(1500)));
        assert_eq!(policy.delay_for(3), None);
        assert_eq!(policy.delay_for(0), None);
    }

    #[test]
    fn test_short_delay_list_repeats_last() {
        let policy = RetryPolicy {
            max_retries: 4,
            delays: vec![Duration::from_millis(5)],
        };
        assert_eq!(policy.delay_for(4), Some(Duration::from_millis(5)));

        let policy = RetryPolicy { max_retries: 1, delays: Vec::new() };
        assert_eq!(policy.delay_for(1), Some(Duration::ZERO));
    }

    #[test]
    fn test_none() {
        assert_eq!(RetryPolicy::none().delay_for(1), None);
    }
}
