//! Retry budget, exponential backoff and priority decay.

use std::time::Duration;

/// Base delay for the first retry; doubled for every further attempt.
pub const BASE_RETRY_DELAY_MS: u64 = 1_000;

// 2^20 seconds is already ~12 days; larger exponents only risk overflow.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// What to do after the delivery carrying `retry_count` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        next_retry_count: u32,
        delay: Duration,
        priority: u8,
    },
    Exhausted,
}

/// Decide the follow-up for a failed delivery.
///
/// `max_retries` bounds the number of deliveries of one logical event: the
/// deliveries carry counts `0..max_retries`, and the failure of the last one
/// is terminal.
pub fn decide(retry_count: u32, max_retries: u32, base_priority: u8) -> RetryDecision {
    let next_retry_count = retry_count.saturating_add(1);
    if next_retry_count >= max_retries {
        return RetryDecision::Exhausted;
    }
    RetryDecision::Retry {
        next_retry_count,
        delay: backoff_delay(retry_count),
        priority: decayed_priority(base_priority, retry_count),
    }
}

/// `2^retry_count * 1000` ms.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let exponent = retry_count.min(MAX_BACKOFF_EXPONENT);
    Duration::from_millis(BASE_RETRY_DELAY_MS << exponent)
}

/// `max(1, base - retry_count)`.
pub fn decayed_priority(base_priority: u8, retry_count: u32) -> u8 {
    let decayed = i64::from(base_priority) - i64::from(retry_count);
    decayed.clamp(1, 10) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_decay() {
        assert_eq!(decayed_priority(9, 2), 7);
        assert_eq!(decayed_priority(2, 5), 1);
        assert_eq!(decayed_priority(5, 0), 5);
        assert_eq!(decayed_priority(1, u32::MAX), 1);
    }

    #[test]
    fn test_backoff() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(3), Duration::from_millis(8_000));
        assert_eq!(backoff_delay(500), backoff_delay(MAX_BACKOFF_EXPONENT));
    }

    #[test]
    fn test_budget_of_three_allows_two_retries() {
        assert_eq!(
            decide(0, 3, 8),
            RetryDecision::Retry {
                next_retry_count: 1,
                delay: Duration::from_millis(1_000),
                priority: 8
            }
        );
        assert_eq!(
            decide(1, 3, 8),
            RetryDecision::Retry {
                next_retry_count: 2,
                delay: Duration::from_millis(2_000),
                priority: 7
            }
        );
        assert_eq!(decide(2, 3, 8), RetryDecision::Exhausted);
        assert_eq!(decide(7, 3, 8), RetryDecision::Exhausted);
    }

    #[test]
    fn test_zero_or_one_budget_never_retries() {
        assert_eq!(decide(0, 0, 5), RetryDecision::Exhausted);
        assert_eq!(decide(0, 1, 5), RetryDecision::Exhausted);
    }
}
