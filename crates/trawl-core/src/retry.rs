use std::time::Duration;

/// What to do with a job whose response was rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Sleep with exponential backoff, then retry the job.
    #[default]
    RetryJob,
    /// Drop the job on the first rejection without retrying.
    DiscardJob,
    /// Like [`RetryPolicy::RetryJob`], but ask the fetcher to advance to the
    /// next proxy before the next attempt.
    RefreshIp,
    /// Cancel the whole engine when this job's response is rejected.
    StopScraping,
}

/// Hard upper bound on retries, regardless of what the job asks for.
pub const RETRY_ATTEMPT_CAP: u32 = 5;

/// First inter-attempt delay; doubles on every retry.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Default cap on the inter-attempt delay.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Effective retry allowance for a job: the requested count capped at
/// [`RETRY_ATTEMPT_CAP`].
pub fn effective_max_retries(requested: u32) -> u32 {
    requested.min(RETRY_ATTEMPT_CAP)
}

/// Delay to sleep before retry number `attempt` (1-indexed):
/// `min(100ms * 2^(attempt-1), cap)`.
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let doublings = attempt.saturating_sub(1).min(20);
    let delay = INITIAL_RETRY_DELAY.saturating_mul(1u32 << doublings);

    delay.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_retries_is_capped_at_five() {
        assert_eq!(effective_max_retries(0), 0);
        assert_eq!(effective_max_retries(3), 3);
        assert_eq!(effective_max_retries(5), 5);
        assert_eq!(effective_max_retries(10), 5);
        assert_eq!(effective_max_retries(u32::MAX), 5);
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let cap = Duration::from_millis(600);

        assert_eq!(backoff_delay(1, cap), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, cap), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, cap), Duration::from_millis(400));
        assert_eq!(backoff_delay(4, cap), Duration::from_millis(600));
        assert_eq!(backoff_delay(5, cap), Duration::from_millis(600));
    }

    #[test]
    fn consecutive_delays_are_monotone() {
        let cap = DEFAULT_MAX_RETRY_DELAY;

        for attempt in 1..10 {
            let current = backoff_delay(attempt, cap);
            let next = backoff_delay(attempt + 1, cap);
            assert_eq!(next, (current * 2).min(cap));
        }
    }

    #[test]
    fn default_policy_is_retry() {
        assert_eq!(RetryPolicy::default(), RetryPolicy::RetryJob);
    }
}
