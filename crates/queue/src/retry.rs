//! Retry policy for failed transmissions.

use chrono::{DateTime, Duration, Utc};
use courier_common::TransmitConfig;
use courier_db::entities::publish_queue::{FailureUpdate, QueueState};

use crate::QueueItem;

/// Decides what a failed attempt does to a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts an item gets before it is marked `failed`.
    pub max_retry_attempt: i32,
    /// Fixed delay before a `retrying` item becomes eligible again.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransmitConfig::default())
    }
}

impl RetryPolicy {
    /// Build the policy from transmit settings.
    #[must_use]
    pub fn from_config(config: &TransmitConfig) -> Self {
        Self {
            max_retry_attempt: config.max_retry_attempt,
            retry_delay: config.retry_delay(),
        }
    }

    /// Whether an item that has already failed `retry_attempt` times gets
    /// another attempt after failing once more.
    #[must_use]
    pub const fn should_retry(&self, retry_attempt: i32) -> bool {
        retry_attempt.saturating_add(1) < self.max_retry_attempt
    }

    /// State to write after `current` failed with `error` at `now`.
    ///
    /// Exhausting the budget leaves `retry_attempt` as read, so a failed
    /// item records how many retries were scheduled for it.
    #[must_use]
    pub fn failure_update(
        &self,
        current: &QueueItem,
        error: &str,
        now: DateTime<Utc>,
    ) -> FailureUpdate {
        if self.should_retry(current.retry_attempt) {
            FailureUpdate {
                state: QueueState::Retrying,
                retry_attempt: current.retry_attempt + 1,
                next_retry_attempt_at: Some(
                    now.checked_add_signed(self.retry_delay)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC)
                        .into(),
                ),
                error_message: Some(error.to_string()),
                updated_at: now.into(),
            }
        } else {
            FailureUpdate {
                state: QueueState::Failed,
                retry_attempt: current.retry_attempt,
                next_retry_attempt_at: None,
                error_message: Some(error.to_string()),
                updated_at: now.into(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_db::test_utils::QueueItemFixture;

    fn policy(max_retry_attempt: i32) -> RetryPolicy {
        RetryPolicy {
            max_retry_attempt,
            retry_delay: Duration::minutes(3),
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = policy(3);

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_single_attempt_budget() {
        assert!(!policy(1).should_retry(0));
        assert!(!policy(0).should_retry(0));
    }

    #[test]
    fn test_failure_schedules_retry() {
        let now = Utc::now();
        let item = QueueItemFixture::pending("q1", "sub", 1).build();

        let update = policy(3).failure_update(&item, "connection refused", now);

        assert_eq!(update.state, QueueState::Retrying);
        assert_eq!(update.retry_attempt, 1);
        assert_eq!(
            update.next_retry_attempt_at,
            Some((now + Duration::minutes(3)).into())
        );
        assert_eq!(update.error_message.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_failure_exhausts_budget() {
        let now = Utc::now();
        let item = QueueItemFixture::pending("q1", "sub", 1)
            .retrying(2, now)
            .build();

        let update = policy(3).failure_update(&item, "timeout", now);

        assert_eq!(update.state, QueueState::Failed);
        assert_eq!(update.retry_attempt, 2);
        assert!(update.next_retry_attempt_at.is_none());
    }

    #[test]
    fn test_from_config() {
        let config = TransmitConfig {
            max_retry_attempt: 4,
            retry_attempt_delay_minutes: 7,
            ..TransmitConfig::default()
        };

        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_retry_attempt, 4);
        assert_eq!(policy.retry_delay, Duration::minutes(7));
    }
}
