//! Batch run job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to select transmittable items and fan them out per subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitBatchJob {
    /// When the run was requested; stale requests are dropped.
    pub requested_at: DateTime<Utc>,

    /// Restrict selection to one delivery type.
    #[serde(default)]
    pub delivery_type: Option<String>,
}

impl TransmitBatchJob {
    /// Create a job requested now.
    #[must_use]
    pub fn new(delivery_type: Option<String>) -> Self {
        Self {
            requested_at: Utc::now(),
            delivery_type,
        }
    }

    /// Whether the request is older than `expiry` at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, expiry: std::time::Duration) -> bool {
        chrono::Duration::from_std(expiry)
            .is_ok_and(|expiry| now - self.requested_at > expiry)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_expiry() {
        let job = TransmitBatchJob::new(None);
        let expiry = Duration::from_secs(10);

        assert!(!job.is_expired(job.requested_at, expiry));
        assert!(!job.is_expired(job.requested_at + chrono::Duration::seconds(10), expiry));
        assert!(job.is_expired(job.requested_at + chrono::Duration::seconds(11), expiry));
    }

    #[test]
    fn test_delivery_type_defaults_to_none() {
        let job: TransmitBatchJob =
            serde_json::from_str(r#"{"requested_at":"2025-01-01T00:00:00Z"}"#).unwrap();
        assert!(job.delivery_type.is_none());
    }
}
