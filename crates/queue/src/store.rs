//! Queue store seam.
//!
//! The pipeline only ever reads a bounded page of eligible items and mutates
//! single items. [`PublishQueueRepository`] is the production store;
//! [`InMemoryQueueStore`] backs tests and single-node runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{AppError, AppResult};
use courier_db::entities::publish_queue::{FailureUpdate, QueueState};
use courier_db::repositories::PublishQueueRepository;
use tokio::sync::RwLock;

use crate::QueueItem;

/// Storage operations used by batch runs and subscriber workers.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Items due for transmission, in transmission order, at most `limit`.
    async fn find_transmittable(
        &self,
        now: DateTime<Utc>,
        limit: u64,
        delivery_type: Option<&str>,
    ) -> AppResult<Vec<QueueItem>>;

    /// Fetch one item.
    async fn find_by_id(&self, id: &str) -> AppResult<Option<QueueItem>>;

    /// `state = in-progress`, stamping `transmit_started_at`.
    async fn mark_in_progress(&self, id: &str, now: DateTime<Utc>) -> AppResult<()>;

    /// `state = success`.
    async fn mark_success(&self, id: &str, now: DateTime<Utc>) -> AppResult<()>;

    /// Apply `failure` if the stored item still matches `current`.
    async fn record_failure(&self, current: &QueueItem, failure: FailureUpdate) -> AppResult<()>;

    /// Items `in-progress` since before `started_before`.
    async fn find_stuck_in_progress(
        &self,
        started_before: DateTime<Utc>,
        limit: u64,
    ) -> AppResult<Vec<QueueItem>>;

    /// Move a stuck `in-progress` item back to `retrying`, due now.
    async fn reset_stuck_to_retrying(&self, id: &str, now: DateTime<Utc>) -> AppResult<()>;
}

#[async_trait]
impl QueueStore for PublishQueueRepository {
    async fn find_transmittable(
        &self,
        now: DateTime<Utc>,
        limit: u64,
        delivery_type: Option<&str>,
    ) -> AppResult<Vec<QueueItem>> {
        Self::find_transmittable(self, now, limit, delivery_type).await
    }

    async fn find_by_id(&self, id: &str) -> AppResult<Option<QueueItem>> {
        Self::find_by_id(self, id).await
    }

    async fn mark_in_progress(&self, id: &str, now: DateTime<Utc>) -> AppResult<()> {
        Self::mark_in_progress(self, id, now).await
    }

    async fn mark_success(&self, id: &str, now: DateTime<Utc>) -> AppResult<()> {
        Self::mark_success(self, id, now).await
    }

    async fn record_failure(&self, current: &QueueItem, failure: FailureUpdate) -> AppResult<()> {
        Self::record_failure(self, current, failure).await
    }

    async fn find_stuck_in_progress(
        &self,
        started_before: DateTime<Utc>,
        limit: u64,
    ) -> AppResult<Vec<QueueItem>> {
        Self::find_stuck_in_progress(self, started_before, limit).await
    }

    async fn reset_stuck_to_retrying(&self, id: &str, now: DateTime<Utc>) -> AppResult<()> {
        Self::reset_stuck_to_retrying(self, id, now).await
    }
}

/// Whether an item is selected by a batch run at `now`.
#[must_use]
pub fn is_transmittable(item: &QueueItem, now: DateTime<Utc>, delivery_type: Option<&str>) -> bool {
    if item.destination.is_pull() {
        return false;
    }
    if delivery_type.is_some_and(|wanted| item.destination.delivery_type != wanted) {
        return false;
    }

    match item.state {
        QueueState::Pending => true,
        QueueState::Retrying => item
            .next_retry_attempt_at
            .is_some_and(|at| at <= now),
        _ => false,
    }
}

/// Queue items held in memory.
#[derive(Clone, Default)]
pub struct InMemoryQueueStore {
    items: Arc<RwLock<BTreeMap<String, QueueItem>>>,
}

impl InMemoryQueueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an item.
    pub async fn insert(&self, item: QueueItem) {
        self.items.write().await.insert(item.id.clone(), item);
    }

    /// Snapshot of one item.
    pub async fn get(&self, id: &str) -> Option<QueueItem> {
        self.items.read().await.get(id).cloned()
    }

    /// Snapshot of every item, ordered by id.
    pub async fn all(&self) -> Vec<QueueItem> {
        self.items.read().await.values().cloned().collect()
    }

    async fn modify<F>(&self, id: &str, apply: F) -> AppResult<()>
    where
        F: FnOnce(&mut QueueItem) -> AppResult<()> + Send,
    {
        let mut items = self.items.write().await;
        let item = items
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("Queue item {id} not found")))?;
        apply(item)
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn find_transmittable(
        &self,
        now: DateTime<Utc>,
        limit: u64,
        delivery_type: Option<&str>,
    ) -> AppResult<Vec<QueueItem>> {
        let items = self.items.read().await;
        let mut selected: Vec<QueueItem> = items
            .values()
            .filter(|item| is_transmittable(item, now, delivery_type))
            .cloned()
            .collect();

        selected.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.subscriber_id.cmp(&b.subscriber_id))
                .then_with(|| a.published_seq_num.cmp(&b.published_seq_num))
        });
        selected.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(selected)
    }

    async fn find_by_id(&self, id: &str) -> AppResult<Option<QueueItem>> {
        Ok(self.get(id).await)
    }

    async fn mark_in_progress(&self, id: &str, now: DateTime<Utc>) -> AppResult<()> {
        self.modify(id, |item| {
            item.state = QueueState::InProgress;
            item.transmit_started_at = Some(now.into());
            item.updated_at = Some(now.into());
            Ok(())
        })
        .await
    }

    async fn mark_success(&self, id: &str, now: DateTime<Utc>) -> AppResult<()> {
        self.modify(id, |item| {
            item.state = QueueState::Success;
            item.error_message = None;
            item.updated_at = Some(now.into());
            Ok(())
        })
        .await
    }

    async fn record_failure(&self, current: &QueueItem, failure: FailureUpdate) -> AppResult<()> {
        let expected_attempt = current.retry_attempt;
        self.modify(&current.id, move |item| {
            if item.retry_attempt != expected_attempt {
                return Err(AppError::Conflict(format!(
                    "Queue item {} changed since it was read",
                    item.id
                )));
            }
            item.state = failure.state;
            item.retry_attempt = failure.retry_attempt;
            if let Some(at) = failure.next_retry_attempt_at {
                item.next_retry_attempt_at = Some(at);
            }
            item.error_message = failure.error_message;
            item.updated_at = Some(failure.updated_at);
            Ok(())
        })
        .await
    }

    async fn find_stuck_in_progress(
        &self,
        started_before: DateTime<Utc>,
        limit: u64,
    ) -> AppResult<Vec<QueueItem>> {
        let items = self.items.read().await;
        let mut stuck: Vec<QueueItem> = items
            .values()
            .filter(|item| {
                item.state == QueueState::InProgress
                    && item
                        .transmit_started_at
                        .is_some_and(|at| at < started_before)
            })
            .cloned()
            .collect();

        stuck.sort_by_key(|item| item.transmit_started_at);
        stuck.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(stuck)
    }

    async fn reset_stuck_to_retrying(&self, id: &str, now: DateTime<Utc>) -> AppResult<()> {
        self.modify(id, |item| {
            if item.state != QueueState::InProgress {
                return Err(AppError::Conflict(format!(
                    "Queue item {} is no longer in progress",
                    item.id
                )));
            }
            item.state = QueueState::Retrying;
            item.next_retry_attempt_at = Some(now.into());
            item.updated_at = Some(now.into());
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use courier_db::test_utils::QueueItemFixture;

    #[tokio::test]
    async fn test_pending_selected_in_transmission_order() {
        let store = InMemoryQueueStore::new();
        let base = Utc::now() - Duration::minutes(5);

        store.insert(QueueItemFixture::pending("q-b1", "sub-b", 1).created_at(base).build()).await;
        store.insert(QueueItemFixture::pending("q-a2", "sub-a", 2).created_at(base).build()).await;
        store.insert(QueueItemFixture::pending("q-a1", "sub-a", 1).created_at(base).build()).await;
        store
            .insert(
                QueueItemFixture::pending("q-a0", "sub-a", 0)
                    .created_at(base + Duration::seconds(1))
                    .build(),
            )
            .await;

        let ids: Vec<String> = store
            .find_transmittable(Utc::now(), 500, None)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.id)
            .collect();

        assert_eq!(ids, vec!["q-a1", "q-a2", "q-b1", "q-a0"]);
    }

    #[tokio::test]
    async fn test_retrying_selected_only_when_due() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let due_at = now + Duration::minutes(3);

        store
            .insert(QueueItemFixture::pending("q1", "sub", 1).retrying(1, due_at).build())
            .await;

        assert!(store.find_transmittable(now, 500, None).await.unwrap().is_empty());
        assert_eq!(store.find_transmittable(due_at, 500, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pull_never_selected() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();

        store
            .insert(QueueItemFixture::pending("pending", "sub", 1).delivery_type("pull").build())
            .await;
        store
            .insert(
                QueueItemFixture::pending("retrying", "sub", 2)
                    .delivery_type("pull")
                    .retrying(1, now - Duration::minutes(1))
                    .build(),
            )
            .await;

        assert!(store.find_transmittable(now, 500, None).await.unwrap().is_empty());
        assert!(store.find_transmittable(now, 500, Some("pull")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_page_size_and_type_filter() {
        let store = InMemoryQueueStore::new();
        for seq in 0..5 {
            store
                .insert(QueueItemFixture::pending(&format!("http-{seq}"), "sub", seq).build())
                .await;
        }
        store
            .insert(QueueItemFixture::pending("ftp", "sub", 9).delivery_type("ftp").build())
            .await;

        assert_eq!(store.find_transmittable(Utc::now(), 3, None).await.unwrap().len(), 3);

        let ftp = store.find_transmittable(Utc::now(), 500, Some("ftp")).await.unwrap();
        assert_eq!(ftp.len(), 1);
        assert_eq!(ftp[0].id, "ftp");
    }

    #[tokio::test]
    async fn test_terminal_and_in_progress_not_selected() {
        let store = InMemoryQueueStore::new();
        for (id, state) in [
            ("a", QueueState::InProgress),
            ("b", QueueState::Success),
            ("c", QueueState::Failed),
            ("d", QueueState::Canceled),
        ] {
            store.insert(QueueItemFixture::pending(id, "sub", 1).state(state).build()).await;
        }

        assert!(store.find_transmittable(Utc::now(), 500, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_failure_conflict_on_stale_read() {
        let store = InMemoryQueueStore::new();
        let item = QueueItemFixture::pending("q1", "sub", 1).build();
        store.insert(item.clone()).await;
        let now = Utc::now();

        let failure = FailureUpdate {
            state: QueueState::Retrying,
            retry_attempt: 1,
            next_retry_attempt_at: Some(now.into()),
            error_message: Some("boom".to_string()),
            updated_at: now.into(),
        };
        store.record_failure(&item, failure.clone()).await.unwrap();

        let result = store.record_failure(&item, failure).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert_eq!(store.get("q1").await.unwrap().retry_attempt, 1);
    }

    #[tokio::test]
    async fn test_mark_success_is_idempotent() {
        let store = InMemoryQueueStore::new();
        store.insert(QueueItemFixture::pending("q1", "sub", 1).build()).await;
        let now = Utc::now();

        store.mark_success("q1", now).await.unwrap();
        store.mark_success("q1", now).await.unwrap();
        assert_eq!(store.get("q1").await.unwrap().state, QueueState::Success);
    }

    #[tokio::test]
    async fn test_missing_item() {
        let store = InMemoryQueueStore::new();
        let result = store.mark_in_progress("missing", Utc::now()).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stuck_items() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();

        store
            .insert(
                QueueItemFixture::pending("old", "sub", 1)
                    .state(QueueState::InProgress)
                    .transmit_started_at(now - Duration::minutes(20))
                    .build(),
            )
            .await;
        store
            .insert(
                QueueItemFixture::pending("new", "sub", 2)
                    .state(QueueState::InProgress)
                    .transmit_started_at(now)
                    .build(),
            )
            .await;

        let stuck = store
            .find_stuck_in_progress(now - Duration::minutes(5), 100)
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, "old");

        store.reset_stuck_to_retrying("old", now).await.unwrap();
        let reset = store.get("old").await.unwrap();
        assert_eq!(reset.state, QueueState::Retrying);
        assert!(store.reset_stuck_to_retrying("old", now).await.is_err());
    }
}
