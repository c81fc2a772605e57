//! Publish queue repository.

use std::sync::Arc;

use crate::entities::publish_queue::{
    self, FailureUpdate, PULL_DELIVERY_TYPE, QueueState,
};
use crate::entities::PublishQueue;
use chrono::{DateTime, Utc};
use courier_common::{AppError, AppResult};
use sea_orm::sea_query::extension::postgres::PgExpr;
use sea_orm::sea_query::{Expr, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, Condition, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Select, Set,
};

/// Publish queue repository for database operations.
#[derive(Clone)]
pub struct PublishQueueRepository {
    db: Arc<DatabaseConnection>,
}

/// `destination->>'delivery_type'`, with the key bound as a parameter.
fn delivery_type_expr() -> SimpleExpr {
    Expr::col((PublishQueue, publish_queue::Column::Destination)).cast_json_field("delivery_type")
}

/// Query selecting items due for transmission, in transmission order.
///
/// Eligible items are `pending`, or `retrying` with a due retry time, and are
/// not addressed to the pull consumer. `delivery_type` narrows the selection
/// to one transmitter.
#[must_use]
pub fn transmittable_query(
    now: DateTime<Utc>,
    limit: u64,
    delivery_type: Option<&str>,
) -> Select<PublishQueue> {
    let mut query = PublishQueue::find()
        .filter(
            Condition::any()
                .add(publish_queue::Column::State.eq(QueueState::Pending))
                .add(
                    Condition::all()
                        .add(publish_queue::Column::State.eq(QueueState::Retrying))
                        .add(publish_queue::Column::NextRetryAttemptAt.lte(now)),
                ),
        )
        .filter(Expr::expr(delivery_type_expr()).ne(PULL_DELIVERY_TYPE));

    if let Some(delivery_type) = delivery_type {
        query = query.filter(Expr::expr(delivery_type_expr()).eq(delivery_type));
    }

    query
        .order_by_asc(publish_queue::Column::CreatedAt)
        .order_by_asc(publish_queue::Column::SubscriberId)
        .order_by_asc(publish_queue::Column::PublishedSeqNum)
        .limit(limit)
}

impl PublishQueueRepository {
    /// Create a new publish queue repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find a queue item by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<publish_queue::Model>> {
        PublishQueue::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Get a queue item by ID, returning an error if not found.
    pub async fn get_by_id(&self, id: &str) -> AppResult<publish_queue::Model> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Queue item {id} not found")))
    }

    /// Insert a new queue item.
    pub async fn create(
        &self,
        model: publish_queue::ActiveModel,
    ) -> AppResult<publish_queue::Model> {
        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find items due for transmission.
    pub async fn find_transmittable(
        &self,
        now: DateTime<Utc>,
        limit: u64,
        delivery_type: Option<&str>,
    ) -> AppResult<Vec<publish_queue::Model>> {
        transmittable_query(now, limit, delivery_type)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Mark an item as being transmitted.
    pub async fn mark_in_progress(&self, id: &str, now: DateTime<Utc>) -> AppResult<()> {
        let update = publish_queue::ActiveModel {
            state: Set(QueueState::InProgress),
            transmit_started_at: Set(Some(now.into())),
            updated_at: Set(Some(now.into())),
            ..Default::default()
        };

        self.update_one(id, update, None).await
    }

    /// Mark an item as delivered. Writing it twice has no further effect.
    pub async fn mark_success(&self, id: &str, now: DateTime<Utc>) -> AppResult<()> {
        let update = publish_queue::ActiveModel {
            state: Set(QueueState::Success),
            error_message: Set(None),
            updated_at: Set(Some(now.into())),
            ..Default::default()
        };

        self.update_one(id, update, None).await
    }

    /// Record the outcome of a failed attempt.
    ///
    /// The write only applies while the stored `retry_attempt` still equals
    /// the one in `current`; otherwise [`AppError::Conflict`] is returned.
    pub async fn record_failure(
        &self,
        current: &publish_queue::Model,
        failure: FailureUpdate,
    ) -> AppResult<()> {
        let update = publish_queue::ActiveModel {
            state: Set(failure.state),
            retry_attempt: Set(failure.retry_attempt),
            next_retry_attempt_at: failure
                .next_retry_attempt_at
                .map_or(NotSet, |at| Set(Some(at))),
            error_message: Set(failure.error_message),
            updated_at: Set(Some(failure.updated_at)),
            ..Default::default()
        };

        self.update_one(
            &current.id,
            update,
            Some(publish_queue::Column::RetryAttempt.eq(current.retry_attempt)),
        )
        .await
    }

    /// Find items left `in-progress` since before `started_before`.
    pub async fn find_stuck_in_progress(
        &self,
        started_before: DateTime<Utc>,
        limit: u64,
    ) -> AppResult<Vec<publish_queue::Model>> {
        PublishQueue::find()
            .filter(publish_queue::Column::State.eq(QueueState::InProgress))
            .filter(publish_queue::Column::TransmitStartedAt.lt(started_before))
            .order_by_asc(publish_queue::Column::TransmitStartedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Put a stuck item back in line for an immediate retry.
    pub async fn reset_stuck_to_retrying(&self, id: &str, now: DateTime<Utc>) -> AppResult<()> {
        let update = publish_queue::ActiveModel {
            state: Set(QueueState::Retrying),
            next_retry_attempt_at: Set(Some(now.into())),
            updated_at: Set(Some(now.into())),
            ..Default::default()
        };

        self.update_one(
            id,
            update,
            Some(publish_queue::Column::State.eq(QueueState::InProgress)),
        )
        .await
    }

    async fn update_one(
        &self,
        id: &str,
        update: publish_queue::ActiveModel,
        guard: Option<sea_orm::sea_query::SimpleExpr>,
    ) -> AppResult<()> {
        let mut query = PublishQueue::update_many()
            .set(update)
            .filter(publish_queue::Column::Id.eq(id));
        let guarded = guard.is_some();
        if let Some(guard) = guard {
            query = query.filter(guard);
        }

        let result = query
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        match result.rows_affected {
            0 if guarded => Err(AppError::Conflict(format!(
                "Queue item {id} changed since it was read"
            ))),
            0 => Err(AppError::NotFound(format!("Queue item {id} not found"))),
            _ => Ok(()),
        }
    }
}
