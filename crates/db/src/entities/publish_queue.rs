//! Publish queue entity.

use sea_orm::FromJsonQueryResult;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Delivery type consumed by the external pull collaborator; never transmitted.
pub const PULL_DELIVERY_TYPE: &str = "pull";

/// Transmission state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "kebab-case")]
pub enum QueueState {
    /// Waiting for its first attempt.
    #[sea_orm(string_value = "pending")]
    Pending,
    /// A worker has started transmitting it.
    #[sea_orm(string_value = "in-progress")]
    InProgress,
    /// Failed at least once; eligible again after `next_retry_attempt_at`.
    #[sea_orm(string_value = "retrying")]
    Retrying,
    /// Delivered.
    #[sea_orm(string_value = "success")]
    Success,
    /// Retry budget exhausted.
    #[sea_orm(string_value = "failed")]
    Failed,
    /// Cancelled outside the pipeline.
    #[sea_orm(string_value = "canceled")]
    Canceled,
}

impl QueueState {
    /// Stored string value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how a queue item is delivered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct Destination {
    /// Human readable destination name.
    #[serde(default)]
    pub name: String,
    /// Selects the transmitter.
    pub delivery_type: String,
    /// Delivery-type specific parameters (endpoint, credentials, path...).
    #[serde(default)]
    pub config: Json,
}

impl Destination {
    /// Whether the item is left for the pull-based consumer.
    #[must_use]
    pub fn is_pull(&self) -> bool {
        self.delivery_type == PULL_DELIVERY_TYPE
    }
}

/// One outbound delivery of a content item to one subscriber.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "publish_queue")]
pub struct Model {
    /// Queue item ID.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Source content item.
    #[sea_orm(indexed)]
    pub item_id: String,

    /// Version of the content item that was published.
    pub item_version: i32,

    /// Headline of the content item, for logs.
    #[sea_orm(column_type = "Text", nullable)]
    pub headline: Option<String>,

    /// Destination subscriber; items for one subscriber are sent in order.
    #[sea_orm(indexed)]
    pub subscriber_id: String,

    /// Where and how to deliver.
    #[sea_orm(column_type = "JsonBinary")]
    pub destination: Destination,

    /// Transmission state.
    pub state: QueueState,

    /// Order of publication within the subscriber.
    pub published_seq_num: i64,

    /// Rendered payload handed to the transmitter.
    #[sea_orm(column_type = "Text")]
    pub formatted_item: String,

    /// Number of failed attempts recorded so far.
    #[sea_orm(default_value = 0)]
    pub retry_attempt: i32,

    /// When a `retrying` item becomes eligible again.
    #[sea_orm(nullable)]
    pub next_retry_attempt_at: Option<DateTimeWithTimeZone>,

    /// When the latest attempt started.
    #[sea_orm(nullable)]
    pub transmit_started_at: Option<DateTimeWithTimeZone>,

    /// Last delivery error.
    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    /// Enqueue time; the first selection key.
    pub created_at: DateTimeWithTimeZone,

    /// Last state change.
    #[sea_orm(nullable)]
    pub updated_at: Option<DateTimeWithTimeZone>,
}

/// Queue items reference no other table.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// State written after a failed delivery attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureUpdate {
    /// `retrying` or `failed`.
    pub state: QueueState,
    /// Attempt count to store.
    pub retry_attempt: i32,
    /// Only set when the item goes back to `retrying`.
    pub next_retry_attempt_at: Option<DateTimeWithTimeZone>,
    /// Error from the failed attempt.
    pub error_message: Option<String>,
    /// Time of the write.
    pub updated_at: DateTimeWithTimeZone,
}
