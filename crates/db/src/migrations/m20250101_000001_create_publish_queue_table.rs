//! Create `publish_queue` table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PublishQueue::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PublishQueue::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PublishQueue::ItemId).string_len(128).not_null())
                    .col(
                        ColumnDef::new(PublishQueue::ItemVersion)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(PublishQueue::Headline).text())
                    .col(
                        ColumnDef::new(PublishQueue::SubscriberId)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PublishQueue::Destination)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PublishQueue::State)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(PublishQueue::PublishedSeqNum)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(PublishQueue::FormattedItem).text().not_null())
                    .col(
                        ColumnDef::new(PublishQueue::RetryAttempt)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(PublishQueue::NextRetryAttemptAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(PublishQueue::TransmitStartedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(PublishQueue::ErrorMessage).text())
                    .col(
                        ColumnDef::new(PublishQueue::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(PublishQueue::UpdatedAt).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        // Selection: pending, or retrying and due
        manager
            .create_index(
                Index::create()
                    .name("idx_publish_queue_state_next_retry")
                    .table(PublishQueue::Table)
                    .col(PublishQueue::State)
                    .col(PublishQueue::NextRetryAttemptAt)
                    .to_owned(),
            )
            .await?;

        // Transmission order
        manager
            .create_index(
                Index::create()
                    .name("idx_publish_queue_transmit_order")
                    .table(PublishQueue::Table)
                    .col(PublishQueue::CreatedAt)
                    .col(PublishQueue::SubscriberId)
                    .col(PublishQueue::PublishedSeqNum)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_publish_queue_subscriber_id")
                    .table(PublishQueue::Table)
                    .col(PublishQueue::SubscriberId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_publish_queue_item_id")
                    .table(PublishQueue::Table)
                    .col(PublishQueue::ItemId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PublishQueue::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum PublishQueue {
    Table,
    Id,
    ItemId,
    ItemVersion,
    Headline,
    SubscriberId,
    Destination,
    State,
    PublishedSeqNum,
    FormattedItem,
    RetryAttempt,
    NextRetryAttemptAt,
    TransmitStartedAt,
    ErrorMessage,
    CreatedAt,
    UpdatedAt,
}
