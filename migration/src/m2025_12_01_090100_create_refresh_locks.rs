//! Migration to create the refresh_locks table.
//!
//! Backends without transaction-scoped advisory locks (SQLite) serialize token
//! refreshes by upserting a row here inside the refresh transaction. Postgres
//! uses `pg_advisory_xact_lock` and never touches this table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RefreshLocks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RefreshLocks::LockKey)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RefreshLocks::AcquiredAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RefreshLocks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RefreshLocks {
    Table,
    LockKey,
    AcquiredAt,
}
