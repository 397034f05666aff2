//! Migration to create the tenant_secrets table.
//!
//! Stores encrypted per-tenant credentials (OAuth token records and other
//! connector secrets) keyed by `(tenant_id, secret_key)`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TenantSecrets::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(TenantSecrets::TenantId).uuid().not_null())
                    .col(ColumnDef::new(TenantSecrets::SecretKey).text().not_null())
                    .col(
                        ColumnDef::new(TenantSecrets::ValueCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TenantSecrets::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(TenantSecrets::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_tenant_secrets")
                            .col(TenantSecrets::TenantId)
                            .col(TenantSecrets::SecretKey),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TenantSecrets::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TenantSecrets {
    Table,
    TenantId,
    SecretKey,
    ValueCiphertext,
    CreatedAt,
    UpdatedAt,
}
