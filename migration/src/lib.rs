//! Database migrations for the ingestion workers.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_090000_create_tenant_secrets;
mod m2025_12_01_090100_create_refresh_locks;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_090000_create_tenant_secrets::Migration),
            Box::new(m2025_12_01_090100_create_refresh_locks::Migration),
        ]
    }
}
