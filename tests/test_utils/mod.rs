//! Test utilities for database testing.
//!
//! SQLite databases with migrations applied, plus helpers for building a
//! token refresh coordinator against a mock token endpoint.

use anyhow::Result;
use ingestion::crypto::CryptoKey;
use ingestion::repositories::SecretStore;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Sets up an in-memory SQLite database with all migrations applied.
#[allow(dead_code)]
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// File-backed SQLite database shared by several pooled connections.
///
/// Keep the returned [`TempDir`] alive for the duration of the test.
#[allow(dead_code)]
pub async fn setup_file_db() -> Result<(TempDir, Arc<DatabaseConnection>)> {
    let dir = TempDir::new()?;
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());

    let mut opt = ConnectOptions::new(url);
    opt.max_connections(8)
        .acquire_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;
    Migrator::up(&db, None).await?;
    Ok((dir, Arc::new(db)))
}

/// Secret store with a fixed test key.
#[allow(dead_code)]
pub fn test_secret_store() -> SecretStore {
    SecretStore::new(CryptoKey::new(vec![0x42; 32]).expect("valid test key"))
}
