//! Tenant secret store
//!
//! Key/value storage for per-tenant credentials in the `tenant_secrets` table.
//! Every value is sealed with the configured crypto key before it reaches the
//! database. All operations take a generic [`ConnectionTrait`] so they can run
//! on the shared pool or inside a caller-owned transaction.

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ConnectionTrait, DbErr, EntityTrait, Set};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{CryptoError, CryptoKey, SecretSlot};
use crate::models::tenant_secret::{self, Entity as TenantSecret};

/// Errors raised by [`SecretStore`]
#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("secret encryption error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("secret '{secret_key}' is not valid JSON: {source}")]
    Serde {
        secret_key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Encrypted key/value store scoped by tenant
#[derive(Debug, Clone)]
pub struct SecretStore {
    crypto_key: CryptoKey,
}

impl SecretStore {
    pub fn new(crypto_key: CryptoKey) -> Self {
        Self { crypto_key }
    }

    /// Reads and decrypts a secret, `None` when the slot is empty
    pub async fn get<C>(
        &self,
        conn: &C,
        tenant_id: Uuid,
        secret_key: &str,
    ) -> Result<Option<Vec<u8>>, SecretStoreError>
    where
        C: ConnectionTrait,
    {
        let row = TenantSecret::find_by_id((tenant_id, secret_key.to_string()))
            .one(conn)
            .await?;

        match row {
            Some(row) => {
                let slot = SecretSlot::new(tenant_id, secret_key);
                let plaintext = self.crypto_key.open(slot, &row.value_ciphertext)?;
                Ok(Some(plaintext))
            }
            None => Ok(None),
        }
    }

    /// Encrypts and upserts a secret
    pub async fn put<C>(
        &self,
        conn: &C,
        tenant_id: Uuid,
        secret_key: &str,
        value: &[u8],
    ) -> Result<(), SecretStoreError>
    where
        C: ConnectionTrait,
    {
        let ciphertext = self
            .crypto_key
            .seal(SecretSlot::new(tenant_id, secret_key), value)?;
        let now = Utc::now().fixed_offset();

        let row = tenant_secret::ActiveModel {
            tenant_id: Set(tenant_id),
            secret_key: Set(secret_key.to_string()),
            value_ciphertext: Set(ciphertext),
            created_at: Set(now),
            updated_at: Set(now),
        };

        TenantSecret::insert(row)
            .on_conflict(
                OnConflict::columns([
                    tenant_secret::Column::TenantId,
                    tenant_secret::Column::SecretKey,
                ])
                .update_columns([
                    tenant_secret::Column::ValueCiphertext,
                    tenant_secret::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;

        Ok(())
    }

    /// Reads a JSON-encoded secret
    pub async fn get_json<C, T>(
        &self,
        conn: &C,
        tenant_id: Uuid,
        secret_key: &str,
    ) -> Result<Option<T>, SecretStoreError>
    where
        C: ConnectionTrait,
        T: DeserializeOwned,
    {
        let Some(bytes) = self.get(conn, tenant_id, secret_key).await? else {
            return Ok(None);
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SecretStoreError::Serde {
                secret_key: secret_key.to_string(),
                source,
            })
    }

    /// Stores a value as a JSON-encoded secret
    pub async fn put_json<C, T>(
        &self,
        conn: &C,
        tenant_id: Uuid,
        secret_key: &str,
        value: &T,
    ) -> Result<(), SecretStoreError>
    where
        C: ConnectionTrait,
        T: Serialize,
    {
        let bytes = serde_json::to_vec(value).map_err(|source| SecretStoreError::Serde {
            secret_key: secret_key.to_string(),
            source,
        })?;
        self.put(conn, tenant_id, secret_key, &bytes).await
    }
}
