//! # Token Refresh Coordinator
//!
//! Keeps one OAuth access token per tenant and provider valid while many worker
//! processes ask for it at once.
//!
//! Reads are lock-free: a token that does not expire within the safety margin
//! is returned straight from the secret store. A refresh runs inside a database
//! transaction that first takes a transaction-scoped lock keyed by tenant and
//! provider, then reads the stored token again. Whoever gets the lock second
//! finds the token the first holder just committed and returns it without
//! calling the provider, so a rotated refresh token is only ever spent once.
//!
//! Postgres takes `pg_advisory_xact_lock`, which the server releases on commit,
//! rollback or session loss. Other backends upsert a row in `refresh_locks`;
//! the row write lock is held until the transaction ends.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr, EntityTrait, Set,
    Statement, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::TokenRefreshConfig;
use crate::error::ConnectorError;
use crate::models::refresh_lock::{self, Entity as RefreshLock};
use crate::repositories::secret_store::{SecretStore, SecretStoreError};

/// Stored OAuth credentials for one tenant and provider
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    /// True when the token outlives `now + margin`.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at > now + margin
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Response of a successful refresh grant
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present only when the provider rotated the refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the new access token in seconds
    pub expires_in: i64,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("rotated", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// OAuth application credentials
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Provider token endpoint exchanging a refresh token for a new grant
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(
        &self,
        refresh_token: &str,
        credentials: &ClientCredentials,
    ) -> Result<TokenGrant, ConnectorError>;
}

#[derive(Debug, Error)]
pub enum TokenRefreshError {
    #[error("OAuth client credentials are not configured")]
    MissingClientCredentials,
    #[error("no refresh token stored for tenant {tenant_id} and provider {provider}")]
    MissingRefreshToken { tenant_id: Uuid, provider: String },
    #[error("token endpoint rejected the refresh: {0}")]
    Upstream(#[from] ConnectorError),
    #[error("database error during token refresh: {0}")]
    Storage(#[from] DbErr),
    #[error("secret store error: {0}")]
    Secret(#[from] SecretStoreError),
    #[error("timed out after {waited_ms}ms waiting for the refresh lock")]
    LockTimeout { waited_ms: u64 },
}

/// Secret slot holding the token record of `provider`.
pub fn token_secret_key(provider: &str) -> String {
    format!("{}.oauth_token", provider)
}

/// `now + expires_in` seconds, `None` when it does not fit a timestamp.
pub fn expiry_after(now: DateTime<Utc>, expires_in: i64) -> Option<DateTime<Utc>> {
    now.checked_add_signed(Duration::try_seconds(expires_in)?)
}

/// Name of the lock serializing refreshes for one tenant and provider.
pub fn refresh_lock_key(tenant_id: Uuid, provider: &str) -> String {
    format!("{}:token_refresh:{}", tenant_id, provider)
}

/// Takes the refresh lock inside `txn`, blocking while another transaction holds it.
async fn acquire_refresh_lock(txn: &DatabaseTransaction, lock_key: &str) -> Result<(), DbErr> {
    match txn.get_database_backend() {
        DbBackend::Postgres => {
            txn.execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))",
                [lock_key.into()],
            ))
            .await?;
        }
        _ => {
            let row = refresh_lock::ActiveModel {
                lock_key: Set(lock_key.to_string()),
                acquired_at: Set(Utc::now().fixed_offset()),
            };
            RefreshLock::insert(row)
                .on_conflict(
                    OnConflict::column(refresh_lock::Column::LockKey)
                        .update_column(refresh_lock::Column::AcquiredAt)
                        .to_owned(),
                )
                .exec_without_returning(txn)
                .await?;
        }
    }
    Ok(())
}

/// Serializes OAuth refreshes for one provider across workers
#[derive(Clone)]
pub struct TokenRefreshCoordinator {
    db: Arc<DatabaseConnection>,
    secrets: SecretStore,
    endpoint: Arc<dyn TokenEndpoint>,
    credentials: Option<ClientCredentials>,
    provider: String,
    config: TokenRefreshConfig,
}

impl TokenRefreshCoordinator {
    pub fn new(
        db: Arc<DatabaseConnection>,
        secrets: SecretStore,
        endpoint: Arc<dyn TokenEndpoint>,
        credentials: Option<ClientCredentials>,
        provider: impl Into<String>,
        config: TokenRefreshConfig,
    ) -> Self {
        Self {
            db,
            secrets,
            endpoint,
            credentials,
            provider: provider.into(),
            config,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Reads the stored token without locking.
    pub async fn load_token(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<TokenRecord>, TokenRefreshError> {
        let record = self
            .secrets
            .get_json(self.db.as_ref(), tenant_id, &token_secret_key(&self.provider))
            .await?;
        Ok(record)
    }

    /// Seeds or replaces the stored token, e.g. after an OAuth install.
    #[instrument(skip(self, record), fields(provider = %self.provider))]
    pub async fn store_token(
        &self,
        tenant_id: Uuid,
        record: &TokenRecord,
    ) -> Result<(), TokenRefreshError> {
        self.secrets
            .put_json(
                self.db.as_ref(),
                tenant_id,
                &token_secret_key(&self.provider),
                record,
            )
            .await?;
        info!(%tenant_id, expires_at = %record.expires_at, "Stored OAuth token");
        Ok(())
    }

    /// Returns an access token valid past the safety margin, refreshing when needed.
    #[instrument(skip(self), fields(provider = %self.provider))]
    pub async fn get_valid_access_token(
        &self,
        tenant_id: Uuid,
    ) -> Result<String, TokenRefreshError> {
        if let Some(record) = self.load_token(tenant_id).await?
            && record.is_fresh(Utc::now(), self.config.safety_margin())
        {
            debug!(%tenant_id, expires_at = %record.expires_at, "Using cached access token");
            return Ok(record.access_token);
        }

        self.refresh_token(tenant_id).await
    }

    /// Refreshes the access token under the per-tenant lock.
    ///
    /// If another worker refreshed while this call waited for the lock, its
    /// token is returned and the provider is not called.
    #[instrument(skip(self), fields(provider = %self.provider))]
    pub async fn refresh_token(&self, tenant_id: Uuid) -> Result<String, TokenRefreshError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(TokenRefreshError::MissingClientCredentials)?;

        let has_refresh_token = self
            .load_token(tenant_id)
            .await?
            .is_some_and(|record| record.refresh_token.is_some());
        if !has_refresh_token {
            return Err(self.missing_refresh_token(tenant_id));
        }

        counter!("token_refresh_attempts_total", "provider" => self.provider.clone()).increment(1);
        let refresh_started = Instant::now();

        let txn = self.db.begin().await?;
        let lock_key = refresh_lock_key(tenant_id, &self.provider);

        let lock_started = Instant::now();
        match self.config.lock_wait_timeout() {
            Some(limit) => {
                tokio::time::timeout(limit, acquire_refresh_lock(&txn, &lock_key))
                    .await
                    .map_err(|_| {
                        counter!("token_refresh_lock_timeouts_total").increment(1);
                        TokenRefreshError::LockTimeout {
                            waited_ms: limit.as_millis() as u64,
                        }
                    })??;
            }
            None => acquire_refresh_lock(&txn, &lock_key).await?,
        }
        histogram!("token_refresh_lock_wait_ms")
            .record(lock_started.elapsed().as_secs_f64() * 1_000.0);
        debug!(%tenant_id, %lock_key, "Acquired refresh lock");

        let secret_key = token_secret_key(&self.provider);
        let current: Option<TokenRecord> =
            self.secrets.get_json(&txn, tenant_id, &secret_key).await?;
        let Some(current) = current else {
            return Err(self.missing_refresh_token(tenant_id));
        };

        if current.is_fresh(Utc::now(), self.config.safety_margin()) {
            txn.commit().await?;
            counter!("token_refresh_reused_total", "provider" => self.provider.clone())
                .increment(1);
            info!(
                %tenant_id,
                expires_at = %current.expires_at,
                "Token already refreshed by another worker"
            );
            return Ok(current.access_token);
        }

        let Some(refresh_token) = current.refresh_token else {
            return Err(self.missing_refresh_token(tenant_id));
        };

        let outcome = self
            .endpoint
            .refresh(&refresh_token, credentials)
            .await
            .and_then(|grant| {
                let expires_at = expiry_after(Utc::now(), grant.expires_in).ok_or_else(|| {
                    ConnectorError::MalformedResponse {
                        details: format!("expires_in {} is out of range", grant.expires_in),
                    }
                })?;
                Ok((grant, expires_at))
            });

        let (grant, expires_at) = match outcome {
            Ok(accepted) => accepted,
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed refresh did not complete");
                }
                counter!("token_refresh_failure_total", "provider" => self.provider.clone())
                    .increment(1);
                warn!(%tenant_id, error = %err, "Token endpoint rejected refresh");
                return Err(TokenRefreshError::Upstream(err));
            }
        };

        let rotated = grant.refresh_token.is_some();
        let refreshed = TokenRecord {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(Some(refresh_token)),
            expires_at,
        };

        self.secrets
            .put_json(&txn, tenant_id, &secret_key, &refreshed)
            .await?;
        txn.commit().await?;

        histogram!("token_refresh_latency_ms")
            .record(refresh_started.elapsed().as_secs_f64() * 1_000.0);
        counter!("token_refresh_success_total", "provider" => self.provider.clone()).increment(1);
        info!(
            %tenant_id,
            rotated,
            expires_at = %refreshed.expires_at,
            "Refreshed access token"
        );

        Ok(refreshed.access_token)
    }

    fn missing_refresh_token(&self, tenant_id: Uuid) -> TokenRefreshError {
        TokenRefreshError::MissingRefreshToken {
            tenant_id,
            provider: self.provider.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_respects_margin() {
        let now = Utc::now();
        let margin = Duration::minutes(5);
        let record = |expires_at| TokenRecord {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_at,
        };

        assert!(record(now + Duration::minutes(10)).is_fresh(now, margin));
        assert!(!record(now + Duration::minutes(5)).is_fresh(now, margin));
        assert!(!record(now + Duration::minutes(2)).is_fresh(now, margin));
        assert!(!record(now - Duration::seconds(1)).is_fresh(now, margin));
    }

    #[test]
    fn test_expiry_rejects_out_of_range_lifetimes() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, 1800), Some(now + Duration::seconds(1800)));
        assert!(expiry_after(now, 9_000_000_000_000).is_none());
        assert!(expiry_after(now, i64::MAX).is_none());
    }

    #[test]
    fn test_key_formats() {
        let tenant = Uuid::nil();
        assert_eq!(token_secret_key("hubspot"), "hubspot.oauth_token");
        assert_eq!(
            refresh_lock_key(tenant, "hubspot"),
            "00000000-0000-0000-0000-000000000000:token_refresh:hubspot"
        );
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let record = TokenRecord {
            access_token: "secret-access".to_string(),
            refresh_token: Some("secret-refresh".to_string()),
            expires_at: Utc::now(),
        };
        let rendered = format!("{:?}", record);
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));

        let credentials = ClientCredentials {
            client_id: "client".to_string(),
            client_secret: "shh".to_string(),
        };
        assert!(!format!("{:?}", credentials).contains("shh"));
    }

    #[test]
    fn test_grant_without_refresh_token_deserializes() {
        let grant: TokenGrant =
            serde_json::from_str(r#"{"access_token":"a","expires_in":1800}"#).unwrap();
        assert!(grant.refresh_token.is_none());
        assert_eq!(grant.expires_in, 1800);
    }
}
