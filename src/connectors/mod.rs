//! Connectors module
//!
//! Vendor API clients implementing the [`SearchSource`](crate::pagination::SearchSource)
//! and [`TokenEndpoint`](crate::token_refresh::TokenEndpoint) seams, plus the
//! access-token plumbing they share.

pub mod hubspot;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ConnectorError;
use crate::token_refresh::{TokenRefreshCoordinator, TokenRefreshError};

pub use hubspot::{
    HUBSPOT_PROVIDER_SLUG, HubSpotRecord, HubSpotSearchSource, HubSpotTokenEndpoint,
};

/// Supplies the bearer token for each API request
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, ConnectorError>;
}

/// A fixed token, for private apps and tests
#[derive(Clone)]
pub struct StaticAccessToken(String);

impl StaticAccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl AccessTokenSource for StaticAccessToken {
    async fn access_token(&self) -> Result<String, ConnectorError> {
        Ok(self.0.clone())
    }
}

/// Token of one tenant, kept valid by the refresh coordinator
#[derive(Clone)]
pub struct TenantAccessToken {
    coordinator: Arc<TokenRefreshCoordinator>,
    tenant_id: Uuid,
}

impl TenantAccessToken {
    pub fn new(coordinator: Arc<TokenRefreshCoordinator>, tenant_id: Uuid) -> Self {
        Self {
            coordinator,
            tenant_id,
        }
    }
}

#[async_trait]
impl AccessTokenSource for TenantAccessToken {
    async fn access_token(&self) -> Result<String, ConnectorError> {
        self.coordinator
            .get_valid_access_token(self.tenant_id)
            .await
            .map_err(token_error_to_connector)
    }
}

fn token_error_to_connector(err: TokenRefreshError) -> ConnectorError {
    match err {
        TokenRefreshError::Upstream(upstream) => upstream,
        TokenRefreshError::MissingClientCredentials
        | TokenRefreshError::MissingRefreshToken { .. } => ConnectorError::Configuration {
            details: err.to_string(),
        },
        TokenRefreshError::LockTimeout { .. } | TokenRefreshError::Storage(_) => {
            ConnectorError::TokenUnavailable {
                details: err.to_string(),
                retryable: true,
            }
        }
        TokenRefreshError::Secret(_) => ConnectorError::TokenUnavailable {
            details: err.to_string(),
            retryable: false,
        },
    }
}
