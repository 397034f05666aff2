//! Retry with exponential backoff for upstream calls.
//!
//! Neither the paginator nor the refresh coordinator retries on its own; wrap a
//! source or token endpoint in [`Retrying`] to get bounded retries on transient
//! and rate-limited failures.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use rand::Rng;
use tracing::{error, warn};

use crate::config::RetryPolicyConfig;
use crate::error::{ConnectorError, ErrorClass};
use crate::pagination::{PageCursor, SearchPage, SearchSource, SearchWindow};
use crate::token_refresh::{ClientCredentials, TokenEndpoint, TokenGrant};

/// Backoff schedule for retried calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    /// Total attempts including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryPolicyConfig::default())
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_millis),
            max_delay: Duration::from_millis(config.max_millis),
            jitter_factor: config.jitter_factor,
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), honouring a vendor hint.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }

        let factor = 2u32.saturating_pow(attempt.min(31));
        let exponential = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter_factor <= 0.0 {
            return exponential;
        }

        let jitter = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        exponential.mul_f64((1.0 + jitter).max(0.0))
    }

    /// Runs `operation` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<F, Fut, T>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, ConnectorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    let class = err.classify();

                    if class == ErrorClass::Permanent {
                        return Err(err);
                    }

                    if attempt >= max_attempts {
                        error!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %err,
                            "Max retries exceeded, giving up"
                        );
                        counter!("upstream_retries_exhausted_total").increment(1);
                        return Err(err);
                    }

                    let delay = self.backoff(attempt - 1, err.retry_after());
                    warn!(
                        operation = operation_name,
                        attempt,
                        error_class = ?class,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Upstream call failed, retrying"
                    );
                    counter!("upstream_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Decorator adding [`RetryPolicy`] to a search source or token endpoint.
#[derive(Debug, Clone)]
pub struct Retrying<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> Retrying<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T> SearchSource for Retrying<T>
where
    T: SearchSource<Error = ConnectorError>,
{
    type Row = T::Row;
    type Error = ConnectorError;

    async fn fetch_page(
        &self,
        window: &SearchWindow,
        cursor: Option<&PageCursor>,
    ) -> Result<SearchPage<Self::Row>, ConnectorError> {
        self.policy
            .run("search_fetch_page", || self.inner.fetch_page(window, cursor))
            .await
    }
}

#[async_trait]
impl<T> TokenEndpoint for Retrying<T>
where
    T: TokenEndpoint,
{
    async fn refresh(
        &self,
        refresh_token: &str,
        credentials: &ClientCredentials,
    ) -> Result<TokenGrant, ConnectorError> {
        self.policy
            .run("token_refresh", || self.inner.refresh(refresh_token, credentials))
            .await
    }
}
