//! # Error Handling
//!
//! Vendor-call error taxonomy shared by the search sources, the token
//! endpoints and the retry decorator.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by calls to an upstream SaaS API.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    /// Non-success HTTP status from the provider
    #[error("HTTP error {status}: {}", body.as_deref().unwrap_or("No body"))]
    Http { status: u16, body: Option<String> },

    /// Provider asked us to slow down
    #[error("Rate limit exceeded{}", retry_after.map(|s| format!(" (retry after: {}s)", s)).unwrap_or_default())]
    RateLimited { retry_after: Option<u64> },

    /// Credentials rejected by the provider
    #[error("Authentication error: {details}")]
    Authentication { details: String },

    /// Transport failure before a response arrived
    #[error("Network error: {details}")]
    Network { details: String, retryable: bool },

    /// Response arrived but could not be decoded
    #[error("Malformed response: {details}")]
    MalformedResponse { details: String },

    /// Local configuration prevents the call
    #[error("Configuration error: {details}")]
    Configuration { details: String },

    /// No usable access token could be obtained for the call
    #[error("Access token unavailable: {details}")]
    TokenUnavailable { details: String, retryable: bool },
}

/// Classification of upstream errors for retry handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying cannot help (bad request, revoked grant, misconfiguration)
    Permanent,
    /// Temporary failure (network, 5xx)
    Transient,
    /// Provider throttling; retry after the hinted delay
    RateLimited,
}

impl ConnectorError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            ConnectorError::RateLimited { .. } => ErrorClass::RateLimited,
            ConnectorError::Http { status, .. } if *status == 429 => ErrorClass::RateLimited,
            ConnectorError::Http { status, .. } if *status >= 500 => ErrorClass::Transient,
            ConnectorError::Http { .. } => ErrorClass::Permanent,
            ConnectorError::Network { retryable, .. }
            | ConnectorError::TokenUnavailable { retryable, .. } => {
                if *retryable {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            // A 2xx that fails to decode may already have spent a refresh token.
            ConnectorError::MalformedResponse { .. }
            | ConnectorError::Authentication { .. }
            | ConnectorError::Configuration { .. } => ErrorClass::Permanent,
        }
    }

    /// Provider-supplied delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ConnectorError::RateLimited {
                retry_after: Some(seconds),
            } => Some(Duration::from_secs(*seconds)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify() != ErrorClass::Permanent
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ConnectorError::MalformedResponse {
                details: err.to_string(),
            };
        }
        ConnectorError::Network {
            details: err.to_string(),
            retryable: err.is_timeout() || err.is_connect() || err.is_request(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let not_found = ConnectorError::Http {
            status: 404,
            body: None,
        };
        assert_eq!(not_found.classify(), ErrorClass::Permanent);

        let unavailable = ConnectorError::Http {
            status: 503,
            body: Some("maintenance".to_string()),
        };
        assert_eq!(unavailable.classify(), ErrorClass::Transient);

        let throttled = ConnectorError::Http {
            status: 429,
            body: None,
        };
        assert_eq!(throttled.classify(), ErrorClass::RateLimited);

        let dropped = ConnectorError::Network {
            details: "connection reset".to_string(),
            retryable: true,
        };
        assert!(dropped.is_retryable());

        let revoked = ConnectorError::Authentication {
            details: "invalid_grant".to_string(),
        };
        assert!(!revoked.is_retryable());

        let undecodable = ConnectorError::MalformedResponse {
            details: "missing field `access_token`".to_string(),
        };
        assert_eq!(undecodable.classify(), ErrorClass::Permanent);
    }

    #[test]
    fn test_retry_after_hint() {
        let err = ConnectorError::RateLimited {
            retry_after: Some(10),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(10)));
        assert_eq!(err.to_string(), "Rate limit exceeded (retry after: 10s)");

        let no_hint = ConnectorError::RateLimited { retry_after: None };
        assert_eq!(no_hint.retry_after(), None);
        assert_eq!(no_hint.to_string(), "Rate limit exceeded");
    }

    #[test]
    fn test_http_display() {
        let err = ConnectorError::Http {
            status: 400,
            body: None,
        };
        assert_eq!(err.to_string(), "HTTP error 400: No body");
    }
}
