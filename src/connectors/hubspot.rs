//! HubSpot CRM connector
//!
//! Search over `POST /crm/v3/objects/{object}/search` and OAuth refresh over
//! `POST /oauth/v1/token`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use url::Url;

use crate::connectors::AccessTokenSource;
use crate::error::ConnectorError;
use crate::pagination::{PageCursor, SearchPage, SearchRow, SearchSource, SearchWindow};
use crate::token_refresh::{ClientCredentials, TokenEndpoint, TokenGrant};

pub const HUBSPOT_PROVIDER_SLUG: &str = "hubspot";

const USER_AGENT: &str = "ingestion/0.1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One CRM object returned by the search endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubSpotRecord {
    pub id: String,
    pub properties: Map<String, Value>,
    pub sort_value: DateTime<Utc>,
}

impl SearchRow for HubSpotRecord {
    fn row_id(&self) -> &str {
        &self.id
    }

    fn sort_value(&self) -> DateTime<Utc> {
        self.sort_value
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<RawRecord>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    id: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
struct NextPage {
    after: String,
}

fn build_client() -> Result<reqwest::Client, ConnectorError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ConnectorError::Configuration {
            details: format!("failed to build HTTP client: {}", e),
        })
}

fn parse_base_url(base: &str) -> Result<String, ConnectorError> {
    let url = Url::parse(base).map_err(|e| ConnectorError::Configuration {
        details: format!("invalid HubSpot base URL '{}': {}", base, e),
    })?;
    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// Parses a HubSpot timestamp property: RFC 3339 or epoch milliseconds.
fn parse_sort_value(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                s.parse::<i64>()
                    .ok()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            }),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Maps a non-success response to a [`ConnectorError`].
async fn error_from_response(response: Response) -> ConnectorError {
    let status = response.status();
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok());
            warn!(?retry_after, "Rate limited by HubSpot");
            ConnectorError::RateLimited { retry_after }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            let body = response.text().await.unwrap_or_default();
            ConnectorError::Authentication {
                details: format!("HubSpot returned {}: {}", status.as_u16(), body),
            }
        }
        _ => {
            let body = response.text().await.ok().filter(|b| !b.is_empty());
            ConnectorError::Http {
                status: status.as_u16(),
                body,
            }
        }
    }
}

/// Search endpoint for one CRM object type
#[derive(Clone)]
pub struct HubSpotSearchSource {
    client: reqwest::Client,
    api_base: String,
    object_type: String,
    properties: Vec<String>,
    page_limit: u64,
    token: Arc<dyn AccessTokenSource>,
}

impl HubSpotSearchSource {
    pub fn new(
        api_base: &str,
        object_type: impl Into<String>,
        properties: Vec<String>,
        page_limit: u64,
        token: Arc<dyn AccessTokenSource>,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            client: build_client()?,
            api_base: parse_base_url(api_base)?,
            object_type: object_type.into(),
            properties,
            page_limit,
            token,
        })
    }

    fn search_body(&self, window: &SearchWindow, cursor: Option<&PageCursor>) -> Value {
        let mut properties = self.properties.clone();
        if !properties.contains(&window.sort_field) {
            properties.push(window.sort_field.clone());
        }

        let mut body = json!({
            "filterGroups": [{
                "filters": [
                    {
                        "propertyName": window.sort_field,
                        "operator": "GTE",
                        "value": window.start.timestamp_millis().to_string(),
                    },
                    {
                        "propertyName": window.sort_field,
                        "operator": "LT",
                        "value": window.end.timestamp_millis().to_string(),
                    },
                ],
            }],
            "sorts": [{
                "propertyName": window.sort_field,
                "direction": "ASCENDING",
            }],
            "properties": properties,
            "limit": self.page_limit,
        });

        if let Some(cursor) = cursor {
            body["after"] = Value::String(cursor.to_string());
        }
        body
    }

    fn to_record(
        &self,
        raw: RawRecord,
        sort_field: &str,
    ) -> Result<HubSpotRecord, ConnectorError> {
        let sort_value = raw
            .properties
            .get(sort_field)
            .and_then(parse_sort_value)
            .ok_or_else(|| ConnectorError::MalformedResponse {
                details: format!(
                    "{} {} has no parseable '{}' property",
                    self.object_type, raw.id, sort_field
                ),
            })?;

        Ok(HubSpotRecord {
            id: raw.id,
            properties: raw.properties,
            sort_value,
        })
    }
}

#[async_trait]
impl SearchSource for HubSpotSearchSource {
    type Row = HubSpotRecord;
    type Error = ConnectorError;

    async fn fetch_page(
        &self,
        window: &SearchWindow,
        cursor: Option<&PageCursor>,
    ) -> Result<SearchPage<HubSpotRecord>, ConnectorError> {
        let token = self.token.access_token().await?;
        let url = format!(
            "{}/crm/v3/objects/{}/search",
            self.api_base, self.object_type
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&self.search_body(window, cursor))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let parsed: SearchResponse = response.json().await?;

        let next_cursor = match parsed.paging.and_then(|p| p.next) {
            Some(next) => Some(next.after.parse::<u64>().map(PageCursor::new).map_err(|_| {
                ConnectorError::MalformedResponse {
                    details: format!("non-numeric paging cursor '{}'", next.after),
                }
            })?),
            None => None,
        };

        let results = parsed
            .results
            .into_iter()
            .map(|raw| self.to_record(raw, &window.sort_field))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            object_type = %self.object_type,
            rows = results.len(),
            cursor = ?cursor,
            next_cursor = ?next_cursor,
            "Fetched HubSpot search page"
        );

        Ok(SearchPage {
            results,
            next_cursor,
        })
    }
}

/// HubSpot OAuth token endpoint
#[derive(Clone)]
pub struct HubSpotTokenEndpoint {
    client: reqwest::Client,
    oauth_base: String,
}

impl HubSpotTokenEndpoint {
    pub fn new(oauth_base: &str) -> Result<Self, ConnectorError> {
        Ok(Self {
            client: build_client()?,
            oauth_base: parse_base_url(oauth_base)?,
        })
    }
}

#[async_trait]
impl TokenEndpoint for HubSpotTokenEndpoint {
    async fn refresh(
        &self,
        refresh_token: &str,
        credentials: &ClientCredentials,
    ) -> Result<TokenGrant, ConnectorError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .client
            .post(format!("{}/oauth/v1/token", self.oauth_base))
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let grant: TokenGrant = response.json().await?;
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::StaticAccessToken;

    fn source() -> HubSpotSearchSource {
        HubSpotSearchSource::new(
            "https://api.hubapi.com/",
            "contacts",
            vec!["email".to_string()],
            100,
            Arc::new(StaticAccessToken::new("token")),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_sort_value_formats() {
        let iso = parse_sort_value(&json!("2024-03-01T12:00:00.123Z")).unwrap();
        assert_eq!(iso.timestamp_millis(), 1_709_294_400_123);

        let millis = parse_sort_value(&json!("1709294400123")).unwrap();
        assert_eq!(millis, iso);

        let number = parse_sort_value(&json!(1_709_294_400_123_i64)).unwrap();
        assert_eq!(number, iso);

        assert!(parse_sort_value(&json!("yesterday")).is_none());
        assert!(parse_sort_value(&Value::Null).is_none());
    }

    #[test]
    fn test_search_body_shape() {
        let source = source();
        let window = SearchWindow::new(
            Utc.timestamp_millis_opt(1_000).unwrap(),
            Utc.timestamp_millis_opt(5_000).unwrap(),
            "hs_lastmodifieddate",
        );

        let first = source.search_body(&window, None);
        assert!(first.get("after").is_none());
        assert_eq!(first["limit"], json!(100));
        assert_eq!(first["sorts"][0]["direction"], json!("ASCENDING"));
        assert_eq!(first["filterGroups"][0]["filters"][0]["value"], json!("1000"));
        assert_eq!(first["filterGroups"][0]["filters"][1]["operator"], json!("LT"));
        assert_eq!(
            first["properties"],
            json!(["email", "hs_lastmodifieddate"])
        );

        let next = source.search_body(&window, Some(&PageCursor::new(200)));
        assert_eq!(next["after"], json!("200"));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let result = HubSpotTokenEndpoint::new("not a url");
        assert!(matches!(result, Err(ConnectorError::Configuration { .. })));
    }
}
