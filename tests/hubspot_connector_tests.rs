//! HubSpot connector tests against a mock CRM API.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures::TryStreamExt;
use ingestion::config::TokenRefreshConfig;
use ingestion::connectors::{
    HubSpotSearchSource, HubSpotTokenEndpoint, StaticAccessToken, TenantAccessToken,
};
use ingestion::error::ConnectorError;
use ingestion::pagination::{
    PageCursor, PaginationLimits, SearchPaginator, SearchSource, SearchWindow,
};
use ingestion::retry::{RetryPolicy, Retrying};
use ingestion::token_refresh::{
    ClientCredentials, TokenEndpoint, TokenRecord, TokenRefreshCoordinator,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string_contains, header, method, path},
};

mod test_utils;
use test_utils::{setup_file_db, test_secret_store};

const SEARCH_PATH: &str = "/crm/v3/objects/contacts/search";
const SORT_FIELD: &str = "hs_lastmodifieddate";

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

fn window(start_ms: i64, end_ms: i64) -> SearchWindow {
    SearchWindow::new(at(start_ms), at(end_ms), SORT_FIELD)
}

fn source(server: &MockServer, token: &str) -> HubSpotSearchSource {
    HubSpotSearchSource::new(
        &server.uri(),
        "contacts",
        vec!["email".to_string()],
        2,
        Arc::new(StaticAccessToken::new(token)),
    )
    .expect("valid mock url")
}

fn contact(id: &str, modified_ms: i64) -> serde_json::Value {
    json!({
        "id": id,
        "properties": {
            "email": format!("{}@example.com", id),
            "hs_lastmodifieddate": at(modified_ms).to_rfc3339(),
        },
        "createdAt": "2024-01-01T00:00:00Z",
        "archived": false
    })
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        jitter_factor: 0.0,
        max_attempts: 3,
    }
}

#[tokio::test]
async fn test_search_request_shape_and_paging() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .and(header("authorization", "Bearer private-app"))
        .and(body_string_contains(r#""operator":"GTE""#))
        .and(body_string_contains(r#""value":"1000""#))
        .and(body_string_contains(r#""value":"9000""#))
        .and(body_string_contains(r#""after":"2""#))
        .and(body_string_contains(r#""limit":2"#))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total": 5,
            "results": [contact("3", 3_000), contact("4", 4_000)],
            "paging": { "next": { "after": "4", "link": "ignored" } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = source(&server, "private-app")
        .fetch_page(&window(1_000, 9_000), Some(&PageCursor::new(2)))
        .await
        .unwrap();

    assert_eq!(page.next_cursor, Some(PageCursor::new(4)));
    let ids: Vec<&str> = page.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["3", "4"]);
    assert_eq!(page.results[0].sort_value, at(3_000));
    assert_eq!(page.results[1].properties["email"], json!("4@example.com"));
    server.verify().await;
}

#[tokio::test]
async fn test_last_page_has_no_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total": 1,
            "results": [contact("1", 1_500)]
        })))
        .mount(&server)
        .await;

    let page = source(&server, "t")
        .fetch_page(&window(1_000, 9_000), None)
        .await
        .unwrap();

    assert_eq!(page.results.len(), 1);
    assert!(page.next_cursor.is_none());
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "7")
                .set_body_json(json!({"status": "error", "category": "RATE_LIMITS"})),
        )
        .mount(&server)
        .await;

    let err = source(&server, "t")
        .fetch_page(&window(0, 1_000), None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConnectorError::RateLimited {
            retry_after: Some(7)
        }
    ));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn test_unauthorized_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "status": "error",
            "category": "EXPIRED_AUTHENTICATION"
        })))
        .mount(&server)
        .await;

    let err = source(&server, "stale")
        .fetch_page(&window(0, 1_000), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectorError::Authentication { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_non_numeric_cursor_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [contact("1", 10)],
            "paging": { "next": { "after": "opaque-token" } }
        })))
        .mount(&server)
        .await;

    let err = source(&server, "t")
        .fetch_page(&window(0, 1_000), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectorError::MalformedResponse { .. }));
}

#[tokio::test]
async fn test_missing_sort_property_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "id": "9", "properties": { "email": "x@example.com" } }]
        })))
        .mount(&server)
        .await;

    let err = source(&server, "t")
        .fetch_page(&window(0, 1_000), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectorError::MalformedResponse { .. }));
}

#[tokio::test]
async fn test_paginator_slides_window_and_filters_boundary_rows() {
    let server = MockServer::start().await;

    // First window, first page: cursor 2 hits the ceiling (max 4, limit 2).
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .and(body_string_contains(r#""value":"1000""#))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [contact("a", 1_000), contact("b", 2_000)],
            "paging": { "next": { "after": "2" } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Slid window starts one millisecond after b and sees b again.
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .and(body_string_contains(r#""value":"2001""#))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [contact("b", 2_001), contact("c", 3_000)]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let limits = PaginationLimits {
        max_offset: 4,
        page_limit: 2,
    };
    let mut paginator =
        SearchPaginator::new(source(&server, "t"), window(1_000, 60_000), limits);

    let first = paginator.next_page().await.unwrap().unwrap();
    assert_eq!(paginator.window().start, at(2_001));
    assert_eq!(paginator.window().end, at(60_000));
    let second = paginator.next_page().await.unwrap().unwrap();
    assert!(paginator.next_page().await.unwrap().is_none());

    let first_ids: Vec<&str> = first.iter().map(|r| r.id.as_str()).collect();
    let second_ids: Vec<&str> = second.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(first_ids, vec!["a", "b"]);
    assert_eq!(second_ids, vec!["c"]);

    let stats = paginator.stats();
    assert_eq!(stats.pages_fetched, 2);
    assert_eq!(stats.window_slides, 1);
    assert_eq!(stats.duplicates_filtered, 1);
    server.verify().await;
}

#[tokio::test]
async fn test_retrying_source_recovers_from_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [contact("1", 100), contact("2", 200)]
        })))
        .mount(&server)
        .await;

    let retrying = Retrying::new(source(&server, "t"), fast_retries());
    let rows: Vec<_> = SearchPaginator::new(
        retrying,
        window(0, 1_000),
        PaginationLimits {
            max_offset: 10_000,
            page_limit: 2,
        },
    )
    .into_stream()
    .try_collect()
    .await
    .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].len(), 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_retrying_source_does_not_retry_client_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "status": "error",
            "category": "VALIDATION_ERROR"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let retrying = Retrying::new(source(&server, "t"), fast_retries());
    let err = retrying
        .fetch_page(&window(0, 1_000), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectorError::Http { status: 400, .. }));
    server.verify().await;
}

#[tokio::test]
async fn test_token_endpoint_posts_refresh_form() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/v1/token"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("client_id=client-1"))
        .and(body_string_contains("client_secret=shh"))
        .and(body_string_contains("refresh_token=rt-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token_type": "bearer",
            "access_token": "at-2",
            "refresh_token": "rt-2",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let endpoint = HubSpotTokenEndpoint::new(&server.uri()).unwrap();
    let credentials = ClientCredentials {
        client_id: "client-1".to_string(),
        client_secret: "shh".to_string(),
    };
    let grant = endpoint.refresh("rt-1", &credentials).await.unwrap();

    assert_eq!(grant.access_token, "at-2");
    assert_eq!(grant.refresh_token.as_deref(), Some("rt-2"));
    assert_eq!(grant.expires_in, 1800);
    server.verify().await;
}

#[tokio::test]
async fn test_search_uses_refreshed_tenant_token() {
    let (_dir, db) = setup_file_db().await.unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/v1/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "refreshed",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .and(header("authorization", "Bearer refreshed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [contact("1", 100)]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let coordinator = Arc::new(TokenRefreshCoordinator::new(
        db,
        test_secret_store(),
        Arc::new(HubSpotTokenEndpoint::new(&server.uri()).unwrap()),
        Some(ClientCredentials {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
        }),
        "hubspot",
        TokenRefreshConfig::default(),
    ));
    let tenant = Uuid::new_v4();
    coordinator
        .store_token(
            tenant,
            &TokenRecord {
                access_token: "expired".to_string(),
                refresh_token: Some("rt".to_string()),
                expires_at: Utc::now() - ChronoDuration::minutes(1),
            },
        )
        .await
        .unwrap();

    let source = HubSpotSearchSource::new(
        &server.uri(),
        "contacts",
        Vec::new(),
        100,
        Arc::new(TenantAccessToken::new(coordinator, tenant)),
    )
    .unwrap();

    // The second request reuses the stored token.
    for _ in 0..2 {
        let page = source.fetch_page(&window(0, 1_000), None).await.unwrap();
        assert_eq!(page.results.len(), 1);
    }
    server.verify().await;
}

#[tokio::test]
async fn test_retrying_token_endpoint_does_not_resend_after_undecodable_grant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/v1/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token_type": "bearer",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let endpoint = Retrying::new(HubSpotTokenEndpoint::new(&server.uri()).unwrap(), fast_retries());
    let credentials = ClientCredentials {
        client_id: "client-1".to_string(),
        client_secret: "shh".to_string(),
    };
    let err = endpoint.refresh("single-use", &credentials).await.unwrap_err();

    assert!(matches!(err, ConnectorError::MalformedResponse { .. }));
    server.verify().await;
}

#[tokio::test]
async fn test_retrying_source_gives_up_on_malformed_page() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "id": "9", "properties": { "email": "x@example.com" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let retrying = Retrying::new(source(&server, "t"), fast_retries());
    let err = retrying
        .fetch_page(&window(0, 1_000), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectorError::MalformedResponse { .. }));
    server.verify().await;
}
