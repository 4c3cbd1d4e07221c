//! End-to-end tests for the capture middleware.
//!
//! Each test runs a real axum router wrapped in the capture layer and
//! points the warehouse client at a mock backend, then drives a request
//! through and verifies the row that arrives (or doesn't).

use axum::body::Body;
use axum::extract::Extension;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use web_analytics::{
    anonymize, AnalyticsConfig, AnalyticsPipeline, BigQueryClient, CaptureLayer,
    EndpointRateLimiter, EventFeature, OriginalRequest, RequestInfo, StaticClientProvider,
};

const INSERT_PATH: &str = "/bigquery/v2/projects/proj/datasets/analytics/tables/events/insertAll";

fn test_config() -> AnalyticsConfig {
    let mut config = AnalyticsConfig::new("test", "analytics");
    config.namespace = Some("test-app".into());
    config
}

fn pipeline_for(server: &ServerGuard, config: AnalyticsConfig) -> Arc<AnalyticsPipeline> {
    let client = BigQueryClient::with_base_url("proj", "token-1", server.url());
    Arc::new(AnalyticsPipeline::new(
        config,
        Arc::new(StaticClientProvider::new(Some(client))),
    ))
}

fn header_user_id_resolver(config: &mut AnalyticsConfig) {
    config.user_id_resolver = Some(Arc::new(|info: &RequestInfo| {
        info.headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }));
}

/// The insert runs on a spawned completion task, so tests poll the mock
/// until it has been hit.
async fn wait_for(mock: &Mock) {
    for _ in 0..250 {
        if mock.matched_async().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Grace period for asserting that no row was delivered.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn captures_request_and_response_fields() {
    let mut server = Server::new_async().await;
    let insert = server
        .mock("POST", INSERT_PATH)
        .match_header("authorization", "Bearer token-1")
        .match_body(Matcher::PartialJson(json!({
            "rows": [{ "json": {
                "event_type": "web_request",
                "environment": "test",
                "namespace": "test-app",
                "user_id": "user-123",
                "request_method": "GET",
                "request_path": "/test",
                "request_user_agent": "test-agent",
                "request_referer": "https://example.com/",
                "request_query": [
                    { "key": "foo", "value": ["42"] },
                    { "key": "bar", "value": ["69"] },
                ],
                "response_status": "200",
            }}]
        })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let mut config = test_config();
    header_user_id_resolver(&mut config);
    let app = Router::new()
        .route("/test", get(|| async { "hello" }))
        .layer(CaptureLayer::new(pipeline_for(&server, config)));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/test?foo=42&bar=69")
                .header("user-agent", "test-agent")
                .header("referer", "https://example.com/")
                .header("x-user-id", "user-123")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    wait_for(&insert).await;
    insert.assert_async().await;
}

#[tokio::test]
async fn pseudonymizes_resolved_user_ids() {
    let mut server = Server::new_async().await;
    let insert = server
        .mock("POST", INSERT_PATH)
        .match_body(Matcher::PartialJson(json!({
            "rows": [{ "json": { "user_id": anonymize("user-123") } }]
        })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let mut config = test_config();
    header_user_id_resolver(&mut config);
    config.pseudonymize_user_id = true;
    let app = Router::new()
        .route("/test", get(|| async { "hello" }))
        .layer(CaptureLayer::new(pipeline_for(&server, config)));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/test")
                .header("x-user-id", "user-123")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    wait_for(&insert).await;
    insert.assert_async().await;
}

#[tokio::test]
async fn handlers_can_enrich_the_event_through_the_feature() {
    let mut server = Server::new_async().await;
    let insert = server
        .mock("POST", INSERT_PATH)
        .match_body(Matcher::PartialJson(json!({
            "rows": [{ "json": {
                "data": [{ "key": "hello", "value": ["world"] }],
                "event_tags": ["smoke"],
            }}]
        })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    async fn tagging_handler(Extension(feature): Extension<EventFeature>) -> &'static str {
        feature.with_event(|event| {
            event.add_data("hello", "world").expect("unique key");
            event.add_tag("smoke");
        });
        "ok"
    }

    let app = Router::new()
        .route("/test", get(tagging_handler))
        .layer(CaptureLayer::new(pipeline_for(&server, test_config())));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/test")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    wait_for(&insert).await;
    insert.assert_async().await;
}

#[tokio::test]
async fn ignored_events_are_never_delivered() {
    let mut server = Server::new_async().await;
    let insert = server
        .mock("POST", INSERT_PATH)
        .expect(0)
        .create_async()
        .await;

    async fn ignoring_handler(Extension(feature): Extension<EventFeature>) -> &'static str {
        feature.ignore().expect("not yet sent");
        "ok"
    }

    let app = Router::new()
        .route("/test", get(ignoring_handler))
        .layer(CaptureLayer::new(pipeline_for(&server, test_config())));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/test")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    settle().await;
    insert.assert_async().await;
}

#[tokio::test]
async fn filtered_requests_are_never_delivered() {
    let mut server = Server::new_async().await;
    let insert = server
        .mock("POST", INSERT_PATH)
        .expect(0)
        .create_async()
        .await;

    let mut config = test_config();
    config.request_filter = Some(Arc::new(|info: &RequestInfo| info.path != "/health"));
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .layer(CaptureLayer::new(pipeline_for(&server, config)));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    settle().await;
    insert.assert_async().await;
}

#[tokio::test]
async fn admission_control_drops_over_budget_events() {
    let mut server = Server::new_async().await;
    let insert = server
        .mock("POST", INSERT_PATH)
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let client = BigQueryClient::with_base_url("proj", "token-1", server.url());
    let pipeline = Arc::new(
        AnalyticsPipeline::new(
            test_config(),
            Arc::new(StaticClientProvider::new(Some(client))),
        )
        .with_admission_controller(Arc::new(EndpointRateLimiter::new(Duration::from_secs(
            3_600,
        )))),
    );
    let app = Router::new()
        .route("/test", get(|| async { "hello" }))
        .layer(CaptureLayer::new(pipeline));

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/test")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    wait_for(&insert).await;
    settle().await;
    insert.assert_async().await;
}

#[tokio::test]
async fn restores_original_path_query_and_status_after_re_execution() {
    let mut server = Server::new_async().await;
    let insert = server
        .mock("POST", INSERT_PATH)
        .match_body(Matcher::PartialJson(json!({
            "rows": [{ "json": {
                "request_path": "/original",
                "request_query": [{ "key": "x", "value": ["1"] }],
                "response_status": "404",
            }}]
        })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    // Models an error handler that re-executed the request against an
    // error route and recorded what the client actually asked for.
    async fn error_page() -> (StatusCode, Extension<OriginalRequest>, &'static str) {
        (
            StatusCode::OK,
            Extension(OriginalRequest {
                path: "/original".into(),
                raw_query: Some("x=1".into()),
                status: Some(404),
            }),
            "not found",
        )
    }

    let mut config = test_config();
    config.restore_original_path_and_query = true;
    config.restore_original_status_code = true;
    let app = Router::new()
        .route("/error", get(error_page))
        .layer(CaptureLayer::new(pipeline_for(&server, config)));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/error")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    wait_for(&insert).await;
    insert.assert_async().await;
}
