//! Integration tests for the health and metrics endpoints.

use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use hookline_core::metrics::names;
use hookline_testing::TestEnv;
use serde_json::json;
use tower::ServiceExt;

#[tokio::test]
async fn liveness_always_succeeds() {
    let env = TestEnv::new().unwrap();
    let app = env.router();

    let response = app
        .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn readiness_reports_uptime_on_virtual_time() {
    let env = TestEnv::new().unwrap();
    env.clock.advance(Duration::from_secs(42));

    let response = env.call("GET", "/health/ready").await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
    assert_eq!(response.body["uptime_seconds"], 42);
    assert!(response.body["message"].is_string());
}

#[tokio::test]
async fn db_connection_follows_storage() {
    let env = TestEnv::new().unwrap();

    let up = env.call("GET", "/health/db-connection").await.unwrap();
    assert_eq!(up.status, StatusCode::OK);
    assert_eq!(up.body, json!({"ready": true, "db_connection": "connected"}));

    env.store.set_unavailable(true);
    let down = env.call("GET", "/health/db-connection").await.unwrap();
    assert_eq!(down.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(down.body, json!({"ready": false, "db_connection": "disconnected"}));
}

#[tokio::test]
async fn http_requests_are_counted_by_route() {
    let env = TestEnv::new().unwrap();

    env.call("GET", "/health/live").await.unwrap();
    env.call("GET", "/health/live").await.unwrap();
    env.call("GET", "/admin/events/not-a-uuid").await.unwrap();

    assert_eq!(
        env.metrics.counter(names::HTTP_REQUESTS_TOTAL, &[
            ("method", "GET"),
            ("route", "/health/live"),
            ("status", "200"),
        ]),
        2
    );
    assert_eq!(
        env.metrics.counter(names::HTTP_REQUESTS_TOTAL, &[
            ("method", "GET"),
            ("route", "/admin/events/{id}"),
            ("status", "400"),
        ]),
        1
    );

    let scrape = env.call("GET", "/metrics").await.unwrap();
    assert_eq!(scrape.status, StatusCode::OK);
    assert_eq!(scrape.headers["content-type"], "text/plain; version=0.0.4");
    assert!(scrape
        .text
        .lines()
        .any(|l| l.starts_with("http_requests_total{") && l.contains(r#"route="/health/live""#)));
    assert!(scrape.text.contains("http_request_duration_seconds_bucket{"));
}
