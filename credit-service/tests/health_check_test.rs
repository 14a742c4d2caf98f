//! HTTP health, readiness and metrics tests for credit-service.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::TestApp;
use credit_service::startup::router;
use tower::ServiceExt;

#[tokio::test]
async fn test_health_check_works() {
    let app = TestApp::spawn();

    let response = router(app.state.clone())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "credit-service");
}

#[tokio::test]
async fn test_readiness_check_works() {
    let app = TestApp::spawn();

    let response = router(app.state.clone())
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_engine_counters() {
    let app = TestApp::spawn();
    let account = app.enroll(credit_service::models::AccountType::Standard, false).await;
    app.grant(account.account_id, "10.0", 30).await;
    app.tick().await;

    let response = router(app.state.clone())
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("credit_reconciliation_ticks_total"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let app = TestApp::spawn();

    let response = router(app.state.clone())
        .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_request_id_is_echoed_or_generated() {
    let app = TestApp::spawn();

    let response = router(app.state.clone())
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "req-7")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-7");

    let response = router(app.state.clone())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let generated = response.headers()["x-request-id"].to_str().unwrap();
    assert!(uuid::Uuid::parse_str(generated).is_ok());
}
