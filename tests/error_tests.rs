// SPDX-License-Identifier: MIT

//! Error surface tests: every failure leaves the client with a stable
//! machine-readable code and a message that never echoes raw input or
//! vendor internals.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use tower::ServiceExt;

mod common;

fn post_json(uri: &str, session_cookie: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(session_id) = session_cookie {
        builder = builder.header(
            header::COOKIE,
            format!("focusflow_session={}", session_id),
        );
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_invalid_phone_error_shape() {
    let (app, _state) = common::create_test_app();

    let response = app
        .oneshot(post_json(
            "/auth/otp/send",
            None,
            serde_json::json!({"phone": "not a phone"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = common::body_json(response).await;
    assert_eq!(json["error"], "invalid_phone");
    // Friendly message, not the raw input
    let details = json["details"].as_str().unwrap();
    assert!(!details.contains("not a phone"));
}

#[tokio::test]
async fn test_wrong_code_error_shape() {
    let (app, _state) = common::create_test_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/send",
            None,
            serde_json::json!({"phone": "+15556660001"}),
        ))
        .await
        .unwrap();
    let session_id = common::cookie_value(&response, "focusflow_session").unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/verify",
            Some(&session_id),
            serde_json::json!({"code": "999999"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = common::body_json(response).await;
    assert_eq!(json["error"], "invalid_code");
}

#[tokio::test]
async fn test_expired_code_error_shape() {
    let (app, state) = common::create_test_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/send",
            None,
            serde_json::json!({"phone": "+15556660002"}),
        ))
        .await
        .unwrap();
    let session_id = common::cookie_value(&response, "focusflow_session").unwrap();

    let context = state.sessions.get(&session_id).unwrap();
    let handle = context.pending_verification().unwrap().confirmation_handle;
    let code = state.provider.mock_issued_code(&handle).unwrap();
    state.provider.mock_expire_pending(&handle);

    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/verify",
            Some(&session_id),
            serde_json::json!({"code": code}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = common::body_json(response).await;
    assert_eq!(json["error"], "expired_code");
}

#[tokio::test]
async fn test_unknown_oauth_provider_rejected() {
    let (app, _state) = common::create_test_app();

    for uri in ["/auth/oauth/facebook", "/auth/oauth/phone"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri: {}", uri);
    }
}

#[tokio::test]
async fn test_non_link_url_rejected_as_invalid_input() {
    let (app, _state) = common::create_test_app();

    let response = app
        .oneshot(post_json(
            "/auth/magic-link/complete",
            None,
            serde_json::json!({
                "email": "ada@example.com",
                "link_url": "https://app.example.com/pricing"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = common::body_json(response).await;
    assert_eq!(json["error"], "invalid_input");
}

#[tokio::test]
async fn test_store_failure_surfaces_as_database_error() {
    let (app, state) = common::create_test_app();
    let token = focusflow_auth::middleware::auth::create_jwt(
        "user-123",
        &state.config.jwt_signing_key,
    )
    .unwrap();

    // Offline store: the profile lookup fails server-side, not as an
    // auth problem
    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/me")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let json = common::body_json(response).await;
    assert_eq!(json["error"], "database_error");
}
