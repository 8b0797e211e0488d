// SPDX-License-Identifier: MIT

//! End-to-end sign-in flow tests against the full router, using the
//! in-memory identity vendor.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use focusflow_auth::models::AuthMethod;
use tower::ServiceExt;

mod common;

fn post_json(uri: &str, session_cookie: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::USER_AGENT, "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)")
        .header(header::ACCEPT_LANGUAGE, "en-US");
    if let Some(session_id) = session_cookie {
        builder = builder.header(
            header::COOKIE,
            format!("focusflow_session={}", session_id),
        );
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_otp_sign_in_happy_path() {
    let (app, state) = common::create_test_app();

    // Send the code
    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/send",
            None,
            serde_json::json!({"phone": "+1 (555) 123-4567"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let session_id = common::cookie_value(&response, "focusflow_session")
        .expect("send should establish a session cookie");
    let body = common::body_json(response).await;

    // The raw phone number never appears in the response
    assert_eq!(body["method"], "phone");
    let masked = body["masked_identifier"].as_str().unwrap();
    assert!(masked.contains('*'));
    assert!(!masked.contains("5551234567"));

    // Fish the issued code out of the mock vendor
    let context = state.sessions.get(&session_id).unwrap();
    let handle = context.pending_verification().unwrap().confirmation_handle;
    let code = state.provider.mock_issued_code(&handle).unwrap();

    // Verify it
    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/verify",
            Some(&session_id),
            serde_json::json!({"code": code}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let token = common::cookie_value(&response, "focusflow_token");
    assert!(token.is_some(), "verify should set the session token cookie");

    let body = common::body_json(response).await;
    assert_eq!(body["user"]["phone"], "+15551234567");
    assert_eq!(body["user"]["providers"][0], "phone");
    assert!(body["token"].as_str().unwrap().contains('.'));
}

#[tokio::test]
async fn test_otp_wrong_code_rejected() {
    let (app, state) = common::create_test_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/send",
            None,
            serde_json::json!({"phone": "+15551230001"}),
        ))
        .await
        .unwrap();
    let session_id = common::cookie_value(&response, "focusflow_session").unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/verify",
            Some(&session_id),
            serde_json::json!({"code": "000000"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The session is still signed out
    let context = state.sessions.get(&session_id).unwrap();
    assert!(context.current_user().is_none());
    assert_eq!(context.failed_attempts(), 1);
}

#[tokio::test]
async fn test_otp_invalid_phone_rejected() {
    let (app, _state) = common::create_test_app();

    let response = app
        .oneshot(post_json(
            "/auth/otp/send",
            None,
            serde_json::json!({"phone": "555-1234"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_verify_without_pending_code() {
    let (app, _state) = common::create_test_app();

    let response = app
        .oneshot(post_json(
            "/auth/otp/verify",
            None,
            serde_json::json!({"code": "123456"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_new_sign_in_supersedes_pending_code() {
    let (app, state) = common::create_test_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/send",
            None,
            serde_json::json!({"phone": "+15551230002"}),
        ))
        .await
        .unwrap();
    let session_id = common::cookie_value(&response, "focusflow_session").unwrap();

    let context = state.sessions.get(&session_id).unwrap();
    let first_handle = context.pending_verification().unwrap().confirmation_handle;
    let first_code = state.provider.mock_issued_code(&first_handle).unwrap();

    // Second send on the same session replaces the pending verification
    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/send",
            Some(&session_id),
            serde_json::json!({"phone": "+15551230002"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let second_handle = context.pending_verification().unwrap().confirmation_handle;
    assert_ne!(first_handle, second_handle);

    // The superseded code no longer signs anyone in
    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/verify",
            Some(&session_id),
            serde_json::json!({"code": first_code}),
        ))
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::OK);
    assert!(context.current_user().is_none());

    // The fresh code works
    let second_code = state.provider.mock_issued_code(&second_handle).unwrap();
    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/verify",
            Some(&session_id),
            serde_json::json!({"code": second_code}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_slow_verification_loses_to_newer_sign_in() {
    let (_app, state) = common::create_test_app();
    let context = state.sessions.get_or_create("s1").await;

    context
        .start_sign_in(AuthMethod::Phone, Some("+15551230005"), None)
        .await
        .unwrap();
    let first_handle = context.pending_verification().unwrap().confirmation_handle;
    let first_code = state.provider.mock_issued_code(&first_handle).unwrap();

    // The first attempt's result stalls at the vendor
    state.provider.mock_delay_verification(200);
    let slow = tokio::spawn({
        let context = context.clone();
        async move { context.verify(&first_code).await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // A newer sign-in starts while that result is still in flight
    state.provider.mock_delay_verification(0);
    context
        .start_sign_in(AuthMethod::Phone, Some("+15551230006"), None)
        .await
        .unwrap();

    // The late success is discarded, not applied
    let late = slow.await.unwrap();
    assert_eq!(
        late.unwrap_err().code,
        focusflow_auth::error::AuthErrorCode::ExpiredCode
    );
    assert!(context.current_user().is_none());

    // The newer attempt still completes normally
    let handle = context.pending_verification().unwrap().confirmation_handle;
    let code = state.provider.mock_issued_code(&handle).unwrap();
    let user = context.verify(&code).await.unwrap();
    assert_eq!(user.phone.as_deref(), Some("+15551230006"));
}

#[tokio::test]
async fn test_magic_link_same_device() {
    let (app, state) = common::create_test_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/magic-link/send",
            None,
            serde_json::json!({"email": "ada@example.com"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = common::cookie_value(&response, "focusflow_session").unwrap();

    let body = common::body_json(response).await;
    assert_eq!(body["method"], "email");
    assert!(!body["masked_identifier"].as_str().unwrap().contains("ada@"));

    let link = state.provider.mock_magic_link("ada@example.com").unwrap();

    // Same device: email comes from the session marker
    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/magic-link/complete",
            Some(&session_id),
            serde_json::json!({"link_url": link}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = common::body_json(response).await;
    assert_eq!(body["user"]["email"], "ada@example.com");
}

#[tokio::test]
async fn test_magic_link_cross_device_requires_email() {
    let (app, state) = common::create_test_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/magic-link/send",
            None,
            serde_json::json!({"email": "grace@example.com"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let link = state.provider.mock_magic_link("grace@example.com").unwrap();

    // A different device has no pending-email marker
    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/magic-link/complete",
            None,
            serde_json::json!({"link_url": link}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Re-supplying the email completes the sign-in
    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/magic-link/complete",
            None,
            serde_json::json!({"link_url": link, "email": "grace@example.com"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_logout_is_idempotent() {
    let (app, state) = common::create_test_app();

    // Sign in first
    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/send",
            None,
            serde_json::json!({"phone": "+15551230003"}),
        ))
        .await
        .unwrap();
    let session_id = common::cookie_value(&response, "focusflow_session").unwrap();

    let context = state.sessions.get(&session_id).unwrap();
    let handle = context.pending_verification().unwrap().confirmation_handle;
    let code = state.provider.mock_issued_code(&handle).unwrap();

    app.clone()
        .oneshot(post_json(
            "/auth/otp/verify",
            Some(&session_id),
            serde_json::json!({"code": code}),
        ))
        .await
        .unwrap();
    assert!(context.current_user().is_some());

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json(
                "/auth/logout",
                Some(&session_id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert!(context.current_user().is_none());
}

#[tokio::test]
async fn test_refresh_reports_expired_session_without_erroring() {
    let (app, state) = common::create_test_app();

    // Refresh with no session at all is a quiet no
    let response = app
        .clone()
        .oneshot(post_json("/auth/refresh", None, serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = common::body_json(response).await;
    assert_eq!(body["active"], false);

    // Sign in, then refresh while the vendor session is live
    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/otp/send",
            None,
            serde_json::json!({"phone": "+15551230004"}),
        ))
        .await
        .unwrap();
    let session_id = common::cookie_value(&response, "focusflow_session").unwrap();

    let context = state.sessions.get(&session_id).unwrap();
    let handle = context.pending_verification().unwrap().confirmation_handle;
    let code = state.provider.mock_issued_code(&handle).unwrap();
    app.clone()
        .oneshot(post_json(
            "/auth/otp/verify",
            Some(&session_id),
            serde_json::json!({"code": code}),
        ))
        .await
        .unwrap();

    let user_id = context.current_user().unwrap().id;

    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/refresh",
            Some(&session_id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = common::body_json(response).await;
    assert_eq!(body["active"], true);

    // Revoke vendor sessions; refresh must degrade, not error
    state.provider.mock_revoke_sessions(&user_id);
    let response = app
        .clone()
        .oneshot(post_json(
            "/auth/refresh",
            Some(&session_id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = common::body_json(response).await;
    assert_eq!(body["active"], false);
    assert!(context.current_user().is_none());
}
