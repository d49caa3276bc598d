//! HTTP API behaviour through the full router

use axum::http::StatusCode;
use bioid::database::{self, Ceremony};
use bioid::web::create_router;
use bioid::BioIdConfig;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use tower::ServiceExt;

mod common;

use common::{body_json, get_request, json_request};

#[tokio::test]
async fn test_healthz() {
    let app = create_router(common::test_context().await);

    let response = app.oneshot(get_request("/healthz")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    assert_eq!(body_json(response).await, json!({ "ok": true }));
}

#[tokio::test]
async fn test_well_known_webauthn() {
    let app = create_router(common::test_context().await);

    let response = app.oneshot(get_request("/.well-known/webauthn")).await.unwrap();
    let body = body_json(response).await;

    assert_eq!(body["rp_id"], "localhost");
    assert_eq!(body["name"], "BioID");
}

#[tokio::test]
async fn test_status_of_unknown_and_enrolled_users() {
    let ctx = common::test_context().await;
    common::enrolled_user(&ctx, "enrolled", "feedface").await;
    let app = create_router(ctx);

    let response = app.clone().oneshot(get_request("/api/bioid/status/nobody")).await.unwrap();
    assert_eq!(body_json(response).await, json!({ "enrolled": false, "hash": null }));

    let response = app.oneshot(get_request("/api/bioid/status/enrolled")).await.unwrap();
    assert_eq!(body_json(response).await, json!({ "enrolled": true, "hash": "feedface" }));
}

#[tokio::test]
async fn test_enroll_start_issues_platform_challenge() {
    let ctx = common::test_context().await;
    let app = create_router(ctx.clone());

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/bioid/enroll/start",
            json!({ "userId": "user-1", "userName": "alice" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["next"], "webauthn");

    let options = &body["options"]["publicKey"];
    assert_eq!(options["rp"]["id"], "localhost");
    assert_eq!(options["user"]["name"], "alice");
    assert_eq!(options["authenticatorSelection"]["authenticatorAttachment"], "platform");
    assert!(options["challenge"].as_str().is_some_and(|c| !c.is_empty()));

    // The registration state is parked until the browser answers
    assert!(database::take_challenge(&ctx.db, "user-1", Ceremony::Registration)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_enroll_start_redirects_enrolled_user() {
    let ctx = common::test_context().await;
    common::enrolled_user(&ctx, "user-1", "feedface").await;
    let app = create_router(ctx.clone());

    let response = app
        .oneshot(json_request("POST", "/api/bioid/enroll/start", json!({ "userId": "user-1" })))
        .await
        .unwrap();

    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["redirect"], "/verify.html");
    assert!(body.get("options").is_none());
}

#[tokio::test]
async fn test_enroll_start_requires_user_id() {
    let app = create_router(common::test_context().await);

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/bioid/enroll/start", json!({ "userId": "  " })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(json_request("POST", "/api/bioid/enroll/start", json!({ "userName": "x" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["ok"], false);
}

#[tokio::test]
async fn test_enroll_finish_rejects_forged_attestation_once() {
    let ctx = common::test_context().await;
    let app = create_router(ctx.clone());

    app.clone()
        .oneshot(json_request("POST", "/api/bioid/enroll/start", json!({ "userId": "user-1" })))
        .await
        .unwrap();

    let forged = json!({
        "userId": "user-1",
        "attResp": { "id": "AAAA", "rawId": "AAAA", "type": "public-key" },
        "data": { "firstName": "Mallory" }
    });

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/bioid/enroll/finish", forged.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The challenge was consumed by the failed attempt
    let response = app
        .oneshot(json_request("POST", "/api/bioid/enroll/finish", forged))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "No pending challenge");

    let status = bioid::BioIdService::new(ctx.clone()).status("user-1").await.unwrap();
    assert!(!status.enrolled);

    let events = common::audit_events(&ctx, "user-1").await;
    assert!(events.iter().all(|(event_type, _)| event_type == "enroll_failure"));
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn test_enroll_finish_for_unknown_user() {
    let app = create_router(common::test_context().await);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/bioid/enroll/finish",
            json!({ "userId": "ghost", "credential": {} }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_verify_requires_enrollment() {
    let app = create_router(common::test_context().await);

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/bioid/verify/start", json!({ "userId": "ghost" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/bioid/verify/finish",
            json!({ "userId": "ghost", "authResp": {} }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "User not enrolled");
}

#[tokio::test]
async fn test_verify_finish_without_challenge() {
    let ctx = common::test_context().await;
    common::enrolled_user(&ctx, "user-1", "feedface").await;
    let app = create_router(ctx);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/bioid/verify/finish",
            json!({ "userId": "user-1", "credential": {} }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "No pending challenge");
}

#[tokio::test]
async fn test_profile_by_hash() {
    let ctx = common::test_context().await;
    common::enrolled_user(&ctx, "user-1", "feedface").await;
    let app = create_router(ctx);

    let response = app.clone().oneshot(get_request("/api/bioid/hash/feedface")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["firstName"], "Ada");
    assert_eq!(body["documentNumber"], "X1234567");
    assert_eq!(body["companyName"], "");

    let response = app.oneshot(get_request("/api/bioid/hash/unknown")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await, json!({ "ok": false, "error": "User not found" }));
}

#[tokio::test]
async fn test_update_user_requires_owner_session() {
    let ctx = common::test_context().await;
    common::enrolled_user(&ctx, "user-1", "feedface").await;
    common::enrolled_user(&ctx, "user-2", "deadbeef").await;

    let token = ctx
        .session_manager
        .write()
        .await
        .create_session("user-1", "feedface")
        .unwrap()
        .token;
    let app = create_router(ctx.clone());

    let update = json!({ "userId": "user-1", "data": { "firstName": "Augusta" } });

    // No token
    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/bioid/user/update", update.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Someone else's profile
    let mut request = json_request(
        "POST",
        "/api/bioid/user/update",
        json!({ "userId": "user-2", "data": {} }),
    );
    request
        .headers_mut()
        .insert("authorization", format!("Bearer {}", token).parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Own profile
    let mut request = json_request("POST", "/api/bioid/user/update", update);
    request
        .headers_mut()
        .insert("authorization", format!("Bearer {}", token).parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "ok": true }));

    let user = database::get_user(&ctx.db, "user-1").await.unwrap().unwrap();
    assert_eq!(user.profile.first_name, "Augusta");
    assert_eq!(user.profile.last_name, "");
}

#[tokio::test]
async fn test_malformed_json_is_reported_as_json() {
    let app = create_router(common::test_context().await);

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/bioid/verify/start")
        .header("content-type", "application/json")
        .body(axum::body::Body::from("{not json"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["ok"], false);
}

#[tokio::test]
async fn test_ceremonies_are_rate_limited() {
    let config = BioIdConfig::builder()
        .database_url("sqlite::memory:")
        .jwt_secret(common::TEST_SECRET)
        .rate_limit(2, Duration::from_secs(60))
        .build();
    let app = create_router(common::context_with(config).await);

    let verify = || {
        let mut request =
            json_request("POST", "/api/bioid/verify/start", json!({ "userId": "ghost" }));
        request
            .headers_mut()
            .insert("x-forwarded-for", "203.0.113.7".parse().unwrap());
        request
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(verify()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    let response = app.clone().oneshot(verify()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));

    // Lookups are not throttled
    let response = app.oneshot(get_request("/api/bioid/status/ghost")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
