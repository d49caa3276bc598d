//! Common test utilities and helpers

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use bioid::database::{self, Profile};
use bioid::{AppContext, BioIdConfig};
use serde_json::Value;

pub const TEST_SECRET: &str = "test-secret-that-is-at-least-32-characters";

pub fn test_config() -> BioIdConfig {
    BioIdConfig::builder()
        .app_name("test-app")
        .database_url("sqlite::memory:")
        .jwt_secret(TEST_SECRET)
        .build()
}

/// Create a test context backed by an in-memory database
pub async fn test_context() -> AppContext {
    AppContext::new(test_config()).await.unwrap()
}

pub async fn context_with(config: BioIdConfig) -> AppContext {
    AppContext::new(config).await.unwrap()
}

pub fn sample_profile() -> Profile {
    Profile {
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        document_type: "passport".to_string(),
        document_number: "X1234567".to_string(),
        nationality: "GB".to_string(),
        residence: "London".to_string(),
        birthdate: "1815-12-10".to_string(),
        company_name: String::new(),
    }
}

/// Insert a user that looks enrolled, bypassing the ceremony
pub async fn enrolled_user(ctx: &AppContext, user_id: &str, bioid_hash: &str) {
    database::ensure_user(&ctx.db, user_id, user_id).await.unwrap();
    database::insert_credential(&ctx.db, user_id, &format!("cred-{}", user_id), "{}", 0)
        .await
        .unwrap();
    database::complete_enrollment(&ctx.db, user_id, bioid_hash, &sample_profile())
        .await
        .unwrap();
}

/// Audit log entries for a user as (event_type, ip_address), newest first
pub async fn audit_events(ctx: &AppContext, user_id: &str) -> Vec<(String, Option<String>)> {
    sqlx::query_as("SELECT event_type, ip_address FROM auth_log WHERE user_id = ?1 ORDER BY id DESC")
        .bind(user_id)
        .fetch_all(&ctx.db)
        .await
        .unwrap()
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Assert that a result is an error matching a pattern
#[macro_export]
macro_rules! assert_error_matches {
    ($result:expr, $pattern:pat) => {
        match $result {
            Err($pattern) => (),
            Err(e) => panic!("Expected error matching {}, got {:?}", stringify!($pattern), e),
            Ok(_) => panic!("Expected error, got Ok"),
        }
    };
}
