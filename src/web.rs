//! HTTP routes

use crate::auth_middleware::require_session;
use crate::bioid::{BioIdError, BioIdService, EnrollStart, EnrollmentStatus};
use crate::database::Profile;
use crate::rate_limit::{presets, rate_limit_middleware, ClientIp};
use crate::security::{security_headers, security_middleware};
use crate::session::Session;
use crate::AppContext;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Extension, Path, State},
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollStartRequest {
    pub user_id: String,
    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollFinishRequest {
    pub user_id: String,
    #[serde(alias = "attResp")]
    pub credential: Value,
    #[serde(default)]
    pub data: Profile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyStartRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyFinishRequest {
    pub user_id: String,
    #[serde(alias = "authResp")]
    pub credential: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub data: Profile,
}

#[derive(Debug, Serialize)]
struct ProfileResponse {
    ok: bool,
    #[serde(flatten)]
    profile: Profile,
}

impl From<JsonRejection> for BioIdError {
    fn from(rejection: JsonRejection) -> Self {
        BioIdError::BadRequest(rejection.body_text())
    }
}

pub fn create_router(context: AppContext) -> Router {
    let config = context.config.clone();

    let ceremonies = Router::new()
        .route("/enroll/start", post(enroll_start))
        .route("/enroll/finish", post(enroll_finish))
        .route("/verify/start", post(verify_start))
        .route("/verify/finish", post(verify_finish))
        .route_layer(middleware::from_fn_with_state(
            presets::ceremony_endpoints(&config),
            rate_limit_middleware,
        ));

    let protected = Router::new()
        .route("/user/update", post(update_user))
        .route_layer(middleware::from_fn_with_state(context.clone(), require_session));

    let api = Router::new()
        .route("/status/{user_id}", get(status))
        .route("/hash/{hash}", get(user_by_hash))
        .merge(ceremonies)
        .merge(protected);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/.well-known/webauthn", get(well_known))
        .nest("/api/bioid", api)
        .layer(security_headers())
        .layer(middleware::from_fn(security_middleware))
        .layer(DefaultBodyLimit::max(config.body_limit_bytes))
        .layer(RequestBodyLimitLayer::new(config.body_limit_bytes))
        .layer(cors_layer(&config.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn well_known(State(context): State<AppContext>) -> Json<Value> {
    let webauthn = &context.config.webauthn;
    Json(json!({
        "rp_id": context.relying_party.rp_id(),
        "name": webauthn.rp_name,
        "description": webauthn.description,
    }))
}

async fn status(
    State(context): State<AppContext>,
    Path(user_id): Path<String>,
) -> Result<Json<EnrollmentStatus>, BioIdError> {
    let status = BioIdService::new(context).status(&user_id).await?;
    Ok(Json(status))
}

async fn enroll_start(
    State(context): State<AppContext>,
    ClientIp(ip): ClientIp,
    payload: Result<Json<EnrollStartRequest>, JsonRejection>,
) -> Result<Json<Value>, BioIdError> {
    let Json(req) = payload?;
    let user_name = req.user_name.unwrap_or_else(|| req.user_id.clone());

    let outcome = BioIdService::new(context)
        .with_client_ip(ip)
        .start_enroll(&req.user_id, &user_name)
        .await?;

    let body = match outcome {
        EnrollStart::AlreadyEnrolled => json!({
            "ok": true,
            "enrolled": true,
            "redirect": "/verify.html",
        }),
        EnrollStart::Challenge(options) => json!({
            "ok": true,
            "next": "webauthn",
            "options": options,
        }),
    };

    Ok(Json(body))
}

async fn enroll_finish(
    State(context): State<AppContext>,
    ClientIp(ip): ClientIp,
    payload: Result<Json<EnrollFinishRequest>, JsonRejection>,
) -> Result<Json<Value>, BioIdError> {
    let Json(req) = payload?;

    let hash = BioIdService::new(context)
        .with_client_ip(ip)
        .finish_enroll(&req.user_id, &req.credential, &req.data)
        .await?;

    Ok(Json(json!({ "ok": true, "bioidHash": hash })))
}

async fn verify_start(
    State(context): State<AppContext>,
    payload: Result<Json<VerifyStartRequest>, JsonRejection>,
) -> Result<Json<Value>, BioIdError> {
    let Json(req) = payload?;

    let options = BioIdService::new(context).start_verify(&req.user_id).await?;

    Ok(Json(json!({ "ok": true, "options": options })))
}

async fn verify_finish(
    State(context): State<AppContext>,
    ClientIp(ip): ClientIp,
    payload: Result<Json<VerifyFinishRequest>, JsonRejection>,
) -> Result<Json<Value>, BioIdError> {
    let Json(req) = payload?;

    let identity = BioIdService::new(context)
        .with_client_ip(ip)
        .finish_verify(&req.user_id, &req.credential)
        .await?;

    Ok(Json(json!({
        "ok": true,
        "bioidHash": identity.bioid_hash,
        "sessionToken": identity.session_token,
        "userVerified": identity.user_verified,
    })))
}

async fn user_by_hash(
    State(context): State<AppContext>,
    Path(hash): Path<String>,
) -> Result<Json<ProfileResponse>, BioIdError> {
    let profile = BioIdService::new(context).profile_by_hash(&hash).await?;
    Ok(Json(ProfileResponse { ok: true, profile }))
}

async fn update_user(
    State(context): State<AppContext>,
    ClientIp(ip): ClientIp,
    Extension(session): Extension<Session>,
    payload: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<Json<Value>, BioIdError> {
    let Json(req) = payload?;

    BioIdService::new(context)
        .with_client_ip(ip)
        .update_profile(&session, &req.user_id, &req.data)
        .await?;

    Ok(Json(json!({ "ok": true })))
}
