//! Core enrollment and verification logic

use crate::database::{self, AuthEvent, Ceremony, Profile, User};
use crate::session::Session;
use crate::webauthn::{bioid_hash, decode_passkey, encode_credential_id};
use crate::AppContext;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use webauthn_rs::prelude::{
    CreationChallengeResponse, Passkey, RequestChallengeResponse, WebauthnError,
};

#[derive(Error, Debug)]
pub enum BioIdError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("User not enrolled")]
    NotEnrolled,

    #[error("User already enrolled")]
    AlreadyEnrolled,

    #[error("No pending challenge")]
    ChallengeMissing,

    #[error("Challenge expired")]
    ChallengeExpired,

    #[error("Signature counter went from {stored} to {received}; credential may be cloned")]
    CounterRegression { stored: u32, received: u32 },

    #[error("Verification failed: {0}")]
    Verification(#[from] WebauthnError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BioIdError {
    pub fn status(&self) -> StatusCode {
        match self {
            BioIdError::NotFound(_) | BioIdError::NotEnrolled => StatusCode::NOT_FOUND,
            BioIdError::BadRequest(_)
            | BioIdError::ChallengeMissing
            | BioIdError::ChallengeExpired
            | BioIdError::Verification(_) => StatusCode::BAD_REQUEST,
            BioIdError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            BioIdError::AlreadyEnrolled | BioIdError::CounterRegression { .. } => {
                StatusCode::CONFLICT
            }
            BioIdError::Database(_)
            | BioIdError::Migration(_)
            | BioIdError::Serialization(_)
            | BioIdError::Jwt(_)
            | BioIdError::Config(_)
            | BioIdError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BioIdError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            BioIdError::Verification(e) => {
                warn!("WebAuthn verification rejected: {:?}", e);
                "Verification failed".to_string()
            }
            BioIdError::CounterRegression { .. } => {
                warn!("{}", self);
                self.to_string()
            }
            e if status == StatusCode::INTERNAL_SERVER_ERROR => {
                error!("BioID error: {}", e);
                "Internal server error".to_string()
            }
            e => e.to_string(),
        };

        (status, Json(json!({ "ok": false, "error": message }))).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentStatus {
    pub enrolled: bool,
    pub hash: Option<String>,
}

#[derive(Debug)]
pub enum EnrollStart {
    /// The user already has a biometric; the browser should verify instead
    AlreadyEnrolled,
    Challenge(CreationChallengeResponse),
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifiedIdentity {
    pub bioid_hash: String,
    pub session_token: String,
    pub user_verified: bool,
    pub counter: u32,
}

pub struct BioIdService {
    context: AppContext,
    client_ip: Option<String>,
}

impl BioIdService {
    pub fn new(context: AppContext) -> Self {
        Self {
            context,
            client_ip: None,
        }
    }

    pub fn with_client_ip(mut self, ip: Option<String>) -> Self {
        self.client_ip = ip;
        self
    }

    /// Whether a user has completed enrollment
    pub async fn status(&self, user_id: &str) -> Result<EnrollmentStatus, BioIdError> {
        let user = database::get_user(&self.context.db, user_id).await?;
        let hash = user.and_then(|u| u.bioid_hash);

        Ok(EnrollmentStatus {
            enrolled: hash.is_some(),
            hash,
        })
    }

    /// Issue a registration challenge for a platform credential
    pub async fn start_enroll(
        &self,
        user_id: &str,
        user_name: &str,
    ) -> Result<EnrollStart, BioIdError> {
        validate_user_id(user_id)?;

        let user = database::ensure_user(&self.context.db, user_id, user_name).await?;
        if user.is_enrolled() {
            info!(user_id, "enrollment requested for enrolled user");
            return Ok(EnrollStart::AlreadyEnrolled);
        }

        let existing = self.passkeys(&user).await?;
        let (ccr, state) = self.context.relying_party.start_enrollment(
            &user.user_handle,
            &user.user_name,
            &existing,
        )?;

        database::store_challenge(
            &self.context.db,
            user_id,
            Ceremony::Registration,
            &state,
            self.context.config.challenge_ttl(),
        )
        .await?;

        Ok(EnrollStart::Challenge(ccr))
    }

    /// Verify the attestation, store the credential and derive the BioID hash
    pub async fn finish_enroll(
        &self,
        user_id: &str,
        credential: &serde_json::Value,
        profile: &Profile,
    ) -> Result<String, BioIdError> {
        match self.complete_enroll(user_id, credential, profile).await {
            Ok(hash) => {
                info!(user_id, bioid_hash = %hash, "enrollment complete");
                self.log_event(user_id, "enroll_success", json!({ "bioid_hash": hash }))
                    .await;
                Ok(hash)
            }
            Err(e) => {
                warn!(user_id, "enrollment failed: {}", e);
                self.log_event(user_id, "enroll_failure", json!({ "reason": e.to_string() }))
                    .await;
                Err(e)
            }
        }
    }

    async fn complete_enroll(
        &self,
        user_id: &str,
        credential: &serde_json::Value,
        profile: &Profile,
    ) -> Result<String, BioIdError> {
        let db = &self.context.db;

        let user = database::get_user(db, user_id)
            .await?
            .ok_or_else(|| BioIdError::NotFound("User not found".to_string()))?;
        if user.is_enrolled() {
            return Err(BioIdError::AlreadyEnrolled);
        }
        profile.validate()?;

        let challenge = database::take_challenge(db, user_id, Ceremony::Registration).await?;
        let passkey = self
            .context
            .relying_party
            .finish_enrollment(credential, &challenge.state)?;

        let credential_id: &[u8] = passkey.cred_id();
        let hash = bioid_hash(credential_id);

        // Credential and hash land together or not at all
        let mut tx = db.begin().await?;
        database::insert_credential(
            &mut *tx,
            user_id,
            &encode_credential_id(credential_id),
            &serde_json::to_string(&passkey)?,
            0,
        )
        .await?;
        database::complete_enrollment(&mut *tx, user_id, &hash, profile).await?;
        tx.commit().await?;

        Ok(hash)
    }

    /// Issue an authentication challenge over the user's credentials
    pub async fn start_verify(&self, user_id: &str) -> Result<RequestChallengeResponse, BioIdError> {
        let user = self.enrolled_user(user_id).await?;
        let passkeys = self.passkeys(&user).await?;
        if passkeys.is_empty() {
            return Err(BioIdError::NotEnrolled);
        }

        let (rcr, state) = self.context.relying_party.start_verification(&passkeys)?;

        database::store_challenge(
            &self.context.db,
            user_id,
            Ceremony::Authentication,
            &state,
            self.context.config.challenge_ttl(),
        )
        .await?;

        Ok(rcr)
    }

    /// Verify the assertion, enforce the signature counter and open a session
    pub async fn finish_verify(
        &self,
        user_id: &str,
        credential: &serde_json::Value,
    ) -> Result<VerifiedIdentity, BioIdError> {
        match self.complete_verify(user_id, credential).await {
            Ok(identity) => {
                info!(user_id, counter = identity.counter, "verification succeeded");
                self.log_event(
                    user_id,
                    "verify_success",
                    json!({ "counter": identity.counter, "user_verified": identity.user_verified }),
                )
                .await;
                Ok(identity)
            }
            Err(e) => {
                warn!(user_id, "verification failed: {}", e);
                self.log_event(user_id, "verify_failure", json!({ "reason": e.to_string() }))
                    .await;
                Err(e)
            }
        }
    }

    async fn complete_verify(
        &self,
        user_id: &str,
        credential: &serde_json::Value,
    ) -> Result<VerifiedIdentity, BioIdError> {
        let db = &self.context.db;
        let user = self.enrolled_user(user_id).await?;
        let bioid_hash = user.bioid_hash.clone().ok_or(BioIdError::NotEnrolled)?;

        let challenge = database::take_challenge(db, user_id, Ceremony::Authentication).await?;
        let result = self
            .context
            .relying_party
            .finish_verification(credential, &challenge.state)?;

        let asserted_id = encode_credential_id(result.cred_id());
        let stored = database::credentials_for_user(db, user_id)
            .await?
            .into_iter()
            .find(|c| c.credential_id == asserted_id)
            .ok_or_else(|| {
                BioIdError::Unauthorized("Credential does not belong to user".to_string())
            })?;

        let mut passkey = decode_passkey(&stored.passkey)?;
        passkey.update_credential(&result);

        let advanced = database::advance_counter(
            db,
            &stored.credential_id,
            result.counter(),
            &serde_json::to_string(&passkey)?,
        )
        .await;

        if let Err(e) = advanced {
            // A cloned credential may already hold sessions
            if matches!(e, BioIdError::CounterRegression { .. }) {
                self.context
                    .session_manager
                    .write()
                    .await
                    .revoke_user_sessions(user_id);
            }
            return Err(e);
        }

        let session = self
            .context
            .session_manager
            .write()
            .await
            .create_session(user_id, &bioid_hash)?;

        Ok(VerifiedIdentity {
            bioid_hash,
            session_token: session.token,
            user_verified: result.user_verified(),
            counter: result.counter(),
        })
    }

    /// Profile registered under a BioID hash
    pub async fn profile_by_hash(&self, hash: &str) -> Result<Profile, BioIdError> {
        database::get_user_by_hash(&self.context.db, hash)
            .await?
            .map(|user| user.profile)
            .ok_or_else(|| BioIdError::NotFound("User not found".to_string()))
    }

    /// Edit profile data; only the verified owner may do so
    pub async fn update_profile(
        &self,
        session: &Session,
        user_id: &str,
        profile: &Profile,
    ) -> Result<(), BioIdError> {
        if user_id.is_empty() {
            return Err(BioIdError::BadRequest("Missing userId".to_string()));
        }
        if session.user_id != user_id {
            return Err(BioIdError::Unauthorized(
                "Session does not belong to user".to_string(),
            ));
        }
        profile.validate()?;

        let matched = database::update_profile(&self.context.db, user_id, profile).await?;
        if matched == 0 {
            return Err(BioIdError::NotFound("User not found".to_string()));
        }

        self.log_event(user_id, "profile_update", json!({})).await;

        Ok(())
    }

    async fn enrolled_user(&self, user_id: &str) -> Result<User, BioIdError> {
        database::get_user(&self.context.db, user_id)
            .await?
            .filter(User::is_enrolled)
            .ok_or(BioIdError::NotEnrolled)
    }

    async fn passkeys(&self, user: &User) -> Result<Vec<Passkey>, BioIdError> {
        database::credentials_for_user(&self.context.db, &user.user_id)
            .await?
            .iter()
            .map(|c| decode_passkey(&c.passkey))
            .collect()
    }

    // Audit failures must not mask the ceremony result
    async fn log_event(&self, user_id: &str, event_type: &str, metadata: serde_json::Value) {
        let event = AuthEvent {
            user_id: Some(user_id.to_string()),
            event_type: event_type.to_string(),
            ip_address: self.client_ip.clone(),
            metadata,
        };

        if let Err(e) = database::log_auth_event(&self.context.db, event).await {
            error!("Failed to log auth event: {}", e);
        }
    }
}

fn validate_user_id(user_id: &str) -> Result<(), BioIdError> {
    if user_id.trim().is_empty() {
        return Err(BioIdError::BadRequest("Missing userId".to_string()));
    }
    if user_id.len() > 128 {
        return Err(BioIdError::BadRequest("userId too long".to_string()));
    }
    Ok(())
}
