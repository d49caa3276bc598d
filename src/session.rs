//! Session management
//!
//! A session is issued after a successful biometric verification and lets
//! the browser edit the profile it just proved ownership of.

use crate::bioid::BioIdError;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub bioid_hash: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Check if session is still valid
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,        // User ID
    pub bioid: String,      // BioID hash
    pub session: String,    // Session ID
    pub exp: i64,
    pub iat: i64,
}

pub struct SessionManager {
    sessions: HashMap<String, Session>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    session_duration: Duration,
}

impl SessionManager {
    pub fn new(secret: &str, session_duration: std::time::Duration) -> Result<Self, BioIdError> {
        if secret.len() < 32 {
            return Err(BioIdError::Config(
                "jwt_secret must be at least 32 characters".to_string(),
            ));
        }

        let session_duration = Duration::from_std(session_duration)
            .map_err(|e| BioIdError::Config(format!("invalid session duration: {}", e)))?;

        Ok(Self {
            sessions: HashMap::new(),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            session_duration,
        })
    }

    /// Create a new session for a verified user
    pub fn create_session(
        &mut self,
        user_id: &str,
        bioid_hash: &str,
    ) -> Result<Session, BioIdError> {
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + self.session_duration;

        let claims = Claims {
            sub: user_id.to_string(),
            bioid: bioid_hash.to_string(),
            session: session_id.clone(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)?;

        let session = Session {
            id: session_id.clone(),
            user_id: user_id.to_string(),
            bioid_hash: bioid_hash.to_string(),
            token,
            created_at: now,
            expires_at,
            last_activity: now,
        };

        self.sessions.insert(session_id, session.clone());

        Ok(session)
    }

    /// Validate a token and return the session
    pub fn validate_token(&mut self, token: &str) -> Result<Session, BioIdError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|_| BioIdError::Unauthorized("Invalid session token".to_string()))?
            .claims;

        let session = self
            .sessions
            .get_mut(&claims.session)
            .ok_or_else(|| BioIdError::Unauthorized("Session expired".to_string()))?;

        if Utc::now() > session.expires_at {
            self.sessions.remove(&claims.session);
            return Err(BioIdError::Unauthorized("Session expired".to_string()));
        }

        session.last_activity = Utc::now();

        Ok(session.clone())
    }

    /// Revoke all sessions for a user
    pub fn revoke_user_sessions(&mut self, user_id: &str) {
        self.sessions.retain(|_, session| session.user_id != user_id);
    }

    /// Clean up expired sessions
    pub fn cleanup_expired(&mut self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.expires_at > now);
        before - self.sessions.len()
    }
}
