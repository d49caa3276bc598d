//! BioID - WebAuthn platform-biometric enrollment service
//!
//! Enrolls a user's built-in authenticator (Face ID, Touch ID, Windows Hello),
//! derives a BioID hash from the verified credential and re-verifies it later.

pub mod auth_middleware;
pub mod bioid;
pub mod config;
pub mod database;
pub mod rate_limit;
pub mod security;
pub mod session;
pub mod web;
pub mod webauthn;

pub use bioid::{BioIdError, BioIdService};
pub use config::{BioIdConfig, WebAuthnConfig};
pub use session::{Session, SessionManager};
pub use webauthn::RelyingParty;

use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Application context shared across handlers
#[derive(Clone)]
pub struct AppContext {
    pub db: SqlitePool,
    pub config: Arc<BioIdConfig>,
    pub relying_party: Arc<RelyingParty>,
    pub session_manager: Arc<RwLock<SessionManager>>,
}

impl AppContext {
    pub async fn new(config: BioIdConfig) -> Result<Self, BioIdError> {
        let relying_party = RelyingParty::new(&config.webauthn, config.challenge_ttl())?;

        let session_manager = SessionManager::new(&config.jwt_secret, config.session_ttl())?;

        let db = database::init_db(&config.database_url).await?;

        Ok(Self {
            db,
            config: Arc::new(config),
            relying_party: Arc::new(relying_party),
            session_manager: Arc::new(RwLock::new(session_manager)),
        })
    }

    /// Purge expired challenges and sessions, returning how many were removed
    pub async fn purge_expired(&self) -> Result<(u64, usize), BioIdError> {
        let challenges = database::purge_expired_challenges(&self.db, chrono::Utc::now()).await?;
        let sessions = self.session_manager.write().await.cleanup_expired();
        Ok((challenges, sessions))
    }
}
