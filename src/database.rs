//! Database models and operations

use crate::bioid::BioIdError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Sqlite, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length of a single profile field
pub const MAX_PROFILE_FIELD_LEN: usize = 256;

/// Identity details captured at enrollment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
    pub first_name: String,
    pub last_name: String,
    pub document_type: String,
    pub document_number: String,
    pub nationality: String,
    pub residence: String,
    pub birthdate: String,
    pub company_name: String,
}

impl Profile {
    fn fields(&self) -> [(&'static str, &str); 8] {
        [
            ("firstName", self.first_name.as_str()),
            ("lastName", self.last_name.as_str()),
            ("documentType", self.document_type.as_str()),
            ("documentNumber", self.document_number.as_str()),
            ("nationality", self.nationality.as_str()),
            ("residence", self.residence.as_str()),
            ("birthdate", self.birthdate.as_str()),
            ("companyName", self.company_name.as_str()),
        ]
    }

    pub fn validate(&self) -> Result<(), BioIdError> {
        for (name, value) in self.fields() {
            if value.chars().count() > MAX_PROFILE_FIELD_LEN {
                return Err(BioIdError::BadRequest(format!(
                    "{} exceeds {} characters",
                    name, MAX_PROFILE_FIELD_LEN
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub user_id: String,
    /// WebAuthn user handle (UUID), never shown to the relying app
    pub user_handle: String,
    pub user_name: String,
    pub bioid_hash: Option<String>,
    #[sqlx(flatten)]
    pub profile: Profile,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_enrolled(&self) -> bool {
        self.bioid_hash.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredCredential {
    /// Base64url credential id
    pub credential_id: String,
    pub user_id: String,
    /// Serialized `Passkey`
    pub passkey: String,
    pub counter: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ceremony {
    Registration,
    Authentication,
}

impl Ceremony {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ceremony::Registration => "registration",
            Ceremony::Authentication => "authentication",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingChallenge {
    pub user_id: String,
    pub ceremony: String,
    /// Serialized library ceremony state
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEvent {
    pub user_id: Option<String>,
    pub event_type: String,
    pub ip_address: Option<String>,
    pub metadata: serde_json::Value,
}

const USER_COLUMNS: &str = "user_id, user_handle, user_name, bioid_hash, \
     first_name, last_name, document_type, document_number, nationality, \
     residence, birthdate, company_name, created_at, updated_at";

/// Initialize the database and run migrations
pub async fn init_db(database_url: &str) -> Result<SqlitePool, BioIdError> {
    let in_memory = database_url.contains(":memory:");

    // Create the parent directory of a file database
    if !in_memory {
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.split('?').next().unwrap_or(path);
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent).ok();
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    // Every connection to `:memory:` is a separate database, so keep exactly one alive
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Get a user, creating it with a fresh WebAuthn handle if missing
pub async fn ensure_user(
    pool: &SqlitePool,
    user_id: &str,
    user_name: &str,
) -> Result<User, BioIdError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO users (user_id, user_handle, user_name, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?4)
        ON CONFLICT(user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(Uuid::new_v4().to_string())
    .bind(user_name)
    .bind(now)
    .execute(pool)
    .await?;

    get_user(pool, user_id)
        .await?
        .ok_or_else(|| BioIdError::Internal(format!("user {} vanished after insert", user_id)))
}

/// Get user by external id
pub async fn get_user(pool: &SqlitePool, user_id: &str) -> Result<Option<User>, BioIdError> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {} FROM users WHERE user_id = ?1",
        USER_COLUMNS
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(user)
}

/// Get user by BioID hash
pub async fn get_user_by_hash(
    pool: &SqlitePool,
    bioid_hash: &str,
) -> Result<Option<User>, BioIdError> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {} FROM users WHERE bioid_hash = ?1",
        USER_COLUMNS
    ))
    .bind(bioid_hash)
    .fetch_optional(pool)
    .await?;

    Ok(user)
}

/// Record the BioID hash and profile of a freshly enrolled user
pub async fn complete_enrollment<'e, E>(
    executor: E,
    user_id: &str,
    bioid_hash: &str,
    profile: &Profile,
) -> Result<(), BioIdError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE users
        SET bioid_hash = ?1, first_name = ?2, last_name = ?3, document_type = ?4,
            document_number = ?5, nationality = ?6, residence = ?7, birthdate = ?8,
            company_name = ?9, updated_at = ?10
        WHERE user_id = ?11
        "#,
    )
    .bind(bioid_hash)
    .bind(&profile.first_name)
    .bind(&profile.last_name)
    .bind(&profile.document_type)
    .bind(&profile.document_number)
    .bind(&profile.nationality)
    .bind(&profile.residence)
    .bind(&profile.birthdate)
    .bind(&profile.company_name)
    .bind(Utc::now())
    .bind(user_id)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(BioIdError::NotFound(format!("User {} not found", user_id)));
    }

    Ok(())
}

/// Overwrite profile fields, returning the number of users matched
pub async fn update_profile(
    pool: &SqlitePool,
    user_id: &str,
    profile: &Profile,
) -> Result<u64, BioIdError> {
    let result = sqlx::query(
        r#"
        UPDATE users
        SET first_name = ?1, last_name = ?2, document_type = ?3, document_number = ?4,
            nationality = ?5, residence = ?6, birthdate = ?7, company_name = ?8,
            updated_at = ?9
        WHERE user_id = ?10
        "#,
    )
    .bind(&profile.first_name)
    .bind(&profile.last_name)
    .bind(&profile.document_type)
    .bind(&profile.document_number)
    .bind(&profile.nationality)
    .bind(&profile.residence)
    .bind(&profile.birthdate)
    .bind(&profile.company_name)
    .bind(Utc::now())
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Store a verified credential
pub async fn insert_credential<'e, E>(
    executor: E,
    user_id: &str,
    credential_id: &str,
    passkey: &str,
    counter: u32,
) -> Result<(), BioIdError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO credentials (credential_id, user_id, passkey, counter, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(credential_id)
    .bind(user_id)
    .bind(passkey)
    .bind(i64::from(counter))
    .bind(Utc::now())
    .execute(executor)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            BioIdError::BadRequest("Credential already registered".to_string())
        }
        _ => BioIdError::Database(e),
    })?;

    Ok(())
}

pub async fn credentials_for_user(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Vec<StoredCredential>, BioIdError> {
    let credentials = sqlx::query_as::<_, StoredCredential>(
        r#"
        SELECT credential_id, user_id, passkey, counter, created_at, last_used_at
        FROM credentials
        WHERE user_id = ?1
        ORDER BY created_at
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(credentials)
}

/// Move a credential's signature counter forward
///
/// The counter must strictly increase, except for authenticators that always
/// report zero. Anything else means the credential may have been cloned.
pub async fn advance_counter(
    pool: &SqlitePool,
    credential_id: &str,
    new_counter: u32,
    passkey: &str,
) -> Result<(), BioIdError> {
    let result = sqlx::query(
        r#"
        UPDATE credentials
        SET counter = ?1, passkey = ?2, last_used_at = ?3
        WHERE credential_id = ?4
          AND (counter < ?1 OR (counter = 0 AND ?1 = 0))
        "#,
    )
    .bind(i64::from(new_counter))
    .bind(passkey)
    .bind(Utc::now())
    .bind(credential_id)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(());
    }

    let stored: Option<i64> =
        sqlx::query_scalar("SELECT counter FROM credentials WHERE credential_id = ?1")
            .bind(credential_id)
            .fetch_optional(pool)
            .await?;

    match stored {
        Some(stored) => Err(BioIdError::CounterRegression {
            stored: stored as u32,
            received: new_counter,
        }),
        None => Err(BioIdError::NotFound(format!(
            "Credential {} not found",
            credential_id
        ))),
    }
}

/// Store a challenge, replacing any outstanding one for the same ceremony
pub async fn store_challenge(
    pool: &SqlitePool,
    user_id: &str,
    ceremony: Ceremony,
    state: &str,
    ttl: std::time::Duration,
) -> Result<PendingChallenge, BioIdError> {
    let now = Utc::now();
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| BioIdError::Internal(format!("invalid challenge ttl: {}", e)))?;
    let challenge = PendingChallenge {
        user_id: user_id.to_string(),
        ceremony: ceremony.as_str().to_string(),
        state: state.to_string(),
        created_at: now,
        expires_at: now + ttl,
    };

    sqlx::query(
        r#"
        INSERT INTO challenges (user_id, ceremony, state, created_at, expires_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(user_id, ceremony) DO UPDATE SET
            state = excluded.state,
            created_at = excluded.created_at,
            expires_at = excluded.expires_at
        "#,
    )
    .bind(&challenge.user_id)
    .bind(&challenge.ceremony)
    .bind(&challenge.state)
    .bind(challenge.created_at)
    .bind(challenge.expires_at)
    .execute(pool)
    .await?;

    Ok(challenge)
}

/// Consume the outstanding challenge for a ceremony
///
/// The row is deleted in the same statement that reads it, so a challenge
/// can be redeemed at most once.
pub async fn take_challenge(
    pool: &SqlitePool,
    user_id: &str,
    ceremony: Ceremony,
) -> Result<PendingChallenge, BioIdError> {
    let challenge = sqlx::query_as::<_, PendingChallenge>(
        r#"
        DELETE FROM challenges
        WHERE user_id = ?1 AND ceremony = ?2
        RETURNING user_id, ceremony, state, created_at, expires_at
        "#,
    )
    .bind(user_id)
    .bind(ceremony.as_str())
    .fetch_optional(pool)
    .await?
    .ok_or(BioIdError::ChallengeMissing)?;

    if Utc::now() > challenge.expires_at {
        return Err(BioIdError::ChallengeExpired);
    }

    Ok(challenge)
}

/// Delete challenges that expired before `now`
pub async fn purge_expired_challenges(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<u64, BioIdError> {
    let result = sqlx::query("DELETE FROM challenges WHERE expires_at < ?1")
        .bind(now)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Log an authentication event
pub async fn log_auth_event(pool: &SqlitePool, event: AuthEvent) -> Result<(), BioIdError> {
    sqlx::query(
        r#"
        INSERT INTO auth_log (user_id, event_type, ip_address, metadata, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(event.user_id)
    .bind(event.event_type)
    .bind(event.ip_address)
    .bind(event.metadata.to_string())
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}
