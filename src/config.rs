//! Configuration for BioID

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BioIdConfig {
    /// Application name
    pub app_name: String,

    /// Database URL
    pub database_url: String,

    /// Web server host
    pub host: String,

    /// Web server port
    pub port: u16,

    /// Secret used to sign session tokens
    pub jwt_secret: String,

    /// Session lifetime in seconds
    pub session_ttl_secs: u64,

    /// Lifetime of an outstanding enrollment or verification challenge
    pub challenge_ttl_secs: u64,

    /// How often expired challenges are purged
    pub cleanup_interval_secs: u64,

    /// Origins allowed by CORS
    pub allowed_origins: Vec<String>,

    /// Maximum JSON body size
    pub body_limit_bytes: usize,

    /// Ceremony requests allowed per client per window
    pub rate_limit_max_requests: u32,

    /// Rate limit window in seconds
    pub rate_limit_window_secs: u64,

    /// WebAuthn configuration
    pub webauthn: WebAuthnConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebAuthnConfig {
    pub rp_id: String,
    pub rp_name: String,
    pub rp_origin: String,
    /// Additional origins (same RP id) whose responses are accepted
    pub extra_origins: Vec<String>,
    /// Shown at /.well-known/webauthn
    pub description: String,
}

impl Default for BioIdConfig {
    fn default() -> Self {
        Self {
            app_name: "BioID".to_string(),
            database_url: "sqlite://bioid.db".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7448,
            jwt_secret: generate_secret(),
            session_ttl_secs: 30 * 60,
            challenge_ttl_secs: 5 * 60,
            cleanup_interval_secs: 10 * 60,
            allowed_origins: vec!["http://localhost:7448".to_string()],
            body_limit_bytes: 10 * 1024 * 1024,
            rate_limit_max_requests: 30,
            rate_limit_window_secs: 60,
            webauthn: WebAuthnConfig {
                rp_id: "localhost".to_string(),
                rp_name: "BioID".to_string(),
                rp_origin: "http://localhost:7448".to_string(),
                extra_origins: Vec::new(),
                description: "WebAuthn Biometrics Authentication".to_string(),
            },
        }
    }
}

fn generate_secret() -> String {
    use rand::Rng;
    use base64::{Engine as _, engine::general_purpose};
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    general_purpose::STANDARD.encode(bytes)
}

impl BioIdConfig {
    pub fn builder() -> BioIdConfigBuilder {
        BioIdConfigBuilder {
            config: BioIdConfig::default(),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load configuration from defaults, `bioid.toml` and `BIOID_*` variables
    ///
    /// Nested keys use a double underscore, e.g. `BIOID_WEBAUTHN__RP_ID`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = config::Config::builder()
            .add_source(config::Config::try_from(&BioIdConfig::default())?);

        if std::path::Path::new("bioid.toml").exists() {
            config = config.add_source(config::File::with_name("bioid"));
        }

        config = config.add_source(
            config::Environment::with_prefix("BIOID")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("allowed_origins")
                .with_list_parse_key("webauthn.extra_origins"),
        );

        config.build()?.try_deserialize()
    }
}

pub struct BioIdConfigBuilder {
    config: BioIdConfig,
}

impl BioIdConfigBuilder {
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.jwt_secret = secret.into();
        self
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.config.session_ttl_secs = ttl.as_secs();
        self
    }

    pub fn challenge_ttl(mut self, ttl: Duration) -> Self {
        self.config.challenge_ttl_secs = ttl.as_secs();
        self
    }

    pub fn allowed_origins(mut self, origins: Vec<impl Into<String>>) -> Self {
        self.config.allowed_origins = origins.into_iter()
            .map(|s| s.into())
            .collect();
        self
    }

    pub fn rate_limit(mut self, max_requests: u32, window: Duration) -> Self {
        self.config.rate_limit_max_requests = max_requests;
        self.config.rate_limit_window_secs = window.as_secs();
        self
    }

    pub fn relying_party(
        mut self,
        rp_id: impl Into<String>,
        rp_origin: impl Into<String>,
    ) -> Self {
        self.config.webauthn.rp_id = rp_id.into();
        self.config.webauthn.rp_origin = rp_origin.into();
        self
    }

    pub fn build(self) -> BioIdConfig {
        self.config
    }
}
