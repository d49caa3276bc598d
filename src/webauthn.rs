//! WebAuthn relying party for platform biometric ceremonies
//!
//! Signature and attestation verification is done by `webauthn-rs`; this
//! module adapts its passkey ceremonies to platform authenticators and keeps
//! ceremony state serializable so it can be parked in the database between
//! the start and finish requests.

use crate::bioid::BioIdError;
use crate::config::WebAuthnConfig;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;
use webauthn_rs::prelude::*;

pub struct RelyingParty {
    webauthn: Webauthn,
    rp_id: String,
}

impl RelyingParty {
    pub fn new(config: &WebAuthnConfig, timeout: Duration) -> Result<Self, BioIdError> {
        let rp_origin = Url::parse(&config.rp_origin)
            .map_err(|e| BioIdError::Config(format!("invalid rp_origin {}: {}", config.rp_origin, e)))?;

        let extra_origins = config
            .extra_origins
            .iter()
            .map(|origin| {
                Url::parse(origin)
                    .map_err(|e| BioIdError::Config(format!("invalid origin {}: {}", origin, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = WebauthnBuilder::new(&config.rp_id, &rp_origin)
            .map_err(|e| BioIdError::Config(format!("invalid relying party {}: {:?}", config.rp_id, e)))?
            .rp_name(&config.rp_name)
            .timeout(timeout);

        for origin in &extra_origins {
            builder = builder.append_allowed_origin(origin);
        }

        Ok(Self {
            webauthn: builder
                .build()
                .map_err(|e| BioIdError::Config(format!("invalid relying party: {:?}", e)))?,
            rp_id: config.rp_id.clone(),
        })
    }

    pub fn rp_id(&self) -> &str {
        &self.rp_id
    }

    /// Begin registering a platform credential
    ///
    /// Returns the creation options for `navigator.credentials.create` and the
    /// serialized registration state.
    pub fn start_enrollment(
        &self,
        user_handle: &str,
        user_name: &str,
        existing: &[Passkey],
    ) -> Result<(CreationChallengeResponse, String), BioIdError> {
        let handle = Uuid::parse_str(user_handle)
            .map_err(|_| BioIdError::Internal(format!("corrupt user handle {}", user_handle)))?;

        let exclude: Vec<CredentialID> = existing.iter().map(|pk| pk.cred_id().clone()).collect();
        let exclude = (!exclude.is_empty()).then_some(exclude);

        let (mut ccr, state) =
            self.webauthn
                .start_passkey_registration(handle, user_name, user_name, exclude)?;

        // Built-in biometric only, no roaming keys or synced password managers
        if let Some(selection) = ccr.public_key.authenticator_selection.as_mut() {
            selection.authenticator_attachment = Some(AuthenticatorAttachment::Platform);
        }

        debug!(rp_id = %self.rp_id, "registration challenge issued");

        Ok((ccr, serde_json::to_string(&state)?))
    }

    /// Verify an attestation response against the stored registration state
    pub fn finish_enrollment(
        &self,
        credential: &serde_json::Value,
        state: &str,
    ) -> Result<Passkey, BioIdError> {
        let credential: RegisterPublicKeyCredential = serde_json::from_value(credential.clone())
            .map_err(|e| BioIdError::BadRequest(format!("malformed attestation response: {}", e)))?;
        let state: PasskeyRegistration = serde_json::from_str(state)?;

        Ok(self.webauthn.finish_passkey_registration(&credential, &state)?)
    }

    /// Begin an assertion over the user's enrolled credentials
    pub fn start_verification(
        &self,
        passkeys: &[Passkey],
    ) -> Result<(RequestChallengeResponse, String), BioIdError> {
        let (rcr, state) = self.webauthn.start_passkey_authentication(passkeys)?;

        debug!(rp_id = %self.rp_id, credentials = passkeys.len(), "authentication challenge issued");

        Ok((rcr, serde_json::to_string(&state)?))
    }

    /// Verify an assertion response against the stored authentication state
    pub fn finish_verification(
        &self,
        credential: &serde_json::Value,
        state: &str,
    ) -> Result<AuthenticationResult, BioIdError> {
        let credential: PublicKeyCredential = serde_json::from_value(credential.clone())
            .map_err(|e| BioIdError::BadRequest(format!("malformed assertion response: {}", e)))?;
        let state: PasskeyAuthentication = serde_json::from_str(state)?;

        Ok(self.webauthn.finish_passkey_authentication(&credential, &state)?)
    }
}

/// Lowercase hex SHA-256 of a verified credential id
pub fn bioid_hash(credential_id: &[u8]) -> String {
    format!("{:x}", Sha256::digest(credential_id))
}

/// Storage key for a credential id
pub fn encode_credential_id(credential_id: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(credential_id)
}

pub fn decode_passkey(passkey: &str) -> Result<Passkey, BioIdError> {
    Ok(serde_json::from_str(passkey)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> WebAuthnConfig {
        crate::config::BioIdConfig::default().webauthn
    }

    #[test]
    fn test_bioid_hash_is_sha256_hex() {
        assert_eq!(
            bioid_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_credential_id_encoding() {
        assert_eq!(encode_credential_id(&[0xfb, 0xff]), "-_8");
    }

    #[test]
    fn test_invalid_origin_rejected() {
        let mut config = test_config();
        config.rp_origin = "not a url".to_string();
        assert!(matches!(
            RelyingParty::new(&config, Duration::from_secs(60)),
            Err(BioIdError::Config(_))
        ));
    }

    #[test]
    fn test_enrollment_forces_platform_attachment() {
        let rp = RelyingParty::new(&test_config(), Duration::from_secs(60)).unwrap();
        let handle = Uuid::new_v4().to_string();

        let (ccr, state) = rp.start_enrollment(&handle, "alice", &[]).unwrap();
        let options = serde_json::to_value(&ccr).unwrap();

        assert_eq!(
            options["publicKey"]["authenticatorSelection"]["authenticatorAttachment"],
            "platform"
        );
        assert_eq!(options["publicKey"]["rp"]["id"], "localhost");
        assert!(!state.is_empty());
    }

    #[test]
    fn test_garbage_attestation_is_bad_request() {
        let rp = RelyingParty::new(&test_config(), Duration::from_secs(60)).unwrap();
        let (_, state) = rp
            .start_enrollment(&Uuid::new_v4().to_string(), "alice", &[])
            .unwrap();

        let result = rp.finish_enrollment(&serde_json::json!({"id": 42}), &state);
        assert!(matches!(result, Err(BioIdError::BadRequest(_))));
    }
}
