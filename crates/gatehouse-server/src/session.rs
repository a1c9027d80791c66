//! Ed25519-signed session tokens.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::store::User;

pub const ISSUER: &str = "gatehouse";

/// How long a freshly issued token stays valid.
pub const TOKEN_TTL_HOURS: i64 = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// Issue instant in milliseconds; compared against a password change.
    pub iat_ms: i64,
    pub username: String,
    #[serde(default)]
    pub perm: HashMap<String, String>,
}

impl SessionClaims {
    pub fn for_user(user: &User, issued_at: DateTime<Utc>) -> Self {
        Self {
            sub: user.id.clone(),
            iss: ISSUER.to_owned(),
            iat: issued_at.timestamp(),
            exp: (issued_at + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
            iat_ms: issued_at.timestamp_millis(),
            username: user.username.clone(),
            perm: user.perm.clone(),
        }
    }

    /// True if the token predates the user's last password change.
    pub fn predates_password_change(&self, user: &User) -> bool {
        matches!(user.password_changed_at, Some(changed) if self.iat_ms < changed.timestamp_millis())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("encode signing key: {0}")]
    KeyEncoding(String),
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// The process's token signing key pair.
#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SessionKeys {
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, SessionError> {
        let signing = SigningKey::from_bytes(seed);
        let pkcs8 = signing
            .to_pkcs8_der()
            .map_err(|e| SessionError::KeyEncoding(e.to_string()))?;
        Ok(Self {
            encoding: EncodingKey::from_ed_der(pkcs8.as_bytes()),
            decoding: DecodingKey::from_ed_der(signing.verifying_key().as_bytes()),
        })
    }

    /// A fresh random key pair; tokens die with the process.
    pub fn generate() -> Result<Self, SessionError> {
        let seed = Zeroizing::new(generate_seed());
        Self::from_seed(&seed)
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String, SessionError> {
        Ok(encode(&Header::new(Algorithm::EdDSA), claims, &self.encoding)?)
    }

    pub fn issue(&self, user: &User) -> Result<String, SessionError> {
        self.sign(&SessionClaims::for_user(user, Utc::now()))
    }

    /// Checks signature, issuer and expiry. Does not consult the user store.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, SessionError> {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 0;
        Ok(decode::<SessionClaims>(token, &self.decoding, &validation)?.claims)
    }
}

pub fn generate_seed() -> [u8; 32] {
    use rand::RngCore;
    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    seed
}
