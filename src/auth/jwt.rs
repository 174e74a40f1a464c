use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, decode_header, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header,
    Validation,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::password::SecretHasher;
use crate::config::AppConfig;
use crate::models::NewRefreshToken;
use crate::utils::now_utc;

const ALGORITHM: Algorithm = Algorithm::HS512;
const REFRESH_SECRET_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token issuer failure: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub refresh_token_id: Uuid,
    /// Always false for issued tokens; the admin authenticates with the static
    /// admin token and never holds a JWT.
    #[serde(default)]
    pub is_admin: bool,
    pub iss: String,
    pub iat: usize,
    pub exp: usize,
}

/// A freshly minted pair. `record` is not yet persisted.
#[derive(Debug, Clone)]
pub struct IssuedPair {
    pub access_token: String,
    pub refresh_secret: String,
    pub record: NewRefreshToken,
}

/// Mints and verifies HS512 access tokens and the refresh secrets bound to them.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    hasher: SecretHasher,
}

impl TokenIssuer {
    pub fn new(
        secret: &[u8],
        issuer: impl Into<String>,
        access_ttl: Duration,
        refresh_ttl: Duration,
        hasher: SecretHasher,
    ) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
            access_ttl,
            refresh_ttl,
            hasher,
        }
    }

    pub fn from_config(config: &AppConfig, hasher: SecretHasher) -> Self {
        Self::new(
            config.jwt_secret.as_bytes(),
            config.jwt_issuer.clone(),
            Duration::minutes(config.access_token_ttl_minutes),
            Duration::hours(config.refresh_token_ttl_hours),
            hasher,
        )
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn issue_pair(
        &self,
        user_id: Uuid,
        user_agent: &str,
        ip_address: &str,
    ) -> Result<IssuedPair, TokenError> {
        let mut bytes = [0u8; REFRESH_SECRET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let refresh_secret = STANDARD.encode(bytes);
        let token_hash = self
            .hasher
            .hash(&refresh_secret)
            .map_err(|err| TokenError::Internal(err.to_string()))?;

        let now = now_utc();
        let record = NewRefreshToken {
            id: Uuid::new_v4(),
            user_id,
            token_hash,
            expires_at: now + self.refresh_ttl,
            used: false,
            user_agent: user_agent.to_string(),
            ip_address: ip_address.to_string(),
            created_at: now,
        };

        let issued_at = Utc::now();
        let claims = Claims {
            sub: user_id,
            refresh_token_id: record.id,
            is_admin: false,
            iss: self.issuer.clone(),
            iat: issued_at.timestamp() as usize,
            exp: (issued_at + self.access_ttl).timestamp() as usize,
        };
        let access_token = self.sign(&claims)?;

        Ok(IssuedPair {
            access_token,
            refresh_secret,
            record,
        })
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        encode(&Header::new(ALGORITHM), claims, &self.encoding)
            .map_err(|err| TokenError::Internal(err.to_string()))
    }

    /// Checks signature, algorithm, issuer and expiry. Does not consult the
    /// credential store.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let header = decode_header(token).map_err(|_| TokenError::InvalidSignature)?;
        if header.alg != ALGORITHM {
            return Err(TokenError::InvalidSignature);
        }
        self.decode(token, true)
    }

    /// Like [`verify`](Self::verify) but accepts an expired token.
    pub fn verify_ignoring_expiry(&self, token: &str) -> Result<Claims, TokenError> {
        let header = decode_header(token).map_err(|_| TokenError::InvalidSignature)?;
        if header.alg != ALGORITHM {
            return Err(TokenError::InvalidSignature);
        }
        self.decode(token, false)
    }

    pub fn verify_refresh_secret(&self, secret: &str, hash: &str) -> Result<bool, TokenError> {
        self.hasher
            .verify(secret, hash)
            .map_err(|err| TokenError::Internal(err.to_string()))
    }

    fn decode(&self, token: &str, validate_exp: bool) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = validate_exp;
        validation.set_issuer(&[self.issuer.as_str()]);

        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::InvalidSignature,
            })
    }
}
