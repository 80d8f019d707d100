//! Token issuance and verification.
//!
//! User and group administration live outside this crate; the server only
//! needs the [`AuthProvider`] contract: exchange credentials for a signed
//! token and verify tokens on incoming requests.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{TokenReply, UserInfo};

/// Authentication collaborator interface.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Exchanges credentials for a token; `device_name` is recorded in
    /// the token claims for later revocation tooling.
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
        device_name: &str,
    ) -> Result<TokenReply>;

    /// Verifies a bearer token and returns the user it identifies.
    fn verify(&self, token: &str) -> Result<UserInfo>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    #[serde(default)]
    device: String,
}

/// HS256 token provider signing with the configured `jwt_secret`.
///
/// Credential validation is delegated: any non-empty username/password
/// pair is accepted here, and deployments front this with their own user
/// database through the [`AuthProvider`] seam.
pub struct TokenAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenAuth {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::hours(24 * 30),
        }
    }

    /// Issues a token directly, bypassing credential checks. Used by the
    /// token endpoint after authentication and by tests.
    pub fn issue(&self, username: &str, device_name: &str) -> Result<TokenReply> {
        let expires_at = Utc::now() + self.ttl;
        let claims = Claims {
            sub: username.to_string(),
            exp: expires_at.timestamp(),
            device: device_name.to_string(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|err| Error::Unauthorized(err.to_string()))?;
        Ok(TokenReply {
            token,
            expires_at,
            user: UserInfo { id: username.to_string(), username: username.to_string() },
        })
    }
}

#[async_trait]
impl AuthProvider for TokenAuth {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
        device_name: &str,
    ) -> Result<TokenReply> {
        if username.is_empty() || password.is_empty() {
            return Err(Error::Unauthorized("username and password are required".into()));
        }
        self.issue(username, device_name)
    }

    fn verify(&self, token: &str) -> Result<UserInfo> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|err| Error::Unauthorized(format!("invalid token: {err}")))?;
        Ok(UserInfo { id: data.claims.sub.clone(), username: data.claims.sub })
    }
}
