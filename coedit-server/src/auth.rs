//! Credential verification at the session handshake.
//!
//! The transport hands over an opaque bearer token; this resolves it to a
//! verified user identity or refuses the connection before any room
//! operation runs.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::Identifier;
use crate::error::{Error, Result};
use crate::session::AuthenticatedUser;
use crate::store::DocumentStore;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id.
    sub: String,
    /// Expiry, seconds since Unix epoch.
    exp: i64,
    /// Issued at, seconds since Unix epoch.
    iat: i64,
}

/// HS256 token issuer and verifier.
pub struct Authenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    expires_in: Duration,
}

impl Authenticator {
    pub fn new(secret: &str, expires_in: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            expires_in,
        }
    }

    /// Mint a token for `user_id`.
    pub fn issue(&self, user_id: &Identifier) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: now + self.expires_in.as_secs() as i64,
            iat: now,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| Error::Auth(e.to_string()))
    }

    /// Resolve a token to the user id it was issued for.
    pub fn verify(&self, token: &str) -> Result<Identifier> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| Error::Auth(e.to_string()))?;
        data.claims
            .sub
            .parse()
            .map_err(|_| Error::Auth("malformed subject claim".to_string()))
    }

    /// Full handshake path: verify the credential, then load the user's
    /// profile from the store.
    pub async fn authenticate(
        &self,
        store: &dyn DocumentStore,
        token: &str,
    ) -> Result<AuthenticatedUser> {
        let user_id = self.verify(token)?;
        let user = store
            .load_user(&user_id)
            .await?
            .ok_or_else(|| Error::Auth("unknown user".to_string()))?;
        Ok(AuthenticatedUser {
            user_id: user.id,
            username: user.username,
        })
    }
}
