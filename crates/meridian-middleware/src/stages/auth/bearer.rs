//! Bearer token authentication.
//!
//! Tokens have the familiar `header.payload.signature` shape, each part
//! base64url without padding. The header is fixed per signing method and
//! compared as a literal, so only the configured algorithm is ever
//! accepted. The payload carries [`Claims`].

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use meridian_core::{BoxFuture, Context, Handler, MeridianError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::{identify, presented, Presented};

/// Token verification failures.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Not three base64url segments.
    #[error("malformed token")]
    Malformed,
    /// The header names another algorithm.
    #[error("unexpected token header")]
    Header,
    /// Signature mismatch.
    #[error("signature mismatch")]
    Signature,
    /// `exp` has passed.
    #[error("token expired")]
    Expired,
    /// `nbf` is in the future.
    #[error("token not yet valid")]
    NotYetValid,
    /// The signing key was rejected.
    #[error("invalid signing key")]
    Key,
    /// The payload is not valid claims JSON.
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Signs and verifies token signatures.
pub trait SigningMethod: Send + Sync + 'static {
    /// The `alg` header value.
    fn alg(&self) -> &'static str;

    /// Signs `input`.
    fn sign(&self, input: &[u8]) -> Vec<u8>;

    /// Verifies `signature` over `input`.
    fn verify(&self, input: &[u8], signature: &[u8]) -> bool;
}

/// HMAC-SHA256 (`HS256`).
///
/// The keyed MAC state is built once and cloned per token.
#[derive(Clone)]
pub struct HmacSha256 {
    mac: Hmac<Sha256>,
}

impl HmacSha256 {
    /// Creates the method from a shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Key`] if the key is rejected.
    pub fn new(secret: &[u8]) -> Result<Self, TokenError> {
        let mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| TokenError::Key)?;
        Ok(Self { mac })
    }
}

impl std::fmt::Debug for HmacSha256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HmacSha256(..)")
    }
}

impl SigningMethod for HmacSha256 {
    fn alg(&self) -> &'static str {
        "HS256"
    }

    fn sign(&self, input: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(input);
        mac.finalize().into_bytes().to_vec()
    }

    fn verify(&self, input: &[u8], signature: &[u8]) -> bool {
        let mut mac = self.mac.clone();
        mac.update(input);
        mac.verify_slice(signature).is_ok()
    }
}

/// Token payload.
///
/// Fields beyond the standard four are kept in `extra` and can be decoded
/// into an application type with [`Claims::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub userid: String,
    /// User name.
    pub username: String,
    /// Not valid before, in Unix seconds.
    pub nbf: i64,
    /// Expiry, in Unix seconds.
    pub exp: i64,
    /// Application fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    /// Claims valid from now for `valid_for`.
    #[must_use]
    pub fn new(userid: impl Into<String>, username: impl Into<String>, valid_for: Duration) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            userid: userid.into(),
            username: username.into(),
            nbf: now,
            exp: now.saturating_add(i64::try_from(valid_for.as_secs()).unwrap_or(i64::MAX)),
            extra: serde_json::Map::new(),
        }
    }

    /// Adds an application field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Decodes the whole payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not fit `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(self)?)
    }
}

/// Bearer authentication middleware.
///
/// On success the [`Claims`] are stored in the context extensions.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use meridian_middleware::stages::{BearerAuth, Claims};
///
/// let auth = BearerAuth::hs256(b"secret").unwrap();
/// let token = auth.issue(&Claims::new("42", "alice", Duration::from_secs(60))).unwrap();
/// let claims = auth.verify(&token, chrono::Utc::now().timestamp()).unwrap();
/// assert_eq!(claims.username, "alice");
/// ```
#[derive(Clone)]
pub struct BearerAuth {
    method: Arc<dyn SigningMethod>,
    header: String,
    realm: String,
    optional: bool,
}

impl std::fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerAuth")
            .field("alg", &self.method.alg())
            .field("realm", &self.realm)
            .field("optional", &self.optional)
            .finish_non_exhaustive()
    }
}

impl BearerAuth {
    /// Creates an authenticator using `method`.
    #[must_use]
    pub fn new(method: impl SigningMethod) -> Self {
        let header = URL_SAFE_NO_PAD.encode(format!(r#"{{"alg":"{}","typ":"JWT"}}"#, method.alg()));
        Self {
            method: Arc::new(method),
            header,
            realm: "meridian".to_string(),
            optional: false,
        }
    }

    /// Creates an `HS256` authenticator.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Key`] if the key is rejected.
    pub fn hs256(secret: &[u8]) -> Result<Self, TokenError> {
        Ok(Self::new(HmacSha256::new(secret)?))
    }

    /// Sets the realm named in challenges.
    #[must_use]
    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// Lets requests without credentials through unauthenticated.
    #[must_use]
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// Signs `claims` into a token.
    ///
    /// # Errors
    ///
    /// Returns an error if the claims fail to serialize.
    pub fn issue(&self, claims: &Claims) -> Result<String, TokenError> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let mut token = format!("{}.{payload}", self.header);
        let signature = URL_SAFE_NO_PAD.encode(self.method.sign(token.as_bytes()));
        token.push('.');
        token.push_str(&signature);
        Ok(token)
    }

    /// Verifies `token` at Unix time `now`.
    ///
    /// # Errors
    ///
    /// Returns the first check that failed.
    pub fn verify(&self, token: &str, now: i64) -> Result<Claims, TokenError> {
        let (signed, signature) = token.rsplit_once('.').ok_or(TokenError::Malformed)?;
        let (header, payload) = signed.split_once('.').ok_or(TokenError::Malformed)?;
        if header != self.header {
            return Err(TokenError::Header);
        }
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;
        if !self.method.verify(signed.as_bytes(), &signature) {
            return Err(TokenError::Signature);
        }
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&payload)?;
        if now < claims.nbf {
            return Err(TokenError::NotYetValid);
        }
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

impl Handler for BearerAuth {
    fn name(&self) -> &'static str {
        "bearer_auth"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let result = match presented(ctx, "Bearer") {
                Presented::Missing if self.optional => return,
                Presented::Credentials(token) => {
                    self.verify(token, chrono::Utc::now().timestamp()).map_err(Some)
                }
                _ => Err(None),
            };
            match result {
                Ok(claims) => {
                    identify(ctx, Some(&claims.userid), &claims.username);
                    ctx.extensions_mut().insert(claims);
                }
                Err(None) => {
                    let challenge = format!("Bearer realm=\"{}\"", self.realm);
                    ctx.fail(MeridianError::challenge("bearer token required", challenge))
                        .await;
                }
                Err(Some(err)) => {
                    let challenge = format!(
                        "Bearer realm=\"{}\", error=\"invalid_token\", error_description=\"{err}\"",
                        self.realm
                    );
                    ctx.fail(MeridianError::challenge(err.to_string(), challenge)).await;
                }
            }
        })
    }
}
