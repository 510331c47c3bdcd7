//! HTTP Digest authentication (RFC 7616).
//!
//! Nonces are stateless: `base64url("{issued}:{mac}")` where `mac` is an
//! HMAC over the issue time under a per-instance secret. A nonce that
//! verifies but has outlived its lifetime yields a fresh challenge with
//! `stale=true`, so clients retry without prompting for a password.
//!
//! Each nonce remembers the highest `nc` accepted with it until the nonce
//! expires. A response that repeats or lowers the count is a replay and
//! gets a fresh `stale=true` challenge.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use meridian_core::{Body, BoxFuture, Context, Handler, MeridianError};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{hex, identify, presented, Presented};
use crate::stages::csrf::constant_time_eq;

/// Largest body hashed for `auth-int`.
const MAX_INTEGRITY_BODY: usize = 1024 * 1024;

/// Hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    /// `MD5`.
    #[default]
    Md5,
    /// `SHA-256`.
    Sha256,
}

impl DigestAlgorithm {
    /// Name as sent in the `algorithm` parameter.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha256 => "SHA-256",
        }
    }

    /// Hex digest of `data`.
    #[must_use]
    pub fn hash(self, data: &[u8]) -> String {
        match self {
            Self::Md5 => hex(&Md5::digest(data)),
            Self::Sha256 => hex(&Sha256::digest(data)),
        }
    }
}

/// Quality of protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    /// Authentication only.
    Auth,
    /// Authentication with body integrity.
    AuthInt,
}

impl Qop {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::AuthInt => "auth-int",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "auth" => Some(Self::Auth),
            "auth-int" => Some(Self::AuthInt),
            _ => None,
        }
    }
}

/// Why a digest response was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
    Invalid,
    Stale,
}

/// Digest authentication middleware.
///
/// # Example
///
/// ```
/// use meridian_middleware::stages::{DigestAlgorithm, DigestAuth, Qop};
///
/// let auth = DigestAuth::new("files", DigestAlgorithm::Sha256)
///     .qop(&[Qop::Auth, Qop::AuthInt])
///     .user("alice", "wonderland");
/// ```
#[derive(Clone)]
pub struct DigestAuth {
    realm: String,
    algorithm: DigestAlgorithm,
    qops: Vec<Qop>,
    opaque: String,
    secret: Hmac<Sha256>,
    lifetime: Duration,
    users: HashMap<String, String>,
    optional: bool,
    counts: Arc<Mutex<HashMap<String, NonceUse>>>,
}

#[derive(Debug, Clone, Copy)]
struct NonceUse {
    issued: i64,
    nc: u64,
}

impl fmt::Debug for DigestAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestAuth")
            .field("realm", &self.realm)
            .field("algorithm", &self.algorithm)
            .field("qops", &self.qops)
            .field("lifetime", &self.lifetime)
            .field("users", &self.users.len())
            .field("tracked_nonces", &self.counts.lock().len())
            .finish_non_exhaustive()
    }
}

impl DigestAuth {
    /// Creates an authenticator for `realm` with a random nonce secret.
    #[must_use]
    pub fn new(realm: impl Into<String>, algorithm: DigestAlgorithm) -> Self {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);
        let mut opaque = [0u8; 16];
        rng.fill_bytes(&mut opaque);
        Self {
            realm: realm.into(),
            algorithm,
            qops: vec![Qop::Auth],
            opaque: hex(&opaque),
            secret: <Hmac<Sha256> as Mac>::new_from_slice(&key)
                .unwrap_or_else(|_| unreachable!("HMAC takes keys of any length")),
            lifetime: Duration::from_secs(300),
            users: HashMap::new(),
            optional: false,
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sets the offered qop values.
    #[must_use]
    pub fn qop(mut self, qops: &[Qop]) -> Self {
        if !qops.is_empty() {
            self.qops = qops.to_vec();
        }
        self
    }

    /// Sets how long a nonce stays fresh.
    #[must_use]
    pub fn nonce_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Adds a user. Only `H(user:realm:password)` is kept.
    #[must_use]
    pub fn user(mut self, username: &str, password: &str) -> Self {
        let ha1 = self
            .algorithm
            .hash(format!("{username}:{}:{password}", self.realm).as_bytes());
        self.users.insert(username.to_string(), ha1);
        self
    }

    /// Lets requests without credentials through unauthenticated.
    #[must_use]
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// The opaque value echoed by clients.
    #[must_use]
    pub fn opaque(&self) -> &str {
        &self.opaque
    }

    /// A nonce issued at Unix time `issued`.
    #[must_use]
    pub fn nonce_at(&self, issued: i64) -> String {
        let mut mac = self.secret.clone();
        mac.update(issued.to_string().as_bytes());
        let tag = hex(&mac.finalize().into_bytes());
        URL_SAFE_NO_PAD.encode(format!("{issued}:{tag}"))
    }

    /// The `WWW-Authenticate` value for a fresh challenge.
    #[must_use]
    pub fn challenge(&self, stale: bool) -> String {
        let qop: Vec<&str> = self.qops.iter().map(|q| q.as_str()).collect();
        let mut challenge = format!(
            "Digest realm=\"{}\", qop=\"{}\", algorithm={}, nonce=\"{}\", opaque=\"{}\"",
            self.realm,
            qop.join(", "),
            self.algorithm.as_str(),
            self.nonce_at(chrono::Utc::now().timestamp()),
            self.opaque,
        );
        if stale {
            challenge.push_str(", stale=true");
        }
        challenge
    }

    /// Returns the issue time of a nonce this instance produced.
    fn nonce_issued(&self, nonce: &str) -> Option<i64> {
        let decoded = URL_SAFE_NO_PAD.decode(nonce).ok()?;
        let decoded = std::str::from_utf8(&decoded).ok()?;
        let (issued, _) = decoded.split_once(':')?;
        let issued: i64 = issued.parse().ok()?;
        constant_time_eq(self.nonce_at(issued).as_bytes(), nonce.as_bytes()).then_some(issued)
    }

    fn lifetime_secs(&self) -> i64 {
        i64::try_from(self.lifetime.as_secs()).unwrap_or(i64::MAX)
    }

    /// Accepts `nc` for `nonce` only if it is above every count seen with it.
    fn advance_count(&self, nonce: &str, issued: i64, nc: u64, now: i64) -> Result<(), Refusal> {
        let mut counts = self.counts.lock();
        if let Some(seen) = counts.get_mut(nonce) {
            if nc <= seen.nc {
                return Err(Refusal::Stale);
            }
            seen.nc = nc;
            return Ok(());
        }
        let lifetime = self.lifetime_secs();
        counts.retain(|_, used| now.saturating_sub(used.issued) <= lifetime);
        counts.insert(nonce.to_string(), NonceUse { issued, nc });
        Ok(())
    }

    /// Checks a parsed `Authorization: Digest` header.
    fn check(
        &self,
        params: &HashMap<String, String>,
        method: &str,
        uri: &str,
        body_hash: Option<&str>,
        now: i64,
    ) -> Result<String, Refusal> {
        let field = |name: &str| params.get(name).map(String::as_str).ok_or(Refusal::Invalid);

        let username = field("username")?;
        let nonce = field("nonce")?;
        let response = field("response")?;
        if field("realm")? != self.realm || field("uri")? != uri {
            return Err(Refusal::Invalid);
        }
        if params.get("opaque").is_some_and(|o| *o != self.opaque) {
            return Err(Refusal::Invalid);
        }
        let algorithm = params.get("algorithm").map_or("MD5", String::as_str);
        if !algorithm.eq_ignore_ascii_case(self.algorithm.as_str()) {
            return Err(Refusal::Invalid);
        }
        let qop = Qop::parse(field("qop")?).ok_or(Refusal::Invalid)?;
        if !self.qops.contains(&qop) {
            return Err(Refusal::Invalid);
        }
        let nc = field("nc")?;
        let cnonce = field("cnonce")?;
        let ha1 = self.users.get(username).ok_or(Refusal::Invalid)?;
        let issued = self.nonce_issued(nonce).ok_or(Refusal::Invalid)?;

        let ha2 = match qop {
            Qop::Auth => self.algorithm.hash(format!("{method}:{uri}").as_bytes()),
            Qop::AuthInt => {
                let body = body_hash.ok_or(Refusal::Invalid)?;
                self.algorithm.hash(format!("{method}:{uri}:{body}").as_bytes())
            }
        };
        let expected = self.algorithm.hash(
            format!("{ha1}:{nonce}:{nc}:{cnonce}:{}:{ha2}", qop.as_str()).as_bytes(),
        );
        if !constant_time_eq(expected.as_bytes(), response.to_ascii_lowercase().as_bytes()) {
            return Err(Refusal::Invalid);
        }
        if now.saturating_sub(issued) > self.lifetime_secs() {
            return Err(Refusal::Stale);
        }
        let count = u64::from_str_radix(nc, 16).map_err(|_| Refusal::Invalid)?;
        self.advance_count(nonce, issued, count, now)?;
        Ok(username.to_string())
    }
}

/// Parses `key=value` pairs where values may be quoted strings.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let mut value = String::new();
            let mut end = quoted.len();
            let mut escaped = false;
            for (i, c) in quoted.char_indices() {
                if escaped {
                    value.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    end = i + 1;
                    break;
                } else {
                    value.push(c);
                }
            }
            rest = &quoted[end..];
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };
        params.insert(key, value);

        rest = rest.trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }
    params
}

impl Handler for DigestAuth {
    fn name(&self) -> &'static str {
        "digest_auth"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let params = match presented(ctx, "Digest") {
                Presented::Missing if self.optional => return,
                Presented::Credentials(raw) => Some(parse_params(raw)),
                _ => None,
            };
            let Some(params) = params else {
                ctx.fail(MeridianError::challenge("digest credentials required", self.challenge(false)))
                    .await;
                return;
            };

            let body_hash = if params.get("qop").map(String::as_str) == Some("auth-int") {
                match ctx.request_mut().body_mut().bytes(MAX_INTEGRITY_BODY).await {
                    Ok(body) => {
                        let hash = self.algorithm.hash(&body);
                        *ctx.request_mut().body_mut() = Body::from(body);
                        Some(hash)
                    }
                    Err(err) => {
                        ctx.fail(err).await;
                        return;
                    }
                }
            } else {
                None
            };

            let request = ctx.request();
            let uri = request
                .uri()
                .path_and_query()
                .map_or_else(|| request.path().to_string(), ToString::to_string);
            let result = self.check(
                &params,
                request.method().as_str(),
                &uri,
                body_hash.as_deref(),
                chrono::Utc::now().timestamp(),
            );
            match result {
                Ok(username) => identify(ctx, None, &username),
                Err(refusal) => {
                    let stale = refusal == Refusal::Stale;
                    let message = if stale { "digest nonce expired" } else { "invalid digest credentials" };
                    ctx.fail(MeridianError::challenge(message, self.challenge(stale))).await;
                }
            }
        })
    }
}
