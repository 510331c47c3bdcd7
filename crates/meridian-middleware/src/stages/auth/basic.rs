//! HTTP Basic authentication.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use meridian_core::{BoxFuture, Context, Handler, MeridianError};

use super::{identify, presented, Presented};

/// Basic authentication middleware.
///
/// Credentials are encoded once at construction, so a request is checked
/// with a single map lookup on the header value as sent.
///
/// # Example
///
/// ```
/// use meridian_middleware::stages::BasicAuth;
///
/// let auth = BasicAuth::new("admin")
///     .user("alice", "wonderland")
///     .user("bob", "builder");
/// assert_eq!(auth.user_count(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct BasicAuth {
    realm: String,
    credentials: HashMap<String, String>,
    optional: bool,
}

impl BasicAuth {
    /// Creates an authenticator for `realm` with no users.
    #[must_use]
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            credentials: HashMap::new(),
            optional: false,
        }
    }

    /// Adds a user.
    #[must_use]
    pub fn user(mut self, username: &str, password: &str) -> Self {
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        self.credentials.insert(encoded, username.to_string());
        self
    }

    /// Lets requests without credentials through unauthenticated.
    #[must_use]
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// Number of configured users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.credentials.len()
    }

    /// Returns the user name for an encoded credential.
    #[must_use]
    pub fn verify(&self, encoded: &str) -> Option<&str> {
        self.credentials.get(encoded).map(String::as_str)
    }

    fn challenge(&self) -> String {
        format!("Basic realm=\"{}\", charset=\"UTF-8\"", self.realm)
    }
}

impl Handler for BasicAuth {
    fn name(&self) -> &'static str {
        "basic_auth"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let username = match presented(ctx, "Basic") {
                Presented::Missing if self.optional => return,
                Presented::Credentials(encoded) => self.verify(encoded).map(str::to_string),
                _ => None,
            };
            match username {
                Some(username) => identify(ctx, None, &username),
                None => {
                    ctx.fail(MeridianError::challenge("invalid credentials", self.challenge()))
                        .await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::auth::{USERID_PARAM, USERNAME_PARAM};
    use crate::test_support::{get, ok, run};
    use http::StatusCode;

    fn auth() -> BasicAuth {
        BasicAuth::new("test").user("alice", "secret")
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
    }

    #[tokio::test]
    async fn test_valid_credentials() {
        let req = get("/").with_header("authorization", &basic("alice", "secret"));
        let (ctx, recording) = run(auth(), ok(), req).await;
        assert_eq!(recording.status(), StatusCode::OK);
        assert_eq!(ctx.param(USERNAME_PARAM), Some("alice"));
        assert_eq!(ctx.param(USERID_PARAM), Some("alice"));
    }

    #[tokio::test]
    async fn test_wrong_password_challenged() {
        let req = get("/").with_header("authorization", &basic("alice", "guess"));
        let (ctx, recording) = run(auth(), ok(), req).await;
        assert_eq!(recording.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            recording.header("www-authenticate").as_deref(),
            Some("Basic realm=\"test\", charset=\"UTF-8\"")
        );
        assert!(ctx.param(USERNAME_PARAM).is_none());
    }

    #[tokio::test]
    async fn test_missing_header() {
        let (_, recording) = run(auth(), ok(), get("/")).await;
        assert_eq!(recording.status(), StatusCode::UNAUTHORIZED);

        let (ctx, recording) = run(auth().optional(true), ok(), get("/")).await;
        assert_eq!(recording.status(), StatusCode::OK);
        assert!(ctx.param(USERNAME_PARAM).is_none());
    }

    #[tokio::test]
    async fn test_other_scheme_rejected_even_when_optional() {
        let req = get("/").with_header("authorization", "Bearer abc");
        let (_, recording) = run(auth().optional(true), ok(), req).await;
        assert_eq!(recording.status(), StatusCode::UNAUTHORIZED);
    }
}
