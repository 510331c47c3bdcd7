//! Double-submit CSRF protection.
//!
//! Safe requests (GET, HEAD, OPTIONS, TRACE) get a random token cookie when
//! they do not already carry one. Unsafe requests must echo the cookie value
//! in the `X-CSRF-Token` header; otherwise they are refused with 403.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderValue, Method};
use meridian_core::{BoxFuture, Context, Handler, MeridianError};
use rand::RngCore;

/// Default cookie carrying the token.
pub const CSRF_COOKIE: &str = "csrf_token";
/// Default header echoing the token.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// CSRF middleware.
#[derive(Debug, Clone)]
pub struct CsrfMiddleware {
    cookie: String,
    header: String,
    secure: bool,
}

impl Default for CsrfMiddleware {
    fn default() -> Self {
        Self {
            cookie: CSRF_COOKIE.to_string(),
            header: CSRF_HEADER.to_string(),
            secure: false,
        }
    }
}

impl CsrfMiddleware {
    /// Creates the middleware with the default cookie and header names.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `name` as the token cookie.
    #[must_use]
    pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie = name.into();
        self
    }

    /// Uses `name` as the token header.
    #[must_use]
    pub fn header_name(mut self, name: impl Into<String>) -> Self {
        self.header = name.into().to_ascii_lowercase();
        self
    }

    /// Marks the issued cookie `Secure`.
    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    fn cookie_token<'r>(&self, ctx: &'r Context) -> Option<&'r str> {
        ctx.request()
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie)
            .map(|(_, value)| value)
            .filter(|value| !value.is_empty())
    }

    fn issue(&self, ctx: &mut Context) {
        let token = new_token();
        let mut cookie = format!("{}={token}; Path=/; SameSite=Lax", self.cookie);
        if self.secure {
            cookie.push_str("; Secure");
        }
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            ctx.writer().headers_mut().append(SET_COOKIE, value);
        }
        ctx.set_param("csrf_token", token);
    }
}

/// A fresh 32-byte token, base64url encoded.
#[must_use]
pub fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compares without short-circuiting on the first differing byte.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn is_safe(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}

impl Handler for CsrfMiddleware {
    fn name(&self) -> &'static str {
        "csrf"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let cookie = self.cookie_token(ctx).map(String::from);
            if is_safe(ctx.request().method()) {
                match cookie {
                    Some(token) => ctx.set_param("csrf_token", token),
                    None => self.issue(ctx),
                }
                return;
            }

            let header = ctx.request().header(self.header.as_str());
            let valid = match (cookie.as_deref(), header) {
                (Some(cookie), Some(header)) => constant_time_eq(cookie.as_bytes(), header.as_bytes()),
                _ => false,
            };
            if !valid {
                ctx.fail(MeridianError::authorization("CSRF token missing or invalid"))
                    .await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{get, ok, request, run};
    use http::StatusCode;

    #[tokio::test]
    async fn test_safe_request_issues_cookie() {
        let (ctx, recording) = run(CsrfMiddleware::new(), ok(), get("/form")).await;

        let cookie = recording.header("set-cookie").unwrap();
        assert!(cookie.starts_with("csrf_token="));
        let token = ctx.param("csrf_token").unwrap();
        assert!(cookie.contains(token));
        assert_eq!(recording.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_existing_cookie_not_reissued() {
        let req = get("/form").with_header("cookie", "theme=dark; csrf_token=abc");
        let (ctx, recording) = run(CsrfMiddleware::new(), ok(), req).await;
        assert!(recording.header("set-cookie").is_none());
        assert_eq!(ctx.param("csrf_token"), Some("abc"));
    }

    #[tokio::test]
    async fn test_post_with_matching_header_passes() {
        let req = request(Method::POST, "/submit")
            .with_header("cookie", "csrf_token=abc")
            .with_header(CSRF_HEADER, "abc");
        let (_, recording) = run(CsrfMiddleware::new(), ok(), req).await;
        assert_eq!(recording.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_post_with_mismatch_forbidden() {
        let req = request(Method::POST, "/submit")
            .with_header("cookie", "csrf_token=abc")
            .with_header(CSRF_HEADER, "abd");
        let (_, recording) = run(CsrfMiddleware::new(), ok(), req).await;
        assert_eq!(recording.status(), StatusCode::FORBIDDEN);

        let req = request(Method::DELETE, "/submit").with_header(CSRF_HEADER, "abc");
        let (_, recording) = run(CsrfMiddleware::new(), ok(), req).await;
        assert_eq!(recording.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(new_token(), new_token());
        assert_eq!(new_token().len(), 43);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
