//! Request authentication.
//!
//! Three schemes identify the caller before authorization runs:
//!
//! - [`BasicAuth`]: `Authorization: Basic base64(user:password)`
//! - [`BearerAuth`]: signed `header.payload.signature` tokens
//! - [`DigestAuth`]: RFC 7616 challenge/response
//!
//! A successful check sets the [`USERID_PARAM`] and [`USERNAME_PARAM`]
//! params. A failed check answers 401 with a `WWW-Authenticate` challenge.
//! In optional mode a request without an `Authorization` header passes
//! through unauthenticated, leaving the decision to the policy layer.
//!
//! Only one scheme should be mounted per route.

mod basic;
mod bearer;
mod digest;

pub use basic::BasicAuth;
pub use bearer::{BearerAuth, Claims, HmacSha256, SigningMethod, TokenError};
pub use digest::{DigestAlgorithm, DigestAuth, Qop};

use http::header::AUTHORIZATION;
use meridian_core::Context;

/// Param holding the authenticated user id.
pub const USERID_PARAM: &str = "userid";
/// Param holding the authenticated user name.
pub const USERNAME_PARAM: &str = "username";

/// What the scheme found in the `Authorization` header.
pub(crate) enum Presented<'a> {
    /// No `Authorization` header.
    Missing,
    /// A header for another scheme, or malformed.
    Other,
    /// Credentials for this scheme.
    Credentials(&'a str),
}

/// Splits the `Authorization` header for `scheme` (case-insensitive).
pub(crate) fn presented<'a>(ctx: &'a Context, scheme: &str) -> Presented<'a> {
    let Some(value) = ctx.request().header(AUTHORIZATION) else {
        return Presented::Missing;
    };
    match value.split_once(' ') {
        Some((s, rest)) if s.eq_ignore_ascii_case(scheme) => Presented::Credentials(rest.trim()),
        _ => Presented::Other,
    }
}

/// Records the authenticated caller.
pub(crate) fn identify(ctx: &mut Context, userid: Option<&str>, username: &str) {
    ctx.set_param(USERID_PARAM, userid.unwrap_or(username));
    ctx.set_param(USERNAME_PARAM, username);
    tracing::debug!(username, "request authenticated");
}

/// Lower-case hex encoding.
pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
