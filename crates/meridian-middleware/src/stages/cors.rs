//! CORS (Cross-Origin Resource Sharing) middleware.
//!
//! Allowed origins are host patterns in a [`MatchTree`] with `.` `/` `:`
//! delimiters, so `https://*.example.com` admits `https://api.example.com`
//! but not `https://a.b.example.com`.
//!
//! ## Preflight Requests
//!
//! An `OPTIONS` request carrying `Origin` and
//! `Access-Control-Request-Method` is answered here with `204 No Content`
//! (or 403 when the origin, method or a requested header is not allowed);
//! the rest of the chain does not run.
//!
//! ## Example
//!
//! ```
//! use meridian_middleware::stages::CorsMiddleware;
//! use http::Method;
//! use std::time::Duration;
//!
//! let cors = CorsMiddleware::builder()
//!     .allow_origin("https://app.example.com")
//!     .allow_origin("https://*.internal.example.com")
//!     .allow_methods([Method::GET, Method::POST, Method::DELETE])
//!     .allow_headers(["Content-Type", "Authorization", "X-Request-ID"])
//!     .allow_credentials(true)
//!     .max_age(Duration::from_secs(3600))
//!     .build()
//!     .unwrap();
//! ```

use std::time::Duration;

use http::{HeaderMap, HeaderValue, Method, StatusCode};
use meridian_core::{BoxFuture, Context, Handler, MeridianError};
use meridian_router::{Delimiters, MatchTree, RouterError};

/// CORS header names.
pub mod headers {
    /// `Access-Control-Allow-Origin` header.
    pub const ALLOW_ORIGIN: &str = "access-control-allow-origin";
    /// `Access-Control-Allow-Methods` header.
    pub const ALLOW_METHODS: &str = "access-control-allow-methods";
    /// `Access-Control-Allow-Headers` header.
    pub const ALLOW_HEADERS: &str = "access-control-allow-headers";
    /// `Access-Control-Allow-Credentials` header.
    pub const ALLOW_CREDENTIALS: &str = "access-control-allow-credentials";
    /// `Access-Control-Max-Age` header.
    pub const MAX_AGE: &str = "access-control-max-age";
    /// `Access-Control-Expose-Headers` header.
    pub const EXPOSE_HEADERS: &str = "access-control-expose-headers";
    /// `Access-Control-Request-Method` header (preflight).
    pub const REQUEST_METHOD: &str = "access-control-request-method";
    /// `Access-Control-Request-Headers` header (preflight).
    pub const REQUEST_HEADERS: &str = "access-control-request-headers";
    /// `Origin` header.
    pub const ORIGIN: &str = "origin";
    /// `Vary` header.
    pub const VARY: &str = "vary";
}

/// The set of allowed origins.
#[derive(Debug, Clone)]
pub enum AllowedOrigins {
    /// Any origin (`*`).
    Any,
    /// Origins matching one of the patterns.
    Patterns(MatchTree<()>),
}

impl AllowedOrigins {
    /// Checks if an origin is allowed.
    #[must_use]
    pub fn is_allowed(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Patterns(tree) => tree.find(&origin.to_ascii_lowercase()).is_some(),
        }
    }

    fn header_value(&self, origin: &str, credentials: bool) -> Option<HeaderValue> {
        match self {
            Self::Any if !credentials => Some(HeaderValue::from_static("*")),
            _ if self.is_allowed(origin) => HeaderValue::from_str(origin).ok(),
            _ => None,
        }
    }
}

/// Configuration for CORS middleware.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    any_origin: bool,
    origins: Vec<String>,
    allowed_methods: Vec<Method>,
    allowed_headers: Vec<String>,
    expose_headers: Vec<String>,
    allow_credentials: bool,
    max_age: Option<Duration>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            any_origin: false,
            origins: Vec::new(),
            allowed_methods: vec![
                Method::GET,
                Method::HEAD,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::PATCH,
            ],
            allowed_headers: vec![
                "content-type".to_string(),
                "authorization".to_string(),
                "x-request-id".to_string(),
            ],
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age: Some(Duration::from_secs(86400)),
        }
    }
}

/// Builder for [`CorsMiddleware`].
#[derive(Debug, Clone, Default)]
pub struct CorsBuilder {
    config: CorsConfig,
}

impl CorsBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows any origin. With credentials enabled the request origin is
    /// echoed instead of `*`.
    #[must_use]
    pub fn allow_any_origin(mut self) -> Self {
        self.config.any_origin = true;
        self
    }

    /// Adds an allowed origin pattern.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.origins.push(origin.into().to_ascii_lowercase());
        self
    }

    /// Replaces the allowed origin patterns.
    #[must_use]
    pub fn allow_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.origins = origins
            .into_iter()
            .map(|o| o.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Sets the allowed methods.
    #[must_use]
    pub fn allow_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.config.allowed_methods = methods.into_iter().collect();
        self
    }

    /// Adds an allowed request header.
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.config.allowed_headers.push(header.into().to_ascii_lowercase());
        self
    }

    /// Sets the allowed request headers. `*` allows any.
    #[must_use]
    pub fn allow_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_headers = headers
            .into_iter()
            .map(|h| h.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Sets headers exposed to scripts.
    #[must_use]
    pub fn expose_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.expose_headers = headers
            .into_iter()
            .map(|h| h.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Sets whether credentials are allowed.
    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.config.allow_credentials = allow;
        self
    }

    /// Sets the preflight cache lifetime.
    #[must_use]
    pub fn max_age(mut self, duration: Duration) -> Self {
        self.config.max_age = Some(duration);
        self
    }

    /// Disables preflight caching.
    #[must_use]
    pub fn no_max_age(mut self) -> Self {
        self.config.max_age = None;
        self
    }

    /// Builds the middleware.
    ///
    /// # Errors
    ///
    /// Returns an error if an origin pattern is malformed.
    pub fn build(self) -> Result<CorsMiddleware, RouterError> {
        let origins = if self.config.any_origin {
            AllowedOrigins::Any
        } else {
            let mut tree = MatchTree::new(Delimiters::Host);
            for origin in &self.config.origins {
                tree.insert(origin, ())?;
            }
            AllowedOrigins::Patterns(tree)
        };
        Ok(CorsMiddleware {
            config: self.config,
            origins,
        })
    }
}

/// CORS middleware.
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    config: CorsConfig,
    origins: AllowedOrigins,
}

impl CorsMiddleware {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> CorsBuilder {
        CorsBuilder::new()
    }

    /// Allows any origin, method and header. Development use only.
    #[must_use]
    pub fn permissive() -> Self {
        let config = CorsConfig {
            any_origin: true,
            allowed_methods: vec![
                Method::GET,
                Method::HEAD,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::PATCH,
                Method::OPTIONS,
            ],
            allowed_headers: vec!["*".to_string()],
            expose_headers: vec!["*".to_string()],
            ..CorsConfig::default()
        };
        Self {
            config,
            origins: AllowedOrigins::Any,
        }
    }

    /// The allowed origins.
    #[must_use]
    pub fn origins(&self) -> &AllowedOrigins {
        &self.origins
    }

    fn is_preflight(ctx: &Context) -> bool {
        let request = ctx.request();
        request.method() == Method::OPTIONS
            && request.headers().contains_key(headers::ORIGIN)
            && request.headers().contains_key(headers::REQUEST_METHOD)
    }

    /// Why a preflight is refused, if it is.
    fn check_preflight(&self, ctx: &Context, origin: &str) -> Option<String> {
        if !self.origins.is_allowed(origin) {
            return Some("origin not allowed".to_string());
        }
        let request = ctx.request();
        if let Some(method) = request
            .header(headers::REQUEST_METHOD)
            .and_then(|m| m.parse::<Method>().ok())
        {
            if !self.config.allowed_methods.contains(&method) {
                return Some(format!("method {method} not allowed"));
            }
        }
        if let Some(requested) = request.header(headers::REQUEST_HEADERS) {
            let any = self.config.allowed_headers.iter().any(|h| h == "*");
            for header in requested.split(',').map(|h| h.trim().to_ascii_lowercase()) {
                if !header.is_empty() && !any && !self.config.allowed_headers.contains(&header) {
                    return Some(format!("header '{header}' not allowed"));
                }
            }
        }
        None
    }

    fn add_origin_headers(&self, headers: &mut HeaderMap, origin: &str) {
        if let Some(value) = self
            .origins
            .header_value(origin, self.config.allow_credentials)
        {
            headers.insert(headers::ALLOW_ORIGIN, value);
        }
        if self.config.allow_credentials {
            headers.insert(headers::ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
    }

    fn add_preflight_headers(&self, headers: &mut HeaderMap, origin: &str) {
        self.add_origin_headers(headers, origin);
        let methods: Vec<&str> = self.config.allowed_methods.iter().map(Method::as_str).collect();
        if let Ok(value) = HeaderValue::from_str(&methods.join(", ")) {
            headers.insert(headers::ALLOW_METHODS, value);
        }
        if !self.config.allowed_headers.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.config.allowed_headers.join(", ")) {
                headers.insert(headers::ALLOW_HEADERS, value);
            }
        }
        if let Some(max_age) = self.config.max_age {
            headers.insert(headers::MAX_AGE, HeaderValue::from(max_age.as_secs()));
        }
        headers.append(
            headers::VARY,
            HeaderValue::from_static(
                "Origin, Access-Control-Request-Method, Access-Control-Request-Headers",
            ),
        );
    }
}

impl Handler for CorsMiddleware {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(origin) = ctx.request().header(headers::ORIGIN).map(String::from) else {
                return;
            };

            if Self::is_preflight(ctx) {
                if let Some(reason) = self.check_preflight(ctx, &origin) {
                    ctx.fail(MeridianError::authorization(format!("CORS preflight: {reason}")))
                        .await;
                    return;
                }
                self.add_preflight_headers(ctx.writer().headers_mut(), &origin);
                ctx.write_header(StatusCode::NO_CONTENT);
                ctx.end();
                return;
            }

            if self.origins.is_allowed(&origin) {
                let headers = ctx.writer().headers_mut();
                self.add_origin_headers(headers, &origin);
                if !self.config.expose_headers.is_empty() {
                    if let Ok(value) = HeaderValue::from_str(&self.config.expose_headers.join(", ")) {
                        headers.insert(headers::EXPOSE_HEADERS, value);
                    }
                }
                headers.append(headers::VARY, HeaderValue::from_static("Origin"));
            }
        })
    }
}
