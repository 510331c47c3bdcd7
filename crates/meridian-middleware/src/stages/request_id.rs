//! Request ID middleware.
//!
//! Every request gets an identifier used to correlate logs, error envelopes
//! and the PBAC forbidden body:
//!
//! 1. **X-Request-ID header**: adopted when incoming ids are trusted and the
//!    value is well formed
//! 2. **Generated UUID v7**: otherwise
//!
//! The id is echoed in the `X-Request-ID` response header.

use http::HeaderValue;
use meridian_core::{BoxFuture, Context, Handler, RequestId};

/// The header name for request ID propagation.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Middleware that generates or adopts request IDs.
///
/// # Example
///
/// ```
/// use meridian_middleware::stages::RequestIdMiddleware;
///
/// // Behind a proxy that already assigns ids:
/// let middleware = RequestIdMiddleware::trust_incoming();
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestIdMiddleware {
    /// Whether to adopt incoming `X-Request-ID` headers.
    trust_incoming: bool,
}

impl RequestIdMiddleware {
    /// Creates a middleware that always generates fresh ids.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a middleware that adopts incoming `X-Request-ID` headers.
    #[must_use]
    pub fn trust_incoming() -> Self {
        Self {
            trust_incoming: true,
        }
    }

    fn extract_request_id(&self, ctx: &Context) -> Option<RequestId> {
        if !self.trust_incoming {
            return None;
        }
        ctx.request()
            .header(REQUEST_ID_HEADER)
            .and_then(RequestId::parse)
    }
}

impl Handler for RequestIdMiddleware {
    fn name(&self) -> &'static str {
        "request_id"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let request_id = self
                .extract_request_id(ctx)
                .unwrap_or_else(RequestId::new);

            if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
                ctx.writer()
                    .headers_mut()
                    .insert(REQUEST_ID_HEADER, value);
            }
            ctx.set_request_id(request_id);
        })
    }
}
