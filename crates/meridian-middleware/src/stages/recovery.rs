//! Panic recovery middleware.
//!
//! Runs the rest of the chain under `catch_unwind`. A panic is logged at
//! error level together with a captured backtrace and, if nothing has been
//! written yet, answered with a 500 error envelope.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use meridian_core::{BoxFuture, Context, Handler, MeridianError, RequestId};

/// A recovered panic.
#[derive(Debug, thiserror::Error)]
#[error("panic: {message}")]
pub struct PanicError {
    /// The panic payload, when it was a string.
    pub message: String,
    /// Backtrace captured at recovery.
    pub backtrace: String,
}

impl PanicError {
    fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self {
            message,
            backtrace: Backtrace::force_capture().to_string(),
        }
    }
}

/// Converts panics in later handlers into 500 responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryMiddleware;

impl RecoveryMiddleware {
    /// Creates the middleware.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Handler for RecoveryMiddleware {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let outcome = AssertUnwindSafe(ctx.next()).catch_unwind().await;
            if let Err(payload) = outcome {
                let panic = PanicError::from_payload(payload.as_ref());
                tracing::error!(
                    request_id = ctx.request_id().map(RequestId::as_str),
                    http.method = %ctx.request().method(),
                    http.path = ctx.request().path(),
                    panic = %panic.message,
                    backtrace = %panic.backtrace,
                    "handler panicked"
                );
                ctx.fail(MeridianError::internal_with_source(
                    "handler panicked",
                    panic,
                ))
                .await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{get, ok, run};
    use http::StatusCode;
    use meridian_core::named_fn;

    #[tokio::test]
    async fn test_panic_becomes_500() {
        let boom = named_fn("boom", |_ctx| Box::pin(async { panic!("boom") }));
        let (ctx, recording) = run(RecoveryMiddleware::new(), boom, get("/x")).await;

        assert_eq!(recording.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_slice(&recording.body()).unwrap();
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert!(ctx.error().is_some());
    }

    #[tokio::test]
    async fn test_panic_after_write_keeps_status() {
        let partial = named_fn("partial", |ctx| {
            Box::pin(async move {
                let _ = ctx.text(StatusCode::ACCEPTED, "partial").await;
                panic!("late");
            })
        });
        let (_, recording) = run(RecoveryMiddleware::new(), partial, get("/x")).await;

        assert_eq!(recording.status(), StatusCode::ACCEPTED);
        assert_eq!(recording.text(), "partial");
    }

    #[tokio::test]
    async fn test_no_panic_passes_through() {
        let (ctx, recording) = run(RecoveryMiddleware::new(), ok(), get("/x")).await;
        assert_eq!(recording.status(), StatusCode::OK);
        assert!(ctx.error().is_none());
    }

    #[test]
    fn test_payload_message() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(PanicError::from_payload(payload.as_ref()).message, "owned");
    }
}
