//! Request deadline middleware.
//!
//! Runs the rest of the chain under a deadline. On expiry the remaining
//! handlers are dropped, the request's cancellation token fires, and a 504
//! envelope is written unless the response was already started.

use std::time::Duration;

use meridian_core::{BoxFuture, Context, Handler, MeridianError};

/// Deadline middleware.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutMiddleware {
    limit: Duration,
}

impl TimeoutMiddleware {
    /// Creates a middleware enforcing `limit`.
    #[must_use]
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    /// The enforced limit.
    #[must_use]
    pub fn limit(&self) -> Duration {
        self.limit
    }
}

impl Handler for TimeoutMiddleware {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if tokio::time::timeout(self.limit, ctx.next()).await.is_err() {
                ctx.cancellation().cancel();
                ctx.fail(MeridianError::timeout(format!(
                    "request exceeded {}ms",
                    self.limit.as_millis()
                )))
                .await;
            }
        })
    }
}
