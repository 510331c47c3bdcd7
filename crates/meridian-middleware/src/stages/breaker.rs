//! Circuit breaker middleware.
//!
//! Wraps the rest of the chain with the breaker of the matched route (or a
//! fixed name). A final status of 500 or above counts as a failure; anything
//! else as a success. Requests refused by an open or gated half-open breaker
//! get a 503 without reaching the handler.

use meridian_core::{BoxFuture, Context, Handler, MeridianError};

use crate::breaker::{Admission, BreakerStore};

/// Circuit breaker middleware over a shared [`BreakerStore`].
#[derive(Debug, Clone)]
pub struct BreakerMiddleware {
    store: BreakerStore,
    name: Option<String>,
}

impl BreakerMiddleware {
    /// Creates a middleware keyed by the matched route pattern.
    #[must_use]
    pub fn new(store: BreakerStore) -> Self {
        Self { store, name: None }
    }

    /// Creates a middleware that always uses the breaker `name`.
    #[must_use]
    pub fn named(store: BreakerStore, name: impl Into<String>) -> Self {
        Self {
            store,
            name: Some(name.into()),
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &BreakerStore {
        &self.store
    }

    fn breaker_name(&self, ctx: &Context) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => ctx
                .route()
                .map_or_else(|| ctx.request().path().to_string(), String::from),
        }
    }
}

impl Handler for BreakerMiddleware {
    fn name(&self) -> &'static str {
        "breaker"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let name = self.breaker_name(ctx);
            if let Admission::Rejected(state) = self.store.admit(&name) {
                ctx.fail(MeridianError::unavailable(format!(
                    "circuit breaker {name} is {state}"
                )))
                .await;
                return;
            }

            ctx.next().await;

            let failed = ctx.status().is_server_error()
                || ctx
                    .error()
                    .is_some_and(|err| err.status_code().is_server_error());
            self.store.record(&name, !failed);
        })
    }
}
