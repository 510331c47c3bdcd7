//! Handlers and handler chains.
//!
//! Every stage of request processing (middleware, route handlers, the
//! 404/405 fallbacks) is a [`Handler`]. A route resolves to a [`Chain`],
//! which the [`Context`] walks with [`Context::next`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::Context;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A request handler or middleware.
///
/// Middleware that wants to observe the rest of the chain calls
/// [`Context::next`] and inspects the response afterwards; middleware that
/// rejects a request writes its response and calls [`Context::end`].
///
/// # Example
///
/// ```
/// use meridian_core::{BoxFuture, Context, Handler};
///
/// struct Hello;
///
/// impl Handler for Hello {
///     fn name(&self) -> &'static str {
///         "hello"
///     }
///
///     fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
///         Box::pin(async move {
///             let _ = ctx.text(http::StatusCode::OK, "hello").await;
///         })
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Handles the request.
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()>;
}

/// A handler backed by a closure. See [`handler_fn`].
pub struct FnHandler<F> {
    name: &'static str,
    f: F,
}

impl<F> Handler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        (self.f)(ctx)
    }
}

/// Wraps a closure returning a boxed future into a [`Handler`].
///
/// ```
/// use meridian_core::handler_fn;
///
/// let ping = handler_fn(|ctx| {
///     Box::pin(async move {
///         let _ = ctx.text(http::StatusCode::OK, "pong").await;
///     })
/// });
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    FnHandler { name: "fn", f }
}

/// Like [`handler_fn`] with a name for logs.
pub fn named_fn<F>(name: &'static str, f: F) -> FnHandler<F>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    FnHandler { name, f }
}

/// An ordered, cheaply clonable list of handlers.
#[derive(Clone, Default)]
pub struct Chain {
    handlers: Arc<[Arc<dyn Handler>]>,
}

impl Chain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a chain with `handler` appended.
    #[must_use]
    pub fn with(self, handler: impl Handler) -> Self {
        self.with_arc(Arc::new(handler))
    }

    /// Returns a chain with a shared handler appended.
    #[must_use]
    pub fn with_arc(self, handler: Arc<dyn Handler>) -> Self {
        let mut handlers = self.handlers.to_vec();
        handlers.push(handler);
        Self {
            handlers: handlers.into(),
        }
    }

    /// Returns `self` followed by `other`.
    #[must_use]
    pub fn join(&self, other: &Chain) -> Self {
        let handlers: Vec<_> = self
            .handlers
            .iter()
            .chain(other.handlers.iter())
            .cloned()
            .collect();
        Self {
            handlers: handlers.into(),
        }
    }

    /// Number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if the chain has no handlers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The handler at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(index)
    }

    /// Handler names in order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.iter().map(|h| h.name())
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl<H: Handler> From<H> for Chain {
    fn from(handler: H) -> Self {
        Chain::new().with(handler)
    }
}

impl FromIterator<Arc<dyn Handler>> for Chain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Handler>>>(iter: I) -> Self {
        Self {
            handlers: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Handler for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn call<'a>(&'a self, _ctx: &'a mut Context) -> BoxFuture<'a, ()> {
            Box::pin(async {})
        }
    }

    #[test]
    fn test_chain_building() {
        let a = Chain::new().with(Named("a")).with(Named("b"));
        let b = Chain::from(Named("c"));
        let joined = a.join(&b);

        assert_eq!(joined.len(), 3);
        assert_eq!(joined.names().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(a.len(), 2);
        assert!(Chain::new().is_empty());
    }

    #[test]
    fn test_fn_handler_name() {
        let h = named_fn("ping", |_ctx| Box::pin(async {}));
        assert_eq!(h.name(), "ping");
        assert_eq!(handler_fn(|_ctx| Box::pin(async {})).name(), "fn");
    }
}
