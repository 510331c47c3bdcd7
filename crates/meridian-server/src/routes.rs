//! Route table: method trees of handler chains plus global middleware.
//!
//! Global middleware runs before routing, so a rewrite installed with
//! [`Routes::use_middleware`] changes the path the router sees. Routing then
//! replaces the remainder of the chain with the matched route's handlers,
//! the 405 chain when only other methods match, or the 404 chain.
//!
//! # Example
//!
//! ```rust
//! use http::{Method, StatusCode};
//! use meridian_core::{named_fn, Context, Request};
//! use meridian_server::Routes;
//!
//! # tokio_test::block_on(async {
//! let mut routes = Routes::new();
//! routes
//!     .get("/users/:id", named_fn("user", |ctx| Box::pin(async move {
//!         let id = ctx.param("id").unwrap_or_default().to_string();
//!         let _ = ctx.text(StatusCode::OK, &id).await;
//!     })))
//!     .unwrap();
//!
//! let (mut ctx, recording) = Context::recorded(Request::new(Method::GET, "/users/7".parse().unwrap()));
//! routes.dispatch(&mut ctx).await;
//! ctx.finish().await.unwrap();
//! assert_eq!(recording.text(), "7");
//! assert_eq!(ctx.route(), Some("/users/:id"));
//! # });
//! ```

use std::sync::{Arc, OnceLock};

use http::Method;
use meridian_core::{named_fn, BoxFuture, Chain, Context, Handler, MeridianError};
use meridian_router::{Lookup, MethodKind, RouteMatch, Router, RouterError};

/// Param holding the matched route pattern.
pub const ROUTE_PARAM: &str = "route";

#[derive(Clone)]
struct Table {
    router: Router<Chain>,
    not_found: Chain,
    method_not_allowed: Option<Chain>,
}

/// A route table.
pub struct Routes {
    table: Table,
    middleware: Chain,
    entry: OnceLock<Chain>,
}

impl Default for Routes {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Routes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routes")
            .field("routes", &self.table.router.len())
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

impl Routes {
    /// Creates an empty table answering 404 to everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Table {
                router: Router::new(),
                not_found: Chain::from(named_fn("not_found", |ctx| {
                    Box::pin(async move {
                        let message = format!("no route for {}", ctx.request().path());
                        ctx.fail(MeridianError::not_found(message)).await;
                    })
                })),
                method_not_allowed: None,
            },
            middleware: Chain::new(),
            entry: OnceLock::new(),
        }
    }

    fn touch(&mut self) -> &mut Table {
        self.entry = OnceLock::new();
        &mut self.table
    }

    /// Appends a middleware run for every request, before routing.
    pub fn use_middleware(&mut self, handler: impl Handler) -> &mut Self {
        self.entry = OnceLock::new();
        self.middleware = std::mem::take(&mut self.middleware).with(handler);
        self
    }

    /// Registers `chain` for `method` and `pattern`. A repeated
    /// registration replaces the earlier chain.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed patterns or unknown validators.
    pub fn add(
        &mut self,
        method: &Method,
        pattern: &str,
        chain: impl Into<Chain>,
    ) -> Result<&mut Self, RouterError> {
        self.touch().router.add(method, pattern, chain.into())?;
        Ok(self)
    }

    /// Registers `chain` for every method lacking an explicit registration.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed patterns or unknown validators.
    pub fn any(&mut self, pattern: &str, chain: impl Into<Chain>) -> Result<&mut Self, RouterError> {
        self.touch().router.insert(MethodKind::Any, pattern, chain.into())?;
        Ok(self)
    }

    /// Registers a `GET` route.
    ///
    /// # Errors
    ///
    /// See [`add`](Self::add).
    pub fn get(&mut self, pattern: &str, chain: impl Into<Chain>) -> Result<&mut Self, RouterError> {
        self.add(&Method::GET, pattern, chain)
    }

    /// Registers a `POST` route.
    ///
    /// # Errors
    ///
    /// See [`add`](Self::add).
    pub fn post(&mut self, pattern: &str, chain: impl Into<Chain>) -> Result<&mut Self, RouterError> {
        self.add(&Method::POST, pattern, chain)
    }

    /// Registers a `PUT` route.
    ///
    /// # Errors
    ///
    /// See [`add`](Self::add).
    pub fn put(&mut self, pattern: &str, chain: impl Into<Chain>) -> Result<&mut Self, RouterError> {
        self.add(&Method::PUT, pattern, chain)
    }

    /// Registers a `DELETE` route.
    ///
    /// # Errors
    ///
    /// See [`add`](Self::add).
    pub fn delete(
        &mut self,
        pattern: &str,
        chain: impl Into<Chain>,
    ) -> Result<&mut Self, RouterError> {
        self.add(&Method::DELETE, pattern, chain)
    }

    /// Replaces the chain run when nothing matches.
    pub fn not_found(&mut self, chain: impl Into<Chain>) -> &mut Self {
        self.touch().not_found = chain.into();
        self
    }

    /// Replaces the chain run when the path matches under other methods
    /// only. The default answers 405 with an `Allow` header.
    pub fn method_not_allowed(&mut self, chain: impl Into<Chain>) -> &mut Self {
        self.touch().method_not_allowed = Some(chain.into());
        self
    }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.router.len()
    }

    /// Returns `true` if no route is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.router.is_empty()
    }

    /// The chain every request starts with: global middleware, then routing.
    #[must_use]
    pub fn entry(&self) -> &Chain {
        self.entry.get_or_init(|| {
            self.middleware.clone().with(Resolve {
                table: Arc::new(self.table.clone()),
            })
        })
    }

    /// Runs a request through the table. The caller finishes the response.
    pub async fn dispatch(&self, ctx: &mut Context) {
        ctx.run(self.entry().clone()).await;
    }
}

impl Handler for Routes {
    fn name(&self) -> &'static str {
        "routes"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        let entry = self.entry().clone();
        Box::pin(async move { ctx.set_handler(0, entry) })
    }
}

struct Resolve {
    table: Arc<Table>,
}

impl Resolve {
    fn lookup<'a>(&'a self, method: &Method, path: &str) -> Lookup<'a, Chain> {
        let lookup = self.table.router.lookup(method, path);
        if *method == Method::HEAD && !lookup.is_found() {
            if let Some(found) = self.table.router.find(MethodKind::Get, path) {
                return Lookup::Found(found);
            }
        }
        lookup
    }

    fn method_not_allowed(&self, allowed: Vec<Method>) -> Chain {
        if let Some(chain) = &self.table.method_not_allowed {
            return chain.clone();
        }
        Chain::from(named_fn("method_not_allowed", move |ctx| {
            let allowed = allowed.clone();
            Box::pin(async move {
                let message = format!("{} not allowed", ctx.request().method());
                ctx.fail(MeridianError::method_not_allowed(message, allowed))
                    .await;
            })
        }))
    }
}

impl Handler for Resolve {
    fn name(&self) -> &'static str {
        "router"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let method = ctx.request().method().clone();
            let path = ctx.request().path().to_string();
            let chain = match self.lookup(&method, &path) {
                Lookup::Found(RouteMatch {
                    value,
                    pattern,
                    params,
                }) => {
                    for (name, captured) in &params {
                        ctx.params_mut().push(name, captured);
                    }
                    ctx.set_param(ROUTE_PARAM, pattern);
                    tracing::debug!(http.method = %method, http.path = %path, route = pattern, "route matched");
                    value.clone()
                }
                Lookup::MethodNotAllowed(allowed) => self.method_not_allowed(allowed),
                Lookup::NotFound => self.table.not_found.clone(),
            };
            ctx.set_handler(0, chain);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use meridian_core::{Recording, Request};
    use parking_lot::Mutex;

    fn reply(body: &'static str) -> impl Handler {
        named_fn(body, move |ctx| {
            Box::pin(async move {
                let _ = ctx.text(StatusCode::OK, body).await;
            })
        })
    }

    async fn send(routes: &Routes, method: Method, uri: &str) -> (Context, Recording) {
        let (mut ctx, recording) = Context::recorded(Request::new(method, uri.parse().unwrap()));
        routes.dispatch(&mut ctx).await;
        ctx.finish().await.unwrap();
        (ctx, recording)
    }

    #[tokio::test]
    async fn test_const_route_preferred() {
        let mut routes = Routes::new();
        routes.get("/api/v1/:list", reply("list")).unwrap();
        routes.get("/api/v1/users", reply("users")).unwrap();

        let (ctx, recording) = send(&routes, Method::GET, "/api/v1/users").await;
        assert_eq!(recording.text(), "users");
        assert_eq!(ctx.params().len(), 1);
        assert_eq!(ctx.route(), Some("/api/v1/users"));

        let (ctx, recording) = send(&routes, Method::GET, "/api/v1/orders").await;
        assert_eq!(recording.text(), "list");
        assert_eq!(ctx.param("list"), Some("orders"));
    }

    #[tokio::test]
    async fn test_not_found_and_method_not_allowed() {
        let mut routes = Routes::new();
        routes.get("/items", reply("items")).unwrap();
        routes.put("/items", reply("items")).unwrap();

        let (_, recording) = send(&routes, Method::GET, "/missing").await;
        assert_eq!(recording.status(), StatusCode::NOT_FOUND);

        let (_, recording) = send(&routes, Method::POST, "/items").await;
        assert_eq!(recording.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(recording.header("allow").as_deref(), Some("GET, PUT"));
    }

    #[tokio::test]
    async fn test_custom_not_found() {
        let mut routes = Routes::new();
        routes.not_found(named_fn("custom", |ctx| {
            Box::pin(async move {
                let _ = ctx.text(StatusCode::NOT_FOUND, "nothing here").await;
            })
        }));
        let (_, recording) = send(&routes, Method::GET, "/x").await;
        assert_eq!(recording.text(), "nothing here");
    }

    #[tokio::test]
    async fn test_head_falls_back_to_get() {
        let mut routes = Routes::new();
        routes.get("/page", reply("page")).unwrap();
        let (_, recording) = send(&routes, Method::HEAD, "/page").await;
        assert_eq!(recording.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_middleware_wraps_route_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut routes = Routes::new();
        let seen = Arc::clone(&log);
        routes.use_middleware(named_fn("outer", move |ctx| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.lock().push("before");
                ctx.next().await;
                seen.lock().push(if ctx.route().is_some() { "after:routed" } else { "after" });
            })
        }));
        let seen = Arc::clone(&log);
        routes
            .get("/x", named_fn("handler", move |_ctx| {
                let seen = Arc::clone(&seen);
                Box::pin(async move { seen.lock().push("handler") })
            }))
            .unwrap();

        send(&routes, Method::GET, "/x").await;
        assert_eq!(*log.lock(), vec!["before", "handler", "after:routed"]);
    }

    #[tokio::test]
    async fn test_mutation_after_dispatch_rebuilds_entry() {
        let mut routes = Routes::new();
        routes.get("/a", reply("a")).unwrap();
        let (_, recording) = send(&routes, Method::GET, "/b").await;
        assert_eq!(recording.status(), StatusCode::NOT_FOUND);

        routes.get("/b", reply("b")).unwrap();
        let (_, recording) = send(&routes, Method::GET, "/b").await;
        assert_eq!(recording.text(), "b");
    }

    #[tokio::test]
    async fn test_nested_as_handler() {
        let mut inner = Routes::new();
        inner.get("/inner", reply("inner")).unwrap();

        let (mut ctx, recording) = Context::recorded(Request::new(Method::GET, "/inner".parse().unwrap()));
        ctx.run(Chain::from(inner)).await;
        ctx.finish().await.unwrap();
        assert_eq!(recording.text(), "inner");
    }
}
