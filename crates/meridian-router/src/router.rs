//! High-level router API.
//!
//! This module provides the main [`Router`] struct which is the primary
//! interface for building and matching routes.

use std::sync::Arc;

use http::Method;

use crate::method::{MethodKind, TREE_COUNT};
use crate::node::{Entry, Node};
use crate::params::Params;
use crate::pattern;
use crate::RouterError;

/// A method-indexed set of radix trees.
///
/// # Example
///
/// ```rust
/// use meridian_router::{Lookup, Router};
/// use http::Method;
///
/// let mut router = Router::new();
/// router.add(&Method::GET, "/api/v1/:list", "list").unwrap();
/// router.add(&Method::GET, "/api/v1/users", "users").unwrap();
///
/// let found = router.lookup(&Method::GET, "/api/v1/orders").found().unwrap();
/// assert_eq!(*found.value, "list");
/// assert_eq!(found.params.get("list"), Some("orders"));
///
/// assert!(matches!(
///     router.lookup(&Method::POST, "/api/v1/users"),
///     Lookup::MethodNotAllowed(_)
/// ));
/// ```
///
/// # Route Priority
///
/// At every branch the router tries, in order:
///
/// 1. **Constant text** (e.g., `/users/me`)
/// 2. **Validated parameters** (e.g., `/users/:id<isnum>`)
/// 3. **Parameters** (e.g., `/users/:name`)
/// 4. **Validated wildcards** (e.g., `/files/*path<len:64>`)
/// 5. **Wildcards** (e.g., `/files/*path`)
///
/// and backtracks when a branch fails deeper down. Within one kind, the
/// earlier registration wins.
#[derive(Debug, Clone)]
pub struct Router<T> {
    trees: [Node<T>; TREE_COUNT],
    route_count: usize,
}

/// A successful route match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a, T> {
    /// The registered value (typically a handler chain).
    pub value: &'a T,
    /// The pattern the value was registered under.
    pub pattern: &'a str,
    /// Captured parameters, one per marker in pattern order.
    pub params: Params,
}

/// Outcome of [`Router::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<'a, T> {
    /// A route matched.
    Found(RouteMatch<'a, T>),
    /// The path matched under other methods only.
    MethodNotAllowed(Vec<Method>),
    /// Nothing matched.
    NotFound,
}

impl<'a, T> Lookup<'a, T> {
    /// Returns the match, if any.
    #[must_use]
    pub fn found(self) -> Option<RouteMatch<'a, T>> {
        match self {
            Lookup::Found(m) => Some(m),
            _ => None,
        }
    }

    /// Returns `true` for [`Lookup::Found`].
    #[must_use]
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

impl<T: Clone> Default for Router<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Router<T> {
    /// Creates a new empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            trees: std::array::from_fn(|_| Node::root()),
            route_count: 0,
        }
    }

    /// Registers `value` for `method` and `pattern`.
    ///
    /// Registering the same method and pattern again replaces the value.
    pub fn add(&mut self, method: &Method, pattern: &str, value: T) -> Result<(), RouterError> {
        let kind = MethodKind::from_method(method)
            .ok_or_else(|| RouterError::UnsupportedMethod(method.to_string()))?;
        self.insert(kind, pattern, value)
    }

    /// Registers `value` for every method.
    ///
    /// Concrete-method registrations of the same pattern always take
    /// precedence, whichever was registered first.
    pub fn any(&mut self, pattern: &str, value: T) -> Result<(), RouterError> {
        self.insert(MethodKind::Any, pattern, value)
    }

    /// Registers `value` in the tree selected by `kind`.
    pub fn insert(&mut self, kind: MethodKind, pattern: &str, value: T) -> Result<(), RouterError> {
        let segments = pattern::parse(pattern)?;
        let shared: Arc<str> = Arc::from(pattern);

        if kind == MethodKind::Any {
            for concrete in MethodKind::CONCRETE {
                let node = self.trees[concrete.index()].insert(&segments);
                if node.entry.as_ref().map_or(true, |e| e.from_any) {
                    node.entry = Some(Entry {
                        value: value.clone(),
                        pattern: shared.clone(),
                        from_any: true,
                    });
                }
            }
        }

        let node = self.trees[kind.index()].insert(&segments);
        node.entry = Some(Entry {
            value,
            pattern: shared,
            from_any: false,
        });
        self.route_count += 1;
        Ok(())
    }

    /// Matches `method` and `path`.
    ///
    /// Methods without a dedicated tree are served by the `ANY` tree. When
    /// the method's tree has no match but other trees do, the allowed
    /// methods are reported.
    #[must_use]
    pub fn lookup(&self, method: &Method, path: &str) -> Lookup<'_, T> {
        let kind = MethodKind::from_method(method).unwrap_or(MethodKind::Any);
        if let Some(found) = self.find(kind, path) {
            return Lookup::Found(found);
        }

        let allowed = self.allowed_methods(path);
        if allowed.is_empty() {
            Lookup::NotFound
        } else {
            Lookup::MethodNotAllowed(allowed)
        }
    }

    /// Matches `path` in a single tree.
    #[must_use]
    pub fn find(&self, kind: MethodKind, path: &str) -> Option<RouteMatch<'_, T>> {
        let mut params = Params::new();
        self.trees[kind.index()]
            .walk(path, &mut params)
            .map(|entry| RouteMatch {
                value: &entry.value,
                pattern: &entry.pattern,
                params,
            })
    }

    /// Returns the concrete methods under which `path` matches.
    #[must_use]
    pub fn allowed_methods(&self, path: &str) -> Vec<Method> {
        MethodKind::CONCRETE
            .iter()
            .filter(|kind| self.find(**kind, path).is_some())
            .filter_map(|kind| kind.to_method())
            .collect()
    }

    /// Returns the number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.route_count
    }

    /// Returns true if no routes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.route_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(routes: &[(&str, &'static str)]) -> Router<&'static str> {
        let mut router = Router::new();
        for (method, pattern) in routes {
            let kind: MethodKind = method.parse().unwrap();
            router.insert(kind, pattern, *pattern).unwrap();
        }
        router
    }

    #[test]
    fn test_router_new() {
        let router: Router<()> = Router::new();
        assert!(router.is_empty());
        assert_eq!(router.len(), 0);
        assert_eq!(router.lookup(&Method::GET, "/"), Lookup::NotFound);
    }

    #[test]
    fn test_router_match_static() {
        let router = router(&[("GET", "/users")]);
        let m = router.lookup(&Method::GET, "/users").found().unwrap();
        assert_eq!(*m.value, "/users");
        assert_eq!(m.pattern, "/users");
        assert!(m.params.is_empty());
    }

    #[test]
    fn test_router_match_wildcard() {
        let router = router(&[("GET", "/files/*path")]);
        let m = router
            .lookup(&Method::GET, "/files/images/logo.png")
            .found()
            .unwrap();
        assert_eq!(m.params.get("path"), Some("images/logo.png"));
    }

    #[test]
    fn test_param_beats_wildcard() {
        let router = router(&[("GET", "/files/*path"), ("GET", "/files/:name")]);
        let m = router.lookup(&Method::GET, "/files/a.txt").found().unwrap();
        assert_eq!(m.pattern, "/files/:name");

        let m = router.lookup(&Method::GET, "/files/a/b.txt").found().unwrap();
        assert_eq!(m.pattern, "/files/*path");
    }

    #[test]
    fn test_validated_wildcard_first() {
        let router = router(&[("GET", "/d/*any"), ("GET", "/d/*num<^[0-9/]+$>")]);
        let m = router.lookup(&Method::GET, "/d/1/2").found().unwrap();
        assert_eq!(m.pattern, "/d/*num<^[0-9/]+$>");
        let m = router.lookup(&Method::GET, "/d/x/2").found().unwrap();
        assert_eq!(m.pattern, "/d/*any");
    }

    #[test]
    fn test_method_not_allowed() {
        let router = router(&[("GET", "/users"), ("DELETE", "/users")]);
        match router.lookup(&Method::POST, "/users") {
            Lookup::MethodNotAllowed(allowed) => {
                assert_eq!(allowed, vec![Method::GET, Method::DELETE]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(router.lookup(&Method::POST, "/nope"), Lookup::NotFound);
    }

    #[test]
    fn test_last_registration_wins() {
        let mut router = Router::new();
        router.add(&Method::GET, "/x", 1).unwrap();
        router.add(&Method::GET, "/x", 2).unwrap();
        assert_eq!(*router.lookup(&Method::GET, "/x").found().unwrap().value, 2);
    }

    #[test]
    fn test_any_never_overrides_explicit() {
        let mut router = Router::new();
        router.add(&Method::GET, "/x", "get").unwrap();
        router.any("/x", "any").unwrap();

        assert_eq!(*router.lookup(&Method::GET, "/x").found().unwrap().value, "get");
        assert_eq!(*router.lookup(&Method::PUT, "/x").found().unwrap().value, "any");

        let mut router = Router::new();
        router.any("/x", "any").unwrap();
        router.add(&Method::GET, "/x", "get").unwrap();

        assert_eq!(*router.lookup(&Method::GET, "/x").found().unwrap().value, "get");
        assert_eq!(*router.lookup(&Method::POST, "/x").found().unwrap().value, "any");
    }

    #[test]
    fn test_extension_method_uses_any_tree() {
        let mut router = Router::new();
        router.any("/dav/*path", "dav").unwrap();
        router.add(&Method::GET, "/only-get", "get").unwrap();

        let propfind = Method::from_bytes(b"PROPFIND").unwrap();
        let m = router.lookup(&propfind, "/dav/a").found().unwrap();
        assert_eq!(*m.value, "dav");
        assert!(matches!(
            router.lookup(&propfind, "/only-get"),
            Lookup::MethodNotAllowed(_)
        ));
    }

    #[test]
    fn test_unknown_validator_fails_registration() {
        let mut router = Router::new();
        let err = router.add(&Method::GET, "/u/:id<uuid>", ()).unwrap_err();
        assert_eq!(err, RouterError::UnknownValidator("uuid".to_string()));
        assert!(router.is_empty());
    }

    #[test]
    fn test_unsupported_method() {
        let mut router = Router::new();
        let propfind = Method::from_bytes(b"PROPFIND").unwrap();
        assert!(matches!(
            router.add(&propfind, "/x", ()),
            Err(RouterError::UnsupportedMethod(_))
        ));
    }
}
