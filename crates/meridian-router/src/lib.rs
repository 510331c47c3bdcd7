//! Prioritised radix tree router for Meridian.
//!
//! This crate provides the route trees used by the server to resolve a
//! request to a handler chain, plus [`MatchTree`], the pattern tree shared by
//! the CORS, referer, rewrite, resource-tagging and user-agent middleware.
//!
//! # Features
//!
//! - **Radix Tree Matching**: constant runs are compressed and indexed by
//!   first character
//! - **Path Parameters**: `:name`, consuming one path segment
//! - **Wildcards**: `*name`, consuming the rest or a `/`-delimited run
//! - **Validators**: `:id<isnum>`, `:no<min:100>`, `:code<^[a-z]{3}$>`
//! - **Method Trees**: one tree per method plus `ANY`
//!
//! # Example
//!
//! ```rust
//! use meridian_router::Router;
//! use http::Method;
//!
//! let mut router = Router::new();
//! router.add(&Method::GET, "/users/:id<isnum>", "get_user").unwrap();
//! router.add(&Method::GET, "/files/*path", "serve_file").unwrap();
//!
//! let m = router.lookup(&Method::GET, "/users/42").found().unwrap();
//! assert_eq!(*m.value, "get_user");
//! assert_eq!(m.params.get("id"), Some("42"));
//! ```
//!
//! # Architecture
//!
//! ```text
//!                 ""
//!                  │
//!               "/api/v1/"
//!          ┌───────┴────────┐
//!       "users"          ":list"
//!      (entry)           (entry)
//! ```

mod error;
mod match_tree;
mod method;
mod node;
mod params;
mod pattern;
mod router;
mod validator;

pub use error::RouterError;
pub use match_tree::{Captures, Delimiters, MatchTree, TreeMatch};
pub use method::MethodKind;
pub use node::{Node, NodeKind};
pub use params::Params;
pub use router::{Lookup, RouteMatch, Router};
pub use validator::Validator;

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn test_const_beats_param() {
        let mut router = Router::new();
        router.add(&Method::GET, "/api/v1/:list", "list").unwrap();
        router.add(&Method::GET, "/api/v1/users", "users").unwrap();

        let m = router.lookup(&Method::GET, "/api/v1/users").found().unwrap();
        assert_eq!(*m.value, "users");
        assert_eq!(m.pattern, "/api/v1/users");
        assert!(m.params.is_empty());

        let m = router.lookup(&Method::GET, "/api/v1/orders").found().unwrap();
        assert_eq!(*m.value, "list");
        assert_eq!(m.pattern, "/api/v1/:list");
        assert_eq!(m.params.iter().collect::<Vec<_>>(), vec![("list", "orders")]);
    }

    #[test]
    fn test_params_in_pattern_order() {
        let mut router = Router::new();
        router
            .add(&Method::GET, "/orgs/:org/users/:user/*rest", ())
            .unwrap();

        let m = router
            .lookup(&Method::GET, "/orgs/acme/users/7/a/b")
            .found()
            .unwrap();
        let pairs: Vec<_> = m.params.iter().collect();
        assert_eq!(
            pairs,
            vec![("org", "acme"), ("user", "7"), ("rest", "a/b")]
        );
    }

    #[test]
    fn test_validators_route() {
        let mut router = Router::new();
        router.add(&Method::GET, "/orders/:no<min:100>", "big").unwrap();
        router.add(&Method::GET, "/orders/:no", "any").unwrap();

        assert_eq!(*router.lookup(&Method::GET, "/orders/150").found().unwrap().value, "big");
        assert_eq!(*router.lookup(&Method::GET, "/orders/50").found().unwrap().value, "any");
    }

    #[test]
    fn test_no_match() {
        let mut router = Router::new();
        router.add(&Method::GET, "/users", ()).unwrap();
        assert_eq!(router.lookup(&Method::GET, "/posts"), Lookup::NotFound);
        assert_eq!(router.lookup(&Method::GET, "/users/"), Lookup::NotFound);
    }
}
