//! Property tests for route matching.

use http::Method;
use meridian_router::{Lookup, Router};
use proptest::prelude::*;

fn segment() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,6}"
}

fn build() -> Router<&'static str> {
    let mut router = Router::new();
    router.add(&Method::GET, "/api/v1/users", "users").unwrap();
    router.add(&Method::GET, "/api/v1/:list", "list").unwrap();
    router.add(&Method::GET, "/api/v1/:list/:id<isnum>", "item").unwrap();
    router.add(&Method::GET, "/api/v1/:list/*rest", "rest").unwrap();
    router.add(&Method::POST, "/api/v1/:list", "create").unwrap();
    router
}

proptest! {
    #[test]
    fn test_lookup_is_deterministic(parts in prop::collection::vec(segment(), 1..5)) {
        let router = build();
        let path = format!("/api/v1/{}", parts.join("/"));
        let first = router.lookup(&Method::GET, &path);
        let second = router.lookup(&Method::GET, &path);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn test_one_param_per_marker(list in segment(), id in 0u32..100_000) {
        let router = build();
        let path = format!("/api/v1/{list}/{id}");
        match router.lookup(&Method::GET, &path) {
            Lookup::Found(m) => {
                prop_assert_eq!(m.pattern, "/api/v1/:list/:id<isnum>");
                let pairs: Vec<_> = m.params.iter().collect();
                let id = id.to_string();
                prop_assert_eq!(pairs, vec![("list", list.as_str()), ("id", id.as_str())]);
            }
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }

    #[test]
    fn test_const_wins_over_param(list in segment()) {
        let router = build();
        let m = router.lookup(&Method::GET, "/api/v1/users").found().unwrap();
        prop_assert_eq!(*m.value, "users");

        let path = format!("/api/v1/{list}");
        let m = router.lookup(&Method::GET, &path).found().unwrap();
        if list == "users" {
            prop_assert_eq!(*m.value, "users");
        } else {
            prop_assert_eq!(*m.value, "list");
        }
    }
}
