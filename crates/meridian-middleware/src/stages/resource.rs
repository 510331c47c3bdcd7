//! Resource tagging for PBAC.
//!
//! Maps request paths to the `resource` and `action` params the policy
//! evaluator matches against. Templates use the same `$N` / `${name}`
//! substitution as rewrites. Without an action template the action is the
//! lower-case method name.

use meridian_core::{BoxFuture, Context, Handler};
use meridian_router::{Delimiters, MatchTree, RouterError};

/// Param holding the resource identifier.
pub const RESOURCE_PARAM: &str = "resource";
/// Param holding the action identifier.
pub const ACTION_PARAM: &str = "action";

#[derive(Debug, Clone)]
struct Tag {
    resource: String,
    action: Option<String>,
}

/// Resource tagging middleware.
///
/// # Example
///
/// ```
/// use meridian_middleware::stages::ResourceTagger;
///
/// let tagger = ResourceTagger::new()
///     .tag("/users/${id}", "user/${id}")
///     .unwrap()
///     .tag_with_action("/users/${id}/avatar", "user/${id}", "read:avatar")
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ResourceTagger {
    tags: MatchTree<Tag>,
}

impl Default for ResourceTagger {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTagger {
    /// Creates an empty tagger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tags: MatchTree::new(Delimiters::Path),
        }
    }

    /// Tags paths matching `pattern` with the expanded `resource`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is malformed.
    pub fn tag(mut self, pattern: &str, resource: impl Into<String>) -> Result<Self, RouterError> {
        self.tags.insert(
            pattern,
            Tag {
                resource: resource.into(),
                action: None,
            },
        )?;
        Ok(self)
    }

    /// Tags paths matching `pattern` with both a resource and an action.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is malformed.
    pub fn tag_with_action(
        mut self,
        pattern: &str,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Result<Self, RouterError> {
        self.tags.insert(
            pattern,
            Tag {
                resource: resource.into(),
                action: Some(action.into()),
            },
        )?;
        Ok(self)
    }

    /// Resolves `(resource, action)` for a request, if a pattern matches.
    #[must_use]
    pub fn resolve(&self, method: &http::Method, path: &str) -> Option<(String, String)> {
        let m = self.tags.find(path)?;
        let resource = m.captures.expand(&m.value.resource);
        let action = m.value.action.as_ref().map_or_else(
            || method.as_str().to_ascii_lowercase(),
            |template| m.captures.expand(template),
        );
        Some((resource, action))
    }
}

impl Handler for ResourceTagger {
    fn name(&self) -> &'static str {
        "resource"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let request = ctx.request();
            if let Some((resource, action)) = self.resolve(request.method(), request.path()) {
                ctx.set_param(RESOURCE_PARAM, resource);
                ctx.set_param(ACTION_PARAM, action);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{get, ok, request, run};
    use http::Method;

    fn tagger() -> ResourceTagger {
        ResourceTagger::new()
            .tag("/users/${id}", "user/${id}")
            .unwrap()
            .tag_with_action("/users/${id}/profile", "user/$1", "read:profile")
            .unwrap()
            .tag("/files/*", "file/$1")
            .unwrap()
    }

    #[test]
    fn test_resolve() {
        let tagger = tagger();
        assert_eq!(
            tagger.resolve(&Method::DELETE, "/users/42"),
            Some(("user/42".to_string(), "delete".to_string()))
        );
        assert_eq!(
            tagger.resolve(&Method::GET, "/users/42/profile"),
            Some(("user/42".to_string(), "read:profile".to_string()))
        );
        assert_eq!(
            tagger.resolve(&Method::GET, "/files/a/b.txt"),
            Some(("file/a/b.txt".to_string(), "get".to_string()))
        );
        assert_eq!(tagger.resolve(&Method::GET, "/other"), None);
    }

    #[tokio::test]
    async fn test_sets_params() {
        let (ctx, _) = run(tagger(), ok(), request(Method::PUT, "/users/7")).await;
        assert_eq!(ctx.param(RESOURCE_PARAM), Some("user/7"));
        assert_eq!(ctx.param(ACTION_PARAM), Some("put"));
    }

    #[tokio::test]
    async fn test_unmatched_sets_nothing() {
        let (ctx, _) = run(tagger(), ok(), get("/health")).await;
        assert!(ctx.param(RESOURCE_PARAM).is_none());
    }
}
