//! Path rewriting before routing.
//!
//! Rules map a path pattern to a template. In the template `$0` is the
//! whole matched path and `$1`..`$9` the `*` captures in order; `${name}`
//! refers to a named capture. The query string is kept.
//!
//! When several rules match, the most literal one wins.

use meridian_core::{BoxFuture, Context, Handler, MeridianError};
use meridian_router::{Delimiters, MatchTree, RouterError};

/// Param recording the path before rewriting.
pub const ORIGINAL_PATH_PARAM: &str = "original_path";

/// Rewrite middleware.
///
/// # Example
///
/// ```
/// use meridian_middleware::stages::Rewrite;
///
/// let rewrite = Rewrite::new([
///     ("/old/*", "/new/$1"),
///     ("/u/${id}/*", "/users/${id}/$2"),
/// ])
/// .unwrap();
/// assert_eq!(rewrite.apply("/old/page").as_deref(), Some("/new/page"));
/// ```
#[derive(Debug, Clone)]
pub struct Rewrite {
    rules: MatchTree<String>,
}

impl Rewrite {
    /// Creates a rewrite from `(pattern, template)` rules.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern is malformed.
    pub fn new<I, P, T>(rules: I) -> Result<Self, RouterError>
    where
        I: IntoIterator<Item = (P, T)>,
        P: AsRef<str>,
        T: Into<String>,
    {
        let mut tree = MatchTree::new(Delimiters::Path);
        for (pattern, template) in rules {
            tree.insert(pattern.as_ref(), template.into())?;
        }
        Ok(Self { rules: tree })
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if there are no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrites `path`, or returns `None` if no rule matches.
    #[must_use]
    pub fn apply(&self, path: &str) -> Option<String> {
        self.rules
            .find(path)
            .map(|m| m.captures.expand(m.value))
    }
}

impl Handler for Rewrite {
    fn name(&self) -> &'static str {
        "rewrite"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let original = ctx.request().path().to_string();
            let Some(rewritten) = self.apply(&original) else {
                return;
            };
            if rewritten == original {
                return;
            }
            if let Err(err) = ctx.request_mut().set_path(&rewritten) {
                ctx.fail(MeridianError::internal_with_source(
                    format!("rewrite of {original} produced an invalid path"),
                    err,
                ))
                .await;
                return;
            }
            tracing::debug!(from = %original, to = %rewritten, "path rewritten");
            ctx.set_param(ORIGINAL_PATH_PARAM, original);
        })
    }
}
