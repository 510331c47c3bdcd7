//! Referer checking.
//!
//! Requests must carry a `Referer` whose host matches one of the allowed
//! host patterns (`example.com`, `*.example.com`). By default only unsafe
//! methods are checked and a missing referer is refused.

use http::header::REFERER;
use http::{Method, Uri};
use meridian_core::{BoxFuture, Context, Handler, MeridianError};
use meridian_router::{Delimiters, MatchTree, RouterError};

/// Referer policy middleware.
///
/// # Example
///
/// ```
/// use meridian_middleware::stages::RefererPolicy;
///
/// let policy = RefererPolicy::new(["example.com", "*.example.com"])
///     .unwrap()
///     .allow_empty(true);
/// ```
#[derive(Debug, Clone)]
pub struct RefererPolicy {
    hosts: MatchTree<()>,
    allow_empty: bool,
    check_all: bool,
}

impl RefererPolicy {
    /// Creates a policy admitting the given host patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern is malformed.
    pub fn new<I, S>(hosts: I) -> Result<Self, RouterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = MatchTree::new(Delimiters::Host);
        for host in hosts {
            tree.insert(&host.as_ref().to_ascii_lowercase(), ())?;
        }
        Ok(Self {
            hosts: tree,
            allow_empty: false,
            check_all: false,
        })
    }

    /// Admits requests without a `Referer`.
    #[must_use]
    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    /// Checks safe methods too.
    #[must_use]
    pub fn check_all_methods(mut self, all: bool) -> Self {
        self.check_all = all;
        self
    }

    /// Returns `true` if `referer` names an allowed host.
    #[must_use]
    pub fn allows(&self, referer: &str) -> bool {
        referer
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.host().map(str::to_ascii_lowercase))
            .is_some_and(|host| self.hosts.find(&host).is_some())
    }
}

impl Handler for RefererPolicy {
    fn name(&self) -> &'static str {
        "referer"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let method = ctx.request().method();
            let safe = matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE);
            if safe && !self.check_all {
                return;
            }
            let allowed = match ctx.request().header(REFERER) {
                None | Some("") => self.allow_empty,
                Some(referer) => self.allows(referer),
            };
            if !allowed {
                ctx.fail(MeridianError::authorization("referer not allowed")).await;
            }
        })
    }
}
