//! Policy enforcement middleware.

use chrono::{SecondsFormat, Utc};
use http::StatusCode;
use meridian_core::{BoxFuture, Context, Handler};
use meridian_middleware::stages::{ACTION_PARAM, RESOURCE_PARAM, USERID_PARAM, USERNAME_PARAM};
use serde::Serialize;

use crate::store::PolicyStore;

/// Param set to the name of the policy that allowed the request.
pub const POLICY_PARAM: &str = "policy";

/// Header carrying a trace id, echoed in refusals.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Body of a refused request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Forbidden {
    /// When the request was refused, RFC 3339.
    pub time: String,
    /// Request host.
    pub host: String,
    /// Request method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Matched route pattern.
    pub route: String,
    /// Evaluated action.
    pub action: String,
    /// Evaluated resource.
    pub resource: String,
    /// Policy of a matching deny statement.
    pub policy: String,
    /// Authenticated user id.
    pub userid: String,
    /// Authenticated user name.
    pub username: String,
    /// Response status.
    pub status: u16,
    /// Reason.
    pub message: String,
    /// Request id.
    #[serde(rename = "x-request-id")]
    pub request_id: String,
    /// Trace id.
    #[serde(rename = "x-trace-id")]
    pub trace_id: String,
}

/// Enforces the [`PolicyStore`] on every request.
///
/// The user is the `username` param set by authentication; without one the
/// guest is evaluated and a refusal answers 401 instead of 403. On success
/// the `policy` param names the deciding policy and any projected data is
/// stored as a [`DataProjection`](crate::DataProjection) extension.
#[derive(Debug, Clone)]
pub struct PbacMiddleware {
    store: PolicyStore,
}

impl PbacMiddleware {
    /// Creates the middleware over a shared store.
    #[must_use]
    pub fn new(store: PolicyStore) -> Self {
        Self { store }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &PolicyStore {
        &self.store
    }
}

fn forbidden(ctx: &Context, status: StatusCode, policy: Option<String>, message: &str) -> Forbidden {
    let param = |name: &str| ctx.param(name).unwrap_or_default().to_string();
    let request = ctx.request();
    Forbidden {
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        host: request.host().unwrap_or_default().to_string(),
        method: request.method().to_string(),
        path: request.path().to_string(),
        route: ctx.route().unwrap_or_default().to_string(),
        action: param(ACTION_PARAM),
        resource: param(RESOURCE_PARAM),
        policy: policy.unwrap_or_default(),
        userid: param(USERID_PARAM),
        username: param(USERNAME_PARAM),
        status: status.as_u16(),
        message: message.to_string(),
        request_id: ctx.request_id().map(|id| id.as_str().to_string()).unwrap_or_default(),
        trace_id: request.header(TRACE_ID_HEADER).unwrap_or_default().to_string(),
    }
}

impl Handler for PbacMiddleware {
    fn name(&self) -> &'static str {
        "pbac"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let username = ctx.param(USERNAME_PARAM).map(str::to_string);
            let user = username.as_deref().unwrap_or(self.store.guest());
            let decision = self.store.evaluate(ctx, user);

            let effect = if decision.allowed() { "allow" } else { "deny" };
            metrics::counter!("meridian_pbac_decisions_total", "effect" => effect).increment(1);

            if decision.allowed() {
                let projection = self.store.project(ctx, user);
                if let Some(policy) = decision.policy {
                    ctx.set_param(POLICY_PARAM, policy);
                }
                if !projection.is_empty() {
                    ctx.extensions_mut().insert(projection);
                }
                return;
            }

            let (status, message) = if username.is_some() {
                (StatusCode::FORBIDDEN, "access denied by policy")
            } else {
                (StatusCode::UNAUTHORIZED, "authentication required")
            };
            let body = forbidden(ctx, status, decision.policy, message);
            tracing::warn!(
                user,
                action = %body.action,
                resource = %body.resource,
                policy = %body.policy,
                status = status.as_u16(),
                "request refused by policy"
            );
            if !ctx.header_written() {
                if let Err(err) = ctx.json(status, &body).await {
                    tracing::debug!(error = %err, "failed to write refusal");
                }
            }
            ctx.end();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Effect, Member, Policy, Statement};
    use crate::DataProjection;
    use http::{Method, Uri};
    use meridian_core::{named_fn, Chain, Request};

    fn store() -> PolicyStore {
        let store = PolicyStore::new();
        store
            .put_policy(Policy::new(
                "editors",
                vec![
                    Statement::new(Effect::Deny, ["write"], ["locked/*"]),
                    Statement::new(Effect::Allow, ["*"], ["*"]),
                    Statement::new(Effect::Allow, ["*"], ["*"]).with_data("scope", ["all"]),
                ],
            ))
            .unwrap();
        store.put_member(Member::new("ed", ["editors"]).with_data(["editors"])).unwrap();
        store
    }

    async fn run(store: PolicyStore, user: Option<&str>, action: &str, resource: &str) -> (Context, meridian_core::Recording) {
        let (mut ctx, recording) = Context::recorded(
            Request::new(Method::POST, Uri::from_static("/docs/1")).with_header(TRACE_ID_HEADER, "trace-9"),
        );
        let (user, action, resource) = (user.map(str::to_string), action.to_string(), resource.to_string());
        let identify = named_fn("identify", move |ctx| {
            let (user, action, resource) = (user.clone(), action.clone(), resource.clone());
            Box::pin(async move {
                if let Some(user) = user {
                    ctx.set_param(USERNAME_PARAM, user);
                }
                ctx.set_param(ACTION_PARAM, action);
                ctx.set_param(RESOURCE_PARAM, resource);
            })
        });
        let handler = named_fn("handler", |ctx| {
            Box::pin(async move {
                let _ = ctx.text(StatusCode::OK, "done").await;
            })
        });
        ctx.run(Chain::from(identify).with(PbacMiddleware::new(store)).with(handler))
            .await;
        ctx.finish().await.unwrap();
        (ctx, recording)
    }

    #[tokio::test]
    async fn test_allowed_sets_policy_and_projection() {
        let (ctx, recording) = run(store(), Some("ed"), "write", "docs/1").await;
        assert_eq!(recording.status(), StatusCode::OK);
        assert_eq!(ctx.param(POLICY_PARAM), Some("editors"));
        let projection = ctx.extensions().get::<DataProjection>().unwrap();
        assert_eq!(projection.get("scope").unwrap(), ["all"]);
    }

    #[tokio::test]
    async fn test_denied_user_gets_403_body() {
        let (_, recording) = run(store(), Some("ed"), "write", "locked/1").await;
        assert_eq!(recording.status(), StatusCode::FORBIDDEN);
        assert!(!recording.text().contains("done"));

        let body: Forbidden = serde_json::from_slice(&recording.body()).unwrap();
        assert_eq!(body.status, 403);
        assert_eq!(body.policy, "editors");
        assert_eq!(body.username, "ed");
        assert_eq!(body.action, "write");
        assert_eq!(body.resource, "locked/1");
        assert_eq!(body.method, "POST");
        assert_eq!(body.path, "/docs/1");
        assert_eq!(body.trace_id, "trace-9");
    }

    #[tokio::test]
    async fn test_anonymous_refusal_is_401() {
        let (_, recording) = run(store(), None, "write", "docs/1").await;
        assert_eq!(recording.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_slice(&recording.body()).unwrap();
        assert_eq!(body["status"], 401);
        assert_eq!(body["username"], "");
        assert!(body.get("x-request-id").is_some());
    }
}
