//! Runtime administration API.
//!
//! [`mount`] registers JSON endpoints over the shared breaker table, IP
//! lists and policy store:
//!
//! | Method | Path | Effect |
//! |--------|------|--------|
//! | `GET` | `/breaker/data` | all breaker snapshots |
//! | `GET` | `/breaker/:id` | one breaker |
//! | `PUT` | `/breaker/:id/state/:state` | force `closed`, `half-open` or `open` |
//! | `GET` | `/black/data` | allow and deny lists |
//! | `PUT` | `/black/{allow,deny}/:ip?mask=N` | add a network |
//! | `DELETE` | `/black/{allow,deny}/:ip?mask=N` | remove a network |
//! | `GET` | `/policys`, `/policys/:name` | list or fetch policies |
//! | `PUT` | `/policys` | load a `{policies, members}` document |
//! | `PUT` | `/policys/:name` | store one policy |
//! | `DELETE` | `/policys/:name` | remove a policy |
//! | `GET` | `/members`, `/members/:name` | list or fetch members |
//! | `POST` | `/members` | create a member |
//! | `PUT` | `/members/:name` | store a member |
//! | `DELETE` | `/members/:name` | remove a member |
//!
//! Breaker ids are route patterns, so they travel percent-encoded
//! (`/breaker/%2Fusers%2F%3Aid`). Unknown names answer 404 and malformed
//! input 400, both with the usual error envelope.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode};
use meridian_core::{BoxFuture, Context, Handler, IpNet, MeridianError};
use meridian_middleware::stages::{IpFilter, ListKind};
use meridian_middleware::{BreakerState, BreakerStore};
use meridian_pbac::{Member, PbacError, Policy, PolicyDocument, PolicyStore};
use meridian_router::RouterError;
use meridian_server::Routes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Largest accepted admin request body.
pub const MAX_ADMIN_BODY: usize = 1024 * 1024;

/// The state administered through the API.
#[derive(Debug, Clone, Default)]
pub struct Admin {
    /// Breakers, keyed by route pattern.
    pub breakers: BreakerStore,
    /// IP black/allow lists.
    pub ip_filter: IpFilter,
    /// Policies and members.
    pub policies: PolicyStore,
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    BreakerList,
    BreakerGet,
    BreakerForce,
    BlackList,
    BlackAdd,
    BlackRemove,
    PolicyList,
    PolicyGet,
    PolicyLoad,
    PolicyPut,
    PolicyDelete,
    MemberList,
    MemberGet,
    MemberCreate,
    MemberPut,
    MemberDelete,
}

const ROUTES: &[(Method, &str, Endpoint)] = &[
    (Method::GET, "/breaker/data", Endpoint::BreakerList),
    (Method::GET, "/breaker/:id", Endpoint::BreakerGet),
    (Method::PUT, "/breaker/:id/state/:state", Endpoint::BreakerForce),
    (Method::GET, "/black/data", Endpoint::BlackList),
    (Method::PUT, "/black/:list/:ip", Endpoint::BlackAdd),
    (Method::DELETE, "/black/:list/:ip", Endpoint::BlackRemove),
    (Method::GET, "/policys", Endpoint::PolicyList),
    (Method::PUT, "/policys", Endpoint::PolicyLoad),
    (Method::GET, "/policys/:name", Endpoint::PolicyGet),
    (Method::PUT, "/policys/:name", Endpoint::PolicyPut),
    (Method::DELETE, "/policys/:name", Endpoint::PolicyDelete),
    (Method::GET, "/members", Endpoint::MemberList),
    (Method::POST, "/members", Endpoint::MemberCreate),
    (Method::GET, "/members/:name", Endpoint::MemberGet),
    (Method::PUT, "/members/:name", Endpoint::MemberPut),
    (Method::DELETE, "/members/:name", Endpoint::MemberDelete),
];

/// Registers the admin endpoints under `prefix` (may be empty).
///
/// # Errors
///
/// Returns an error if `prefix` makes a pattern invalid.
pub fn mount(routes: &mut Routes, prefix: &str, admin: Admin) -> Result<(), RouterError> {
    let admin = Arc::new(admin);
    let prefix = prefix.trim_end_matches('/');
    for (method, pattern, endpoint) in ROUTES {
        let handler = AdminHandler {
            admin: Arc::clone(&admin),
            endpoint: *endpoint,
        };
        routes.add(method, &format!("{prefix}{pattern}"), handler)?;
    }
    tracing::info!(prefix, endpoints = ROUTES.len(), "admin API mounted");
    Ok(())
}

struct AdminHandler {
    admin: Arc<Admin>,
    endpoint: Endpoint,
}

impl Handler for AdminHandler {
    fn name(&self) -> &'static str {
        "admin"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let result = self.dispatch(ctx).await;
            match result {
                Ok(Reply::Json(status, body)) => {
                    if let Err(err) = ctx.json(status, &body).await {
                        tracing::debug!(error = %err, "admin response not delivered");
                    }
                }
                Ok(Reply::Empty) => ctx.write_header(StatusCode::NO_CONTENT),
                Err(err) => ctx.fail(err).await,
            }
        })
    }
}

enum Reply {
    Json(StatusCode, serde_json::Value),
    Empty,
}

fn ok<T: Serialize>(value: &T) -> Result<Reply, MeridianError> {
    created_or_ok(StatusCode::OK, value)
}

fn created_or_ok<T: Serialize>(status: StatusCode, value: &T) -> Result<Reply, MeridianError> {
    serde_json::to_value(value)
        .map(|body| Reply::Json(status, body))
        .map_err(|e| MeridianError::internal(format!("failed to encode response: {e}")))
}

impl AdminHandler {
    async fn dispatch(&self, ctx: &mut Context) -> Result<Reply, MeridianError> {
        let admin = &*self.admin;
        match self.endpoint {
            Endpoint::BreakerList => ok(&admin.breakers.snapshots()),
            Endpoint::BreakerGet => {
                let id = decoded_param(ctx, "id")?;
                let breaker = admin
                    .breakers
                    .get(&id)
                    .ok_or_else(|| MeridianError::not_found(format!("breaker '{id}' not found")))?;
                ok(&breaker.snapshot())
            }
            Endpoint::BreakerForce => {
                let id = decoded_param(ctx, "id")?;
                let state: BreakerState = param(ctx, "state")?
                    .parse()
                    .map_err(|e| MeridianError::bad_request(format!("{e}")))?;
                if admin.breakers.get(&id).is_none() {
                    return Err(MeridianError::not_found(format!("breaker '{id}' not found")));
                }
                admin.breakers.force(&id, state);
                tracing::info!(breaker = %id, %state, "breaker state forced");
                let snapshot = admin
                    .breakers
                    .get(&id)
                    .map(|b| b.snapshot())
                    .ok_or_else(|| MeridianError::not_found(format!("breaker '{id}' not found")))?;
                ok(&snapshot)
            }

            Endpoint::BlackList => ok(&admin.ip_filter.snapshot()),
            Endpoint::BlackAdd => {
                let (kind, net) = list_entry(ctx)?;
                let added = admin.ip_filter.add(kind, net);
                tracing::info!(list = %kind, %net, added, "ip list entry stored");
                let status = if added { StatusCode::CREATED } else { StatusCode::OK };
                created_or_ok(status, &admin.ip_filter.snapshot())
            }
            Endpoint::BlackRemove => {
                let (kind, net) = list_entry(ctx)?;
                if !admin.ip_filter.remove(kind, net) {
                    return Err(MeridianError::not_found(format!("{net} is not in the {kind} list")));
                }
                tracing::info!(list = %kind, %net, "ip list entry removed");
                ok(&admin.ip_filter.snapshot())
            }

            Endpoint::PolicyList => ok(&admin.policies.policies()),
            Endpoint::PolicyGet => {
                let name = decoded_param(ctx, "name")?;
                let policy = admin
                    .policies
                    .policy(&name)
                    .ok_or_else(|| MeridianError::not_found(format!("policy '{name}' not found")))?;
                ok(&policy)
            }
            Endpoint::PolicyLoad => {
                let document: PolicyDocument = read_json(ctx).await?;
                admin.policies.load_document(document).map_err(document_error)?;
                ok(&admin.policies.document())
            }
            Endpoint::PolicyPut => {
                let name = decoded_param(ctx, "name")?;
                let policy: Policy = read_named(ctx, "name", &name).await?;
                admin.policies.put_policy(policy).map_err(document_error)?;
                let stored = admin
                    .policies
                    .policy(&name)
                    .ok_or_else(|| MeridianError::not_found(format!("policy '{name}' not found")))?;
                ok(&stored)
            }
            Endpoint::PolicyDelete => {
                let name = decoded_param(ctx, "name")?;
                if !admin.policies.delete_policy(&name) {
                    return Err(MeridianError::not_found(format!("policy '{name}' not found")));
                }
                Ok(Reply::Empty)
            }

            Endpoint::MemberList => ok(&admin.policies.members()),
            Endpoint::MemberGet => {
                let name = decoded_param(ctx, "name")?;
                let member = admin
                    .policies
                    .member(&name)
                    .ok_or_else(|| MeridianError::not_found(format!("member '{name}' not found")))?;
                ok(&member)
            }
            Endpoint::MemberCreate => {
                let member: Member = read_json(ctx).await?;
                if member.user.is_empty() {
                    return Err(MeridianError::bad_request("member user must not be empty"));
                }
                let user = member.user.clone();
                admin.policies.put_member(member).map_err(document_error)?;
                created_or_ok(StatusCode::CREATED, &admin.policies.member(&user))
            }
            Endpoint::MemberPut => {
                let name = decoded_param(ctx, "name")?;
                let member: Member = read_named(ctx, "user", &name).await?;
                admin.policies.put_member(member).map_err(document_error)?;
                ok(&admin.policies.member(&name))
            }
            Endpoint::MemberDelete => {
                let name = decoded_param(ctx, "name")?;
                if !admin.policies.delete_member(&name) {
                    return Err(MeridianError::not_found(format!("member '{name}' not found")));
                }
                Ok(Reply::Empty)
            }
        }
    }
}

fn param(ctx: &Context, name: &str) -> Result<String, MeridianError> {
    ctx.param(name)
        .map(ToString::to_string)
        .ok_or_else(|| MeridianError::bad_request(format!("missing '{name}'")))
}

fn decoded_param(ctx: &Context, name: &str) -> Result<String, MeridianError> {
    let raw = param(ctx, name)?;
    urlencoding::decode(&raw)
        .map(std::borrow::Cow::into_owned)
        .map_err(|_| MeridianError::bad_request(format!("'{name}' is not valid UTF-8")))
}

/// `:list` plus `:ip` and an optional `mask` query parameter. Without a
/// mask the entry is a single host.
fn list_entry(ctx: &Context) -> Result<(ListKind, IpNet), MeridianError> {
    let kind: ListKind = param(ctx, "list")?
        .parse()
        .map_err(|e| MeridianError::bad_request(format!("{e}")))?;
    let raw_ip = decoded_param(ctx, "ip")?;
    let ip: IpAddr = raw_ip
        .parse()
        .map_err(|_| MeridianError::bad_request(format!("invalid ip '{raw_ip}'")))?;
    let net = match ctx.request().query_param("mask") {
        Some(mask) => {
            let prefix: u8 = mask
                .parse()
                .map_err(|_| MeridianError::bad_request(format!("invalid mask '{mask}'")))?;
            IpNet::new(ip, prefix).map_err(|e| MeridianError::bad_request(e.to_string()))?
        }
        None => IpNet::host(ip),
    };
    Ok((kind, net))
}

async fn read_json<T: DeserializeOwned>(ctx: &mut Context) -> Result<T, MeridianError> {
    let body: Bytes = ctx.request_mut().body_mut().bytes(MAX_ADMIN_BODY).await?;
    if body.is_empty() {
        return Err(MeridianError::bad_request("request body is empty"));
    }
    serde_json::from_slice(&body).map_err(|e| MeridianError::bad_request(format!("invalid JSON: {e}")))
}

/// Reads an object whose `field` names it. A missing field is filled in
/// from the path; a different one is rejected.
async fn read_named<T: DeserializeOwned>(
    ctx: &mut Context,
    field: &str,
    name: &str,
) -> Result<T, MeridianError> {
    let mut value: serde_json::Value = read_json(ctx).await?;
    let serde_json::Value::Object(object) = &mut value else {
        return Err(MeridianError::bad_request("expected a JSON object"));
    };
    match object.get(field) {
        None => {
            object.insert(field.to_string(), serde_json::Value::from(name));
        }
        Some(serde_json::Value::String(given)) if given == name => {}
        Some(given) => {
            return Err(MeridianError::bad_request(format!(
                "{field} {given} does not match path '{name}'"
            )));
        }
    }
    serde_json::from_value(value).map_err(|e| MeridianError::bad_request(format!("invalid document: {e}")))
}

/// Everything the store rejects is a problem with the submitted document,
/// including references to policies that do not exist.
fn document_error(err: PbacError) -> MeridianError {
    MeridianError::bad_request(err.to_string())
}
