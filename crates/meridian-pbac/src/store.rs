//! The policy store and decision procedure.
//!
//! Policies and members live in insertion-ordered maps behind a lock and
//! are only touched by administrative changes. Each change recompiles the
//! affected users into two dense statement lists, one for decisions and one
//! for data projection, and publishes them in a new snapshot. Requests
//! evaluate against whatever snapshot was current when they started.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use meridian_core::Context;
use meridian_middleware::stages::{ACTION_PARAM, RESOURCE_PARAM};
use meridian_router::{Delimiters, MatchTree};
use parking_lot::RwLock;

use crate::condition::{AllOf, Condition};
use crate::error::{PbacError, PbacResult};
use crate::policy::{Effect, Member, Policy, PolicyDocument, Statement};

/// Reserved user name evaluated when a user has no matching statement.
pub const DEFAULT_GUEST: &str = "guest";

#[derive(Debug)]
struct CompiledStatement {
    policy: Arc<str>,
    effect: Effect,
    actions: MatchTree<()>,
    resources: MatchTree<()>,
    conditions: Option<AllOf>,
    data: IndexMap<String, Vec<String>>,
}

impl CompiledStatement {
    fn compile(policy: &Arc<str>, stmt: &Statement) -> PbacResult<Self> {
        let tree = |patterns: &[String]| -> PbacResult<MatchTree<()>> {
            let mut tree = MatchTree::new(Delimiters::Path);
            for pattern in patterns {
                tree.insert(pattern, ()).map_err(|source| PbacError::Pattern {
                    policy: policy.to_string(),
                    source,
                })?;
            }
            Ok(tree)
        };
        Ok(Self {
            policy: Arc::clone(policy),
            effect: stmt.effect,
            actions: tree(&stmt.action)?,
            resources: tree(&stmt.resource)?,
            conditions: stmt.conditions.clone(),
            data: stmt.data.clone().unwrap_or_default(),
        })
    }

    fn matches(&self, ctx: &Context, action: &str, resource: &str) -> bool {
        self.actions.find(action).is_some()
            && self.resources.find(resource).is_some()
            && self.conditions.as_ref().map_or(true, |c| c.matches(ctx))
    }
}

#[derive(Debug)]
struct CompiledPolicy {
    source: Policy,
    rules: Vec<Arc<CompiledStatement>>,
    data: Vec<Arc<CompiledStatement>>,
}

impl CompiledPolicy {
    fn compile(policy: Policy) -> PbacResult<Self> {
        if policy.name.is_empty() {
            return Err(PbacError::EmptyName);
        }
        let name: Arc<str> = Arc::from(policy.name.as_str());
        let mut rules = Vec::new();
        let mut data = Vec::new();
        for stmt in &policy.statements {
            let compiled = Arc::new(CompiledStatement::compile(&name, stmt)?);
            if stmt.is_data() {
                data.push(compiled);
            } else {
                rules.push(compiled);
            }
        }
        Ok(Self {
            source: policy,
            rules,
            data,
        })
    }
}

/// One user's statements, flattened in evaluation order.
#[derive(Debug, Default)]
struct UserRules {
    rules: Vec<Arc<CompiledStatement>>,
    data: Vec<Arc<CompiledStatement>>,
}

#[derive(Debug, Default)]
struct State {
    policies: IndexMap<String, CompiledPolicy>,
    members: IndexMap<String, Member>,
}

impl State {
    fn compile_member(&self, member: &Member) -> UserRules {
        let lookup = |names: &[String],
                      pick: fn(&CompiledPolicy) -> &Vec<Arc<CompiledStatement>>|
         -> Vec<Arc<CompiledStatement>> {
            names
                .iter()
                .filter_map(|name| self.policies.get(name))
                .flat_map(|policy| pick(policy).iter().cloned())
                .collect()
        };
        UserRules {
            rules: lookup(&member.policy, |p| &p.rules),
            data: lookup(&member.data, |p| &p.data),
        }
    }
}

type Snapshot = HashMap<String, Arc<UserRules>>;

/// Outcome of a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Effect of the matching statement, if any matched.
    pub effect: Option<Effect>,
    /// Policy holding the matching statement.
    pub policy: Option<String>,
    /// User whose statements decided; the guest on fallback.
    pub user: Option<String>,
}

impl Decision {
    const NO_MATCH: Self = Self {
        effect: None,
        policy: None,
        user: None,
    };

    /// Returns true if access is granted.
    #[must_use]
    pub fn allowed(&self) -> bool {
        self.effect == Some(Effect::Allow)
    }
}

/// Values collected from matching data statements.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct DataProjection {
    values: IndexMap<String, Vec<String>>,
}

impl DataProjection {
    /// Values projected under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.values.get(key).map(Vec::as_slice)
    }

    /// All projected keys and values.
    #[must_use]
    pub fn values(&self) -> &IndexMap<String, Vec<String>> {
        &self.values
    }

    /// Returns true if nothing was projected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug)]
struct Inner {
    guest: String,
    state: RwLock<State>,
    snapshot: ArcSwap<Snapshot>,
}

/// Shared policy store.
///
/// Cloning is cheap; clones see the same policies.
///
/// # Example
///
/// ```
/// use meridian_pbac::{Effect, Member, Policy, PolicyStore, Statement};
///
/// let store = PolicyStore::new();
/// store
///     .put_policy(Policy::new(
///         "readers",
///         vec![Statement::new(Effect::Allow, ["read:*"], ["user/*"])],
///     ))
///     .unwrap();
/// store.put_member(Member::new("alice", ["readers"])).unwrap();
/// assert_eq!(store.policies().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct PolicyStore {
    inner: Arc<Inner>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    /// Creates an empty store with the default guest name.
    #[must_use]
    pub fn new() -> Self {
        Self::with_guest(DEFAULT_GUEST)
    }

    /// Creates an empty store with a custom guest name.
    #[must_use]
    pub fn with_guest(guest: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                guest: guest.into(),
                state: RwLock::new(State::default()),
                snapshot: ArcSwap::from_pointee(Snapshot::new()),
            }),
        }
    }

    /// The guest user name.
    #[must_use]
    pub fn guest(&self) -> &str {
        &self.inner.guest
    }

    // ----- administration ------------------------------------------------

    /// Adds or replaces a policy. Members bound to it are recompiled.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty name or malformed patterns.
    pub fn put_policy(&self, policy: Policy) -> PbacResult<()> {
        let compiled = CompiledPolicy::compile(policy)?;
        let name = compiled.source.name.clone();
        let mut state = self.inner.state.write();
        state.policies.insert(name.clone(), compiled);
        self.republish(&state, |m| m.policy.contains(&name) || m.data.contains(&name));
        tracing::info!(policy = %name, "policy stored");
        Ok(())
    }

    /// Removes a policy. Returns `false` if it did not exist.
    pub fn delete_policy(&self, name: &str) -> bool {
        let mut state = self.inner.state.write();
        if state.policies.shift_remove(name).is_none() {
            return false;
        }
        self.republish(&state, |m| {
            m.policy.iter().any(|p| p == name) || m.data.iter().any(|p| p == name)
        });
        tracing::info!(policy = %name, "policy deleted");
        true
    }

    /// A policy by name.
    #[must_use]
    pub fn policy(&self, name: &str) -> Option<Policy> {
        self.inner
            .state
            .read()
            .policies
            .get(name)
            .map(|p| p.source.clone())
    }

    /// All policies in insertion order.
    #[must_use]
    pub fn policies(&self) -> Vec<Policy> {
        self.inner
            .state
            .read()
            .policies
            .values()
            .map(|p| p.source.clone())
            .collect()
    }

    /// Adds or replaces a member.
    ///
    /// # Errors
    ///
    /// Returns [`PbacError::PolicyNotFound`] if the member names a policy
    /// that does not exist.
    pub fn put_member(&self, member: Member) -> PbacResult<()> {
        let mut state = self.inner.state.write();
        if let Some(missing) = member
            .policy
            .iter()
            .chain(&member.data)
            .find(|name| !state.policies.contains_key(name.as_str()))
        {
            return Err(PbacError::PolicyNotFound(missing.clone()));
        }
        let user = member.user.clone();
        state.members.insert(user.clone(), member);
        self.republish(&state, |m| m.user == user);
        tracing::info!(user = %user, "member stored");
        Ok(())
    }

    /// Removes a member. Returns `false` if it did not exist.
    pub fn delete_member(&self, user: &str) -> bool {
        let mut state = self.inner.state.write();
        if state.members.shift_remove(user).is_none() {
            return false;
        }
        let mut snapshot = Snapshot::clone(&self.inner.snapshot.load());
        snapshot.remove(user);
        self.inner.snapshot.store(Arc::new(snapshot));
        tracing::info!(user = %user, "member deleted");
        true
    }

    /// A member by user name.
    #[must_use]
    pub fn member(&self, user: &str) -> Option<Member> {
        self.inner.state.read().members.get(user).cloned()
    }

    /// All members in insertion order.
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        self.inner.state.read().members.values().cloned().collect()
    }

    /// Loads every policy, then every member, of a document.
    ///
    /// # Errors
    ///
    /// Stops at the first invalid policy or member.
    pub fn load_document(&self, document: PolicyDocument) -> PbacResult<()> {
        let (policies, members) = (document.policies.len(), document.members.len());
        for policy in document.policies {
            self.put_policy(policy)?;
        }
        for member in document.members {
            self.put_member(member)?;
        }
        tracing::info!(policies, members, "policy document loaded");
        Ok(())
    }

    /// Parses and loads a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or an invalid document.
    pub fn load_json(&self, json: &str) -> PbacResult<()> {
        self.load_document(serde_json::from_str(json)?)
    }

    /// Reads and loads a JSON document from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub async fn load_file(&self, path: impl AsRef<std::path::Path>) -> PbacResult<()> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| PbacError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        self.load_json(&json)
    }

    /// The whole store as a document.
    #[must_use]
    pub fn document(&self) -> PolicyDocument {
        PolicyDocument {
            policies: self.policies(),
            members: self.members(),
        }
    }

    /// Recompiles members selected by `affected` into a new snapshot.
    /// Called with the state write lock held, so publications are ordered.
    fn republish(&self, state: &State, affected: impl Fn(&Member) -> bool) {
        let mut snapshot = Snapshot::clone(&self.inner.snapshot.load());
        for member in state.members.values().filter(|m| affected(m)) {
            snapshot.insert(member.user.clone(), Arc::new(state.compile_member(member)));
        }
        self.inner.snapshot.store(Arc::new(snapshot));
    }

    // ----- evaluation ----------------------------------------------------

    /// Decides the request for `user`, falling back to the guest.
    ///
    /// Statements are tried in order; the first whose action, resource and
    /// conditions all match decides. Action and resource come from the
    /// `action` and `resource` params.
    #[must_use]
    pub fn evaluate(&self, ctx: &Context, user: &str) -> Decision {
        let snapshot = self.inner.snapshot.load();
        let action = ctx.param(ACTION_PARAM).unwrap_or_default();
        let resource = ctx.param(RESOURCE_PARAM).unwrap_or_default();

        let mut candidates = vec![user];
        if user != self.guest() {
            candidates.push(self.guest());
        }
        for candidate in candidates {
            let Some(rules) = snapshot.get(candidate) else {
                continue;
            };
            if let Some(stmt) = rules
                .rules
                .iter()
                .find(|stmt| stmt.matches(ctx, action, resource))
            {
                return Decision {
                    effect: Some(stmt.effect),
                    policy: Some(stmt.policy.to_string()),
                    user: Some(candidate.to_string()),
                };
            }
        }
        Decision::NO_MATCH
    }

    /// Collects the data of every matching data statement bound to `user`,
    /// or to the guest when `user` has no data bindings.
    #[must_use]
    pub fn project(&self, ctx: &Context, user: &str) -> DataProjection {
        let snapshot = self.inner.snapshot.load();
        let action = ctx.param(ACTION_PARAM).unwrap_or_default();
        let resource = ctx.param(RESOURCE_PARAM).unwrap_or_default();

        let rules = snapshot
            .get(user)
            .filter(|r| !r.data.is_empty())
            .or_else(|| snapshot.get(self.guest()));
        let mut projection = DataProjection::default();
        for stmt in rules.into_iter().flat_map(|r| r.data.iter()) {
            if stmt.matches(ctx, action, resource) {
                for (key, values) in &stmt.data {
                    projection
                        .values
                        .entry(key.clone())
                        .or_default()
                        .extend(values.iter().cloned());
                }
            }
        }
        projection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};
    use meridian_core::Request;
    use serde_json::json;

    fn ctx(action: &str, resource: &str) -> Context {
        let mut ctx = Context::recorded(Request::new(Method::GET, Uri::from_static("/"))).0;
        ctx.set_param(ACTION_PARAM, action);
        ctx.set_param(RESOURCE_PARAM, resource);
        ctx
    }

    fn store() -> PolicyStore {
        let store = PolicyStore::new();
        store
            .load_json(
                &json!({
                    "policies": [
                        {"name": "no-admin", "statements": [
                            {"effect": "deny", "action": ["*"], "resource": ["admin/*"]}
                        ]},
                        {"name": "readers", "statements": [
                            {"effect": "allow", "action": ["read:*"], "resource": ["*"]}
                        ]},
                        {"name": "public", "statements": [
                            {"effect": "allow", "action": ["read:*"], "resource": ["docs/*"]}
                        ]},
                        {"name": "teams", "statements": [
                            {"effect": "allow", "action": ["list"], "resource": ["team"], "data": {"teams": ["core"]}},
                            {"effect": "allow", "action": ["list"], "resource": ["*"], "data": {"teams": ["infra"], "env": ["prod"]}}
                        ]}
                    ],
                    "members": [
                        {"user": "alice", "policy": ["no-admin", "readers"], "data": ["teams"]},
                        {"user": "guest", "policy": ["public"]}
                    ]
                })
                .to_string(),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_first_match_decides() {
        let store = store();
        let decision = store.evaluate(&ctx("read:page", "wiki/home"), "alice");
        assert!(decision.allowed());
        assert_eq!(decision.policy.as_deref(), Some("readers"));

        let decision = store.evaluate(&ctx("read:page", "admin/users"), "alice");
        assert_eq!(decision.effect, Some(Effect::Deny));
        assert_eq!(decision.policy.as_deref(), Some("no-admin"));
    }

    #[test]
    fn test_guest_fallback() {
        let store = store();
        let decision = store.evaluate(&ctx("read:page", "docs/intro"), "mallory");
        assert!(decision.allowed());
        assert_eq!(decision.policy.as_deref(), Some("public"));
        assert_eq!(decision.user.as_deref(), Some("guest"));

        let decision = store.evaluate(&ctx("write:page", "docs/intro"), "mallory");
        assert!(!decision.allowed());
        assert_eq!(decision, Decision::NO_MATCH);
    }

    #[test]
    fn test_data_projection_accumulates() {
        let store = store();
        let projection = store.project(&ctx("list", "team"), "alice");
        assert_eq!(projection.get("teams").unwrap(), ["core", "infra"]);
        assert_eq!(projection.get("env").unwrap(), ["prod"]);

        let projection = store.project(&ctx("list", "org"), "alice");
        assert_eq!(projection.get("teams").unwrap(), ["infra"]);
        assert!(store.project(&ctx("list", "team"), "mallory").is_empty());
    }

    #[test]
    fn test_policy_update_recompiles_members() {
        let store = store();
        assert!(!store.evaluate(&ctx("write:page", "wiki/home"), "alice").allowed());

        store
            .put_policy(Policy::new(
                "readers",
                vec![Statement::new(Effect::Allow, ["*"], ["wiki/*"])],
            ))
            .unwrap();
        assert!(store.evaluate(&ctx("write:page", "wiki/home"), "alice").allowed());

        assert!(store.delete_policy("readers"));
        assert!(!store.evaluate(&ctx("read:page", "wiki/home"), "alice").allowed());
        assert!(!store.delete_policy("readers"));
    }

    #[test]
    fn test_member_administration() {
        let store = store();
        let err = store.put_member(Member::new("bob", ["missing"])).unwrap_err();
        assert!(matches!(err, PbacError::PolicyNotFound(name) if name == "missing"));

        store.put_member(Member::new("bob", ["readers"])).unwrap();
        assert_eq!(
            store.members().iter().map(|m| m.user.as_str()).collect::<Vec<_>>(),
            ["alice", "guest", "bob"]
        );
        assert!(store.evaluate(&ctx("read:x", "y"), "bob").allowed());

        assert!(store.delete_member("bob"));
        assert!(store.member("bob").is_none());
        let decision = store.evaluate(&ctx("read:x", "y"), "bob");
        assert!(!decision.allowed());
    }

    #[test]
    fn test_snapshot_survives_concurrent_update() {
        let store = store();
        let before = store.inner.snapshot.load_full();
        store.put_member(Member::new("alice", ["public"])).unwrap();
        assert_eq!(before["alice"].rules.len(), 2);
        assert_eq!(store.inner.snapshot.load()["alice"].rules.len(), 1);
    }

    #[test]
    fn test_policy_order_is_stable() {
        let store = store();
        let names: Vec<String> = store.policies().into_iter().map(|p| p.name).collect();
        assert_eq!(names, ["no-admin", "readers", "public", "teams"]);
        assert!(store.policy("teams").unwrap().statements[0].is_data());
        assert!(store.put_policy(Policy::new("", vec![])).is_err());
    }
}
