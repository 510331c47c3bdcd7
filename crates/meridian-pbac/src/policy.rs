//! Policy and member documents.
//!
//! ```json
//! {
//!   "policies": [{
//!     "name": "profile-readers",
//!     "statements": [{
//!       "effect": "allow",
//!       "action": ["read:*"],
//!       "resource": ["user/*"],
//!       "conditions": {"sourceip": ["10.0.0.0/8"]}
//!     }]
//!   }],
//!   "members": [{"user": "alice", "policy": ["profile-readers"]}]
//! }
//! ```

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::condition::AllOf;

/// What a matching statement decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// Grant access.
    Allow,
    /// Refuse access.
    Deny,
}

impl Effect {
    /// Lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rule of a policy.
///
/// `action` and `resource` patterns use `*` for one segment, or the rest of
/// the input at the end of a pattern. A statement with `data` only takes
/// part in data projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Statement {
    /// Decision when the statement matches.
    pub effect: Effect,
    /// Action patterns.
    pub action: Vec<String>,
    /// Resource patterns.
    pub resource: Vec<String>,
    /// Additional conditions, all of which must hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<AllOf>,
    /// Values projected into the request when the statement matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<IndexMap<String, Vec<String>>>,
}

impl Statement {
    /// Creates an unconditional statement.
    #[must_use]
    pub fn new<A, R>(effect: Effect, action: A, resource: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            effect,
            action: action.into_iter().map(Into::into).collect(),
            resource: resource.into_iter().map(Into::into).collect(),
            conditions: None,
            data: None,
        }
    }

    /// Adds conditions.
    #[must_use]
    pub fn with_conditions(mut self, conditions: AllOf) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Adds a data entry, making this a data statement.
    #[must_use]
    pub fn with_data<I>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.data
            .get_or_insert_with(IndexMap::new)
            .entry(key.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Returns true if the statement carries projection data.
    #[must_use]
    pub fn is_data(&self) -> bool {
        self.data.is_some()
    }
}

/// A named, ordered list of statements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Policy name.
    pub name: String,
    /// Statements, evaluated in order.
    #[serde(default)]
    pub statements: Vec<Statement>,
}

impl Policy {
    /// Creates a policy.
    #[must_use]
    pub fn new(name: impl Into<String>, statements: Vec<Statement>) -> Self {
        Self {
            name: name.into(),
            statements,
        }
    }
}

/// Binds a user to policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Member {
    /// User name, as set by authentication.
    pub user: String,
    /// Policies consulted for decisions, in order.
    #[serde(default)]
    pub policy: Vec<String>,
    /// Policies consulted for data projection, in order.
    #[serde(default)]
    pub data: Vec<String>,
}

impl Member {
    /// Creates a member bound to decision policies.
    #[must_use]
    pub fn new<I>(user: impl Into<String>, policies: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            user: user.into(),
            policy: policies.into_iter().map(Into::into).collect(),
            data: Vec::new(),
        }
    }

    /// Adds data policies.
    #[must_use]
    pub fn with_data<I>(mut self, policies: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.data.extend(policies.into_iter().map(Into::into));
        self
    }
}

/// A full policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    /// Policies.
    #[serde(default)]
    pub policies: Vec<Policy>,
    /// Members.
    #[serde(default)]
    pub members: Vec<Member>,
}
