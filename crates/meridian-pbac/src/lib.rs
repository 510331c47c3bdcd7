//! Meridian PBAC - policy-based access control.
//!
//! Policies are ordered lists of statements matching an action, a resource
//! and optional conditions. Members bind users to policies. The
//! [`PbacMiddleware`] decides each request from the `action` and `resource`
//! params set upstream (usually by `ResourceTagger`) and the `username`
//! param set by authentication.
//!
//! # Architecture
//!
//! ```text
//!   admin API / policy file
//!            │ put_policy / put_member / load_document
//!   ┌────────▼─────────────────────┐
//!   │ PolicyStore                  │  ordered maps under a lock
//!   │   compile → per-user rules   │
//!   └────────┬─────────────────────┘
//!            │ ArcSwap snapshot
//!   ┌────────▼─────────────────────┐
//!   │ PbacMiddleware               │  evaluate(user) → guest fallback
//!   │   allow: policy param + data │
//!   │   deny:  401 / 403 JSON      │
//!   └──────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use meridian_pbac::{PbacMiddleware, PolicyStore};
//!
//! let store = PolicyStore::new();
//! store
//!     .load_json(r#"{
//!         "policies": [{"name": "readers", "statements": [
//!             {"effect": "allow", "action": ["read:*"], "resource": ["user/*"],
//!              "conditions": {"sourceip": ["10.0.0.0/8"]}}
//!         ]}],
//!         "members": [{"user": "alice", "policy": ["readers"]}]
//!     }"#)
//!     .unwrap();
//! let middleware = PbacMiddleware::new(store.clone());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod condition;
pub mod error;
pub mod middleware;
pub mod policy;
pub mod store;

pub use condition::{register, AllOf, AnyOf, Condition, ConditionFactory};
pub use error::{PbacError, PbacResult};
pub use middleware::{Forbidden, PbacMiddleware, POLICY_PARAM, TRACE_ID_HEADER};
pub use policy::{Effect, Member, Policy, PolicyDocument, Statement};
pub use store::{DataProjection, Decision, PolicyStore, DEFAULT_GUEST};
