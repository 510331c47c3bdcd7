//! Statement conditions.
//!
//! A statement's `conditions` is a JSON object whose keys name conditions
//! and whose values configure them:
//!
//! ```json
//! {"sourceip": ["10.0.0.0/8"], "method": ["GET"], "or": {"path": ["/a"], "params": {"team": ["x"]}}}
//! ```
//!
//! The object is an implicit `and`; key order is kept so evaluation and
//! serialization follow the document. Each key is resolved through the
//! process-wide registry, which holds the built-in conditions and anything
//! added with [`register`].

mod clock;
mod rate;
mod request;
mod version;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use meridian_core::Context;
use parking_lot::RwLock;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{PbacError, PbacResult};

pub use clock::{DateWindow, TimeWindow};
pub use rate::RateCondition;
pub use request::{MethodCondition, ParamsCondition, PathCondition, SourceIpCondition};
pub use version::{compare_versions, VersionCondition, VersionRange};

/// A predicate over the request.
pub trait Condition: Send + Sync + fmt::Debug {
    /// Registry name, used as the JSON key.
    fn name(&self) -> &'static str;

    /// Returns true if the request satisfies the condition.
    fn matches(&self, ctx: &Context) -> bool;

    /// The JSON value this condition was built from.
    fn to_value(&self) -> Value;
}

/// Builds a condition from its JSON value.
pub type ConditionFactory = fn(Value) -> PbacResult<Arc<dyn Condition>>;

static REGISTRY: LazyLock<RwLock<HashMap<String, ConditionFactory>>> = LazyLock::new(|| {
    let builtin: [(&str, ConditionFactory); 10] = [
        ("and", |v| Ok(Arc::new(AllOf::from_value(v)?))),
        ("or", |v| Ok(Arc::new(AnyOf::from_value(v)?))),
        ("sourceip", |v| Ok(Arc::new(SourceIpCondition::from_value(v)?))),
        ("date", |v| Ok(Arc::new(DateWindow::from_value(v)?))),
        ("time", |v| Ok(Arc::new(TimeWindow::from_value(v)?))),
        ("method", |v| Ok(Arc::new(MethodCondition::from_value(v)?))),
        ("path", |v| Ok(Arc::new(PathCondition::from_value(v)?))),
        ("params", |v| Ok(Arc::new(ParamsCondition::from_value(v)?))),
        ("rate", |v| Ok(Arc::new(RateCondition::from_value(v)?))),
        ("version", |v| Ok(Arc::new(VersionCondition::from_value(v)?))),
    ];
    RwLock::new(
        builtin
            .into_iter()
            .map(|(name, factory)| (name.to_string(), factory))
            .collect(),
    )
});

/// Registers a condition factory under `name`, replacing any previous one.
pub fn register(name: impl Into<String>, factory: ConditionFactory) {
    REGISTRY.write().insert(name.into(), factory);
}

/// Builds the condition registered under `name`.
///
/// # Errors
///
/// Returns [`PbacError::UnknownCondition`] for unregistered names, or the
/// factory's error for a malformed value.
pub fn build(name: &str, value: Value) -> PbacResult<Arc<dyn Condition>> {
    let factory = REGISTRY
        .read()
        .get(name)
        .copied()
        .ok_or_else(|| PbacError::UnknownCondition(name.to_string()))?;
    factory(value)
}

/// Deserializes a condition value into `T`, naming the condition on error.
pub(crate) fn parse<T: serde::de::DeserializeOwned>(name: &str, value: Value) -> PbacResult<T> {
    serde_json::from_value(value).map_err(|e| PbacError::invalid_condition(name, e))
}

fn build_group(name: &str, value: Value) -> PbacResult<Vec<Arc<dyn Condition>>> {
    let Value::Object(map) = value else {
        return Err(PbacError::invalid_condition(name, "expected an object of conditions"));
    };
    map.into_iter().map(|(key, value)| build(&key, value)).collect()
}

fn group_value(conditions: &[Arc<dyn Condition>]) -> Value {
    Value::Object(
        conditions
            .iter()
            .map(|c| (c.name().to_string(), c.to_value()))
            .collect::<Map<String, Value>>(),
    )
}

/// Conjunction of conditions; the shape of a statement's `conditions`.
#[derive(Clone, Default)]
pub struct AllOf {
    conditions: Vec<Arc<dyn Condition>>,
}

impl AllOf {
    /// Builds from a JSON object of named conditions.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names or malformed values.
    pub fn from_value(value: Value) -> PbacResult<Self> {
        Ok(Self {
            conditions: build_group("and", value)?,
        })
    }

    /// Creates a conjunction of already built conditions.
    #[must_use]
    pub fn new(conditions: Vec<Arc<dyn Condition>>) -> Self {
        Self { conditions }
    }

    /// Number of conditions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    /// Returns true if there are no conditions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

impl fmt::Debug for AllOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.conditions).finish()
    }
}

impl Condition for AllOf {
    fn name(&self) -> &'static str {
        "and"
    }

    fn matches(&self, ctx: &Context) -> bool {
        self.conditions.iter().all(|c| c.matches(ctx))
    }

    fn to_value(&self) -> Value {
        group_value(&self.conditions)
    }
}

impl Serialize for AllOf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AllOf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Map::<String, Value>::deserialize(deserializer)?;
        Self::from_value(Value::Object(value)).map_err(D::Error::custom)
    }
}

/// Disjunction of conditions. An empty `or` never matches.
#[derive(Clone)]
pub struct AnyOf {
    conditions: Vec<Arc<dyn Condition>>,
}

impl AnyOf {
    /// Builds from a JSON object of named conditions.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names or malformed values.
    pub fn from_value(value: Value) -> PbacResult<Self> {
        Ok(Self {
            conditions: build_group("or", value)?,
        })
    }
}

impl fmt::Debug for AnyOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AnyOf").field(&self.conditions).finish()
    }
}

impl Condition for AnyOf {
    fn name(&self) -> &'static str {
        "or"
    }

    fn matches(&self, ctx: &Context) -> bool {
        self.conditions.iter().any(|c| c.matches(ctx))
    }

    fn to_value(&self) -> Value {
        group_value(&self.conditions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};
    use meridian_core::Request;
    use serde_json::json;

    fn ctx(method: Method, uri: &str, ip: &str) -> Context {
        let req = Request::new(method, uri.parse::<Uri>().unwrap()).with_header("x-forwarded-for", ip);
        Context::recorded(req).0
    }

    #[test]
    fn test_roundtrip_keeps_key_order() {
        let doc = json!({
            "sourceip": ["10.0.0.0/8"],
            "method": ["GET", "HEAD"],
            "or": {"path": ["/a"], "params": {"team": ["core"]}}
        });
        let conditions: AllOf = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(conditions.len(), 3);
        let back = serde_json::to_string(&conditions).unwrap();
        assert_eq!(back, serde_json::to_string(&doc).unwrap());
    }

    #[test]
    fn test_unknown_condition_rejected() {
        let err = serde_json::from_value::<AllOf>(json!({"moon": "full"})).unwrap_err();
        assert!(err.to_string().contains("unknown condition 'moon'"));
    }

    #[test]
    fn test_and_or_semantics() {
        let conditions: AllOf = serde_json::from_value(json!({
            "sourceip": ["10.0.0.0/8"],
            "or": {"method": ["POST"], "path": ["/public"]}
        }))
        .unwrap();

        assert!(conditions.matches(&ctx(Method::POST, "/x", "10.1.1.1")));
        assert!(conditions.matches(&ctx(Method::GET, "/public", "10.1.1.1")));
        assert!(!conditions.matches(&ctx(Method::GET, "/x", "10.1.1.1")));
        assert!(!conditions.matches(&ctx(Method::POST, "/x", "192.168.1.1")));
    }

    #[test]
    fn test_empty_and_matches_empty_or_does_not() {
        let ctx = ctx(Method::GET, "/", "10.0.0.1");
        assert!(AllOf::default().matches(&ctx));
        let any = AnyOf::from_value(json!({})).unwrap();
        assert!(!any.matches(&ctx));
    }

    #[derive(Debug)]
    struct Never;

    impl Condition for Never {
        fn name(&self) -> &'static str {
            "never"
        }

        fn matches(&self, _: &Context) -> bool {
            false
        }

        fn to_value(&self) -> Value {
            Value::Bool(true)
        }
    }

    #[test]
    fn test_register_custom_condition() {
        register("never", |_| Ok(Arc::new(Never)));
        let conditions: AllOf = serde_json::from_value(json!({"never": true})).unwrap();
        assert!(!conditions.matches(&ctx(Method::GET, "/", "10.0.0.1")));
        assert_eq!(serde_json::to_value(&conditions).unwrap(), json!({"never": true}));
    }
}
