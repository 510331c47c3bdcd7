//! Client version ranges, read from the classified user agent.

use std::cmp::Ordering;

use meridian_core::Context;
use meridian_middleware::stages::UserAgent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse, Condition};
use crate::error::PbacResult;

/// One accepted client and its inclusive version bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionRange {
    /// Client name, compared case-insensitively.
    pub name: String,
    /// Lowest accepted version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    /// Highest accepted version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

impl VersionRange {
    fn accepts(&self, name: &str, version: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            && self
                .min
                .as_deref()
                .map_or(true, |min| compare_versions(version, min) != Ordering::Less)
            && self
                .max
                .as_deref()
                .map_or(true, |max| compare_versions(version, max) != Ordering::Greater)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct VersionSpec {
    /// User-agent field holding the client name.
    name: String,
    version: Vec<VersionRange>,
}

/// Matches clients whose user agent falls in one of the ranges.
///
/// `name` names the user-agent field carrying the client name (usually
/// `"name"`); the version is read from the `version` field. Requests that
/// were not classified never match.
#[derive(Debug, Clone)]
pub struct VersionCondition {
    spec: VersionSpec,
}

impl VersionCondition {
    /// Parses `{"name": "name", "version": [{"name": "Chrome", "min": "100"}]}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value has the wrong shape.
    pub fn from_value(value: Value) -> PbacResult<Self> {
        Ok(Self {
            spec: parse("version", value)?,
        })
    }

    /// Returns true if `ua` is accepted.
    #[must_use]
    pub fn accepts(&self, ua: &UserAgent) -> bool {
        let (Some(name), Some(version)) = (ua.get(&self.spec.name), ua.get("version")) else {
            return false;
        };
        self.spec.version.iter().any(|r| r.accepts(name, version))
    }
}

impl Condition for VersionCondition {
    fn name(&self) -> &'static str {
        "version"
    }

    fn matches(&self, ctx: &Context) -> bool {
        ctx.extensions()
            .get::<UserAgent>()
            .is_some_and(|ua| self.accepts(ua))
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(&self.spec).unwrap_or(Value::Null)
    }
}

fn segment(s: &str) -> u64 {
    let digits = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..digits].parse().unwrap_or(0)
}

/// Compares dot-separated versions segment by segment as integers.
/// Missing segments count as zero.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => {
                let ord = segment(l.unwrap_or("0")).cmp(&segment(r.unwrap_or("0")));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_middleware::stages::{UaRule, UserAgentClassifier};
    use serde_json::json;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("2", "10"), Ordering::Less);
        assert_eq!(compare_versions("120.0.6099.71", "120.0.6099.109"), Ordering::Less);
        assert_eq!(compare_versions("3.1-beta", "3.1"), Ordering::Equal);
    }

    #[test]
    fn test_accepts_ranges() {
        let classifier = UserAgentClassifier::new([UaRule::new("root", "${name}/${version}")
            .field("name", "${name}")
            .field("version", "${version}")])
        .unwrap();
        let cond = VersionCondition::from_value(json!({
            "name": "name",
            "version": [
                {"name": "curl", "min": "7.68", "max": "8.5"},
                {"name": "wget"}
            ]
        }))
        .unwrap();

        assert!(cond.accepts(&classifier.classify("curl/8.1.2")));
        assert!(cond.accepts(&classifier.classify("curl/8.5")));
        assert!(!cond.accepts(&classifier.classify("curl/8.6")));
        assert!(!cond.accepts(&classifier.classify("curl/7.1")));
        assert!(cond.accepts(&classifier.classify("Wget/1.0")));
        assert!(!cond.accepts(&classifier.classify("httpie/3.2")));
        assert!(!cond.accepts(&UserAgent::default()));
    }
}
