//! User-agent classification.
//!
//! Rules are grouped. Each rule is a byte-level [`MatchTree`] pattern with
//! `*` and `${name}` captures, a set of field templates, and optionally the
//! group to continue in. Classification starts in the first group, takes the
//! rule matching the longest prefix of the remaining input, records its
//! fields, and follows `next` with whatever input is left. Every group is
//! entered at most once per pass, so cycles end.
//!
//! The resulting [`UserAgent`] is stored in the context extensions.

use std::collections::{BTreeMap, HashMap};

use http::header::USER_AGENT;
use meridian_core::{BoxFuture, Context, Handler};
use meridian_router::{Delimiters, MatchTree, RouterError};
use serde::{Deserialize, Serialize};

/// Errors building a classifier.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// A rule pattern is malformed.
    #[error(transparent)]
    Pattern(#[from] RouterError),
    /// A rule continues into a group that does not exist.
    #[error("rule '{pattern}' continues into unknown group '{group}'")]
    UnknownGroup {
        /// The rule pattern.
        pattern: String,
        /// The missing group.
        group: String,
    },
}

/// A classification rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UaRule {
    /// Group the rule belongs to.
    pub group: String,
    /// Byte-level pattern.
    pub pattern: String,
    /// Field templates; `$N` and `${name}` refer to captures.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Group to continue matching in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

impl UaRule {
    /// Creates a rule with no fields.
    #[must_use]
    pub fn new(group: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            pattern: pattern.into(),
            fields: BTreeMap::new(),
            next: None,
        }
    }

    /// Adds a field template.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.fields.insert(name.into(), template.into());
        self
    }

    /// Continues into `group` after this rule.
    #[must_use]
    pub fn next(mut self, group: impl Into<String>) -> Self {
        self.next = Some(group.into());
        self
    }
}

/// Classified user-agent fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserAgent {
    fields: BTreeMap<String, String>,
}

impl UserAgent {
    /// Returns field `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// All fields.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Returns true if no rule matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Compiled {
    fields: Vec<(String, String)>,
    next: Option<usize>,
}

/// User-agent classifier middleware.
///
/// # Example
///
/// ```
/// use meridian_middleware::stages::{UaRule, UserAgentClassifier};
///
/// let classifier = UserAgentClassifier::new([
///     UaRule::new("client", "curl/${version}")
///         .field("name", "curl")
///         .field("version", "${version}"),
/// ])
/// .unwrap();
/// let ua = classifier.classify("curl/8.5.0");
/// assert_eq!(ua.get("version"), Some("8.5.0"));
/// ```
#[derive(Debug, Clone)]
pub struct UserAgentClassifier {
    groups: Vec<MatchTree<Compiled>>,
}

impl UserAgentClassifier {
    /// Builds a classifier. The group of the first rule is the entry group.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed patterns or unknown `next` groups.
    pub fn new(rules: impl IntoIterator<Item = UaRule>) -> Result<Self, ClassifierError> {
        let rules: Vec<UaRule> = rules.into_iter().collect();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for rule in &rules {
            let next = index.len();
            index.entry(rule.group.as_str()).or_insert(next);
        }

        let mut groups: Vec<MatchTree<Compiled>> = (0..index.len())
            .map(|_| MatchTree::new(Delimiters::Bytes))
            .collect();
        for rule in &rules {
            let next = match &rule.next {
                Some(group) => Some(*index.get(group.as_str()).ok_or_else(|| {
                    ClassifierError::UnknownGroup {
                        pattern: rule.pattern.clone(),
                        group: group.clone(),
                    }
                })?),
                None => None,
            };
            let compiled = Compiled {
                fields: rule
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                next,
            };
            groups[index[rule.group.as_str()]].insert(&rule.pattern, compiled)?;
        }
        Ok(Self { groups })
    }

    /// Classifies a user-agent string.
    #[must_use]
    pub fn classify(&self, user_agent: &str) -> UserAgent {
        let mut result = UserAgent::default();
        let mut visited = vec![false; self.groups.len()];
        let mut group = 0;
        let mut rest = user_agent;

        while let Some(tree) = self.groups.get(group) {
            if std::mem::replace(&mut visited[group], true) {
                break;
            }
            let Some(m) = tree.find_prefix(rest) else {
                break;
            };
            for (name, template) in &m.value.fields {
                result
                    .fields
                    .insert(name.clone(), m.captures.expand(template));
            }
            rest = &rest[m.consumed..];
            match m.value.next {
                Some(next) => group = next,
                None => break,
            }
        }
        result
    }
}

impl Handler for UserAgentClassifier {
    fn name(&self) -> &'static str {
        "user_agent"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let user_agent = ctx
                .request()
                .header(USER_AGENT)
                .map(|ua| self.classify(ua))
                .unwrap_or_default();
            ctx.extensions_mut().insert(user_agent);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{get, ok, run};

    const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.6099.71 Safari/537.36";

    fn classifier() -> UserAgentClassifier {
        UserAgentClassifier::new([
            UaRule::new("root", "Mozilla/5.0 (").next("platform"),
            UaRule::new("root", "curl/${version}")
                .field("name", "curl")
                .field("version", "${version}"),
            UaRule::new("platform", "Windows NT ${os_version}")
                .field("os", "Windows")
                .field("os_version", "${os_version}")
                .next("browser"),
            UaRule::new("platform", "Macintosh; Intel Mac OS X ${os_version}")
                .field("os", "macOS")
                .field("os_version", "${os_version}")
                .next("browser"),
            UaRule::new("browser", "*Chrome/${version}")
                .field("name", "Chrome")
                .field("version", "${version}"),
            UaRule::new("browser", "*Firefox/${version}")
                .field("name", "Firefox")
                .field("version", "${version}"),
        ])
        .unwrap()
    }

    #[test]
    fn test_chained_groups() {
        let ua = classifier().classify(CHROME);
        assert_eq!(ua.get("os"), Some("Windows"));
        assert_eq!(ua.get("os_version"), Some("10.0"));
        assert_eq!(ua.get("name"), Some("Chrome"));
        assert_eq!(ua.get("version"), Some("120.0.6099.71"));
    }

    #[test]
    fn test_single_rule() {
        let ua = classifier().classify("curl/8.5.0");
        assert_eq!(ua.get("name"), Some("curl"));
        assert_eq!(ua.get("version"), Some("8.5.0"));
        assert!(ua.get("os").is_none());
    }

    #[test]
    fn test_unknown_agent_is_empty() {
        assert!(classifier().classify("SomethingElse/1").is_empty());
    }

    #[test]
    fn test_cycle_terminates() {
        let classifier = UserAgentClassifier::new([
            UaRule::new("a", "x").field("a", "1").next("b"),
            UaRule::new("b", "y").field("b", "1").next("a"),
        ])
        .unwrap();
        let ua = classifier.classify("xyxyxy");
        assert_eq!(ua.get("a"), Some("1"));
        assert_eq!(ua.get("b"), Some("1"));
    }

    #[test]
    fn test_unknown_next_group() {
        let err = UserAgentClassifier::new([UaRule::new("a", "x").next("missing")]).unwrap_err();
        assert!(matches!(err, ClassifierError::UnknownGroup { .. }));
    }

    #[test]
    fn test_rules_deserialize() {
        let rule: UaRule = serde_json::from_str(
            r#"{"group":"root","pattern":"curl/${v}","fields":{"version":"${v}"}}"#,
        )
        .unwrap();
        assert_eq!(rule.fields["version"], "${v}");
        assert!(rule.next.is_none());
    }

    #[tokio::test]
    async fn test_stores_extension() {
        let req = get("/").with_header("user-agent", "curl/8.5.0");
        let (ctx, _) = run(classifier(), ok(), req).await;
        let ua = ctx.extensions().get::<UserAgent>().unwrap();
        assert_eq!(ua.get("name"), Some("curl"));
    }
}
