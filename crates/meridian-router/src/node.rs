//! Radix tree node implementation.
//!
//! Constant children are compressed: no two of them start with the same
//! character, so a lookup picks at most one constant child by binary search
//! on the first character. Parameter and wildcard children are kept in
//! priority order (validated before plain, then registration order).

use std::sync::Arc;

use crate::params::Params;
use crate::pattern::Segment;
use crate::validator::Validator;

/// Kind of a radix node, in match priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeKind {
    /// Literal text.
    Const,
    /// `:name<validator>`
    ValidatedParam,
    /// `:name`
    Param,
    /// `*name<validator>`
    ValidatedWildcard,
    /// `*name`
    Wildcard,
}

/// A value registered at a terminal node.
#[derive(Debug, Clone)]
pub(crate) struct Entry<T> {
    pub(crate) value: T,
    pub(crate) pattern: Arc<str>,
    /// Installed by an `ANY` registration rather than an explicit method.
    pub(crate) from_any: bool,
}

/// A node in the radix tree.
#[derive(Debug, Clone)]
pub struct Node<T> {
    path: String,
    kind: NodeKind,
    name: String,
    validator: Option<Arc<Validator>>,
    consts: Vec<Node<T>>,
    params: Vec<Node<T>>,
    wildcards: Vec<Node<T>>,
    pub(crate) entry: Option<Entry<T>>,
}

impl<T> Node<T> {
    /// Creates an empty root node.
    pub(crate) fn root() -> Self {
        Self::constant(String::new())
    }

    fn constant(path: String) -> Self {
        Self {
            path,
            kind: NodeKind::Const,
            name: String::new(),
            validator: None,
            consts: Vec::new(),
            params: Vec::new(),
            wildcards: Vec::new(),
            entry: None,
        }
    }

    fn capture(kind: NodeKind, name: &str, validator: Option<Arc<Validator>>) -> Self {
        Self {
            path: String::new(),
            kind,
            name: name.to_string(),
            validator,
            consts: Vec::new(),
            params: Vec::new(),
            wildcards: Vec::new(),
            entry: None,
        }
    }

    /// The literal text of a constant node.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The node kind.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// The parameter name of a parameter or wildcard node.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn first_char(&self) -> Option<char> {
        self.path.chars().next()
    }

    fn has_children(&self) -> bool {
        !(self.consts.is_empty() && self.params.is_empty() && self.wildcards.is_empty())
    }

    fn accepts(&self, segment: &str) -> bool {
        self.validator.as_ref().map_or(true, |v| v.accepts(segment))
    }

    /// Walks `segments` from this node, creating and splitting nodes as
    /// needed, and returns the terminal node.
    pub(crate) fn insert(&mut self, segments: &[Segment]) -> &mut Node<T> {
        let Some((first, rest)) = segments.split_first() else {
            return self;
        };

        let child = match first {
            Segment::Literal(text) => self.const_child(text),
            Segment::Param { name, validator } => self.capture_child(false, name, validator),
            Segment::Wildcard { name, validator } => self.capture_child(true, name, validator),
        };
        child.insert(rest)
    }

    fn const_child(&mut self, text: &str) -> &mut Node<T> {
        let first = text.chars().next();
        match self.consts.binary_search_by(|c| c.first_char().cmp(&first)) {
            Ok(i) => {
                let child = &mut self.consts[i];
                let common = common_prefix(&child.path, text);
                if common < child.path.len() {
                    child.split(common);
                }
                if common == text.len() {
                    return child;
                }
                child.const_child(&text[common..])
            }
            Err(i) => {
                self.consts.insert(i, Node::constant(text.to_string()));
                &mut self.consts[i]
            }
        }
    }

    /// Splits a constant node at byte offset `at`, pushing the suffix and
    /// all children into a new single child.
    fn split(&mut self, at: usize) {
        let suffix = self.path.split_off(at);
        let child = Node {
            path: suffix,
            kind: NodeKind::Const,
            name: String::new(),
            validator: None,
            consts: std::mem::take(&mut self.consts),
            params: std::mem::take(&mut self.params),
            wildcards: std::mem::take(&mut self.wildcards),
            entry: self.entry.take(),
        };
        self.consts = vec![child];
    }

    fn capture_child(
        &mut self,
        wildcard: bool,
        name: &str,
        validator: &Option<Arc<Validator>>,
    ) -> &mut Node<T> {
        let kind = match (wildcard, validator.is_some()) {
            (false, true) => NodeKind::ValidatedParam,
            (false, false) => NodeKind::Param,
            (true, true) => NodeKind::ValidatedWildcard,
            (true, false) => NodeKind::Wildcard,
        };
        let group = if wildcard {
            &mut self.wildcards
        } else {
            &mut self.params
        };

        let existing = group
            .iter()
            .position(|n| n.kind == kind && n.name == name && n.validator == *validator);
        let index = match existing {
            Some(i) => i,
            None => {
                // Validated children precede plain ones; registration order within.
                let at = group.partition_point(|n| n.kind <= kind);
                group.insert(at, Node::capture(kind, name, validator.clone()));
                at
            }
        };
        &mut group[index]
    }

    /// Matches `rest` below this node, pushing captured parameters.
    ///
    /// On failure `params` is restored to its length on entry.
    pub(crate) fn walk<'a>(&'a self, rest: &str, params: &mut Params) -> Option<&'a Entry<T>> {
        if rest.is_empty() {
            if let Some(entry) = &self.entry {
                return Some(entry);
            }
        }

        if let Some(first) = rest.chars().next() {
            if let Ok(i) = self
                .consts
                .binary_search_by(|c| c.first_char().cmp(&Some(first)))
            {
                let child = &self.consts[i];
                if let Some(remainder) = rest.strip_prefix(child.path.as_str()) {
                    if let Some(entry) = child.walk(remainder, params) {
                        return Some(entry);
                    }
                }
            }
        }

        if !rest.is_empty() {
            let end = rest.find('/').unwrap_or(rest.len());
            let segment = &rest[..end];
            if !segment.is_empty() {
                for child in &self.params {
                    if let Some(entry) = child.capture_and_walk(segment, &rest[end..], params) {
                        return Some(entry);
                    }
                }
            }
        }

        for child in &self.wildcards {
            if child.has_children() {
                for (i, _) in rest.match_indices('/') {
                    if i == 0 {
                        continue;
                    }
                    if let Some(entry) = child.capture_and_walk(&rest[..i], &rest[i..], params) {
                        return Some(entry);
                    }
                }
            }
            if child.entry.is_some() {
                if let Some(entry) = child.capture_and_walk(rest, "", params) {
                    return Some(entry);
                }
            }
        }

        None
    }

    fn capture_and_walk<'a>(
        &'a self,
        segment: &str,
        remainder: &str,
        params: &mut Params,
    ) -> Option<&'a Entry<T>> {
        if !self.accepts(segment) {
            return None;
        }
        let mark = params.len();
        params.push(self.name.as_str(), segment);
        let found = self.walk(remainder, params);
        if found.is_none() {
            params.truncate(mark);
        }
        found
    }
}

/// Length in bytes of the common prefix, on a char boundary.
fn common_prefix(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map_or_else(|| a.len().min(b.len()), |((i, _), _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern;

    fn add(root: &mut Node<&'static str>, route: &'static str) {
        let segments = pattern::parse(route).unwrap();
        root.insert(&segments).entry = Some(Entry {
            value: route,
            pattern: Arc::from(route),
            from_any: false,
        });
    }

    fn find(root: &Node<&'static str>, path: &str) -> Option<(&'static str, Params)> {
        let mut params = Params::new();
        root.walk(path, &mut params).map(|e| (e.value, params))
    }

    #[test]
    fn test_common_prefix() {
        assert_eq!(common_prefix("/users", "/usage"), 3);
        assert_eq!(common_prefix("/a", "/a/b"), 2);
        assert_eq!(common_prefix("héllo", "hèllo"), 1);
        assert_eq!(common_prefix("", "x"), 0);
    }

    #[test]
    fn test_split_keeps_const_children_disjoint() {
        let mut root = Node::root();
        add(&mut root, "/users");
        add(&mut root, "/usage");
        add(&mut root, "/u");

        assert_eq!(root.consts.len(), 1);
        let u = &root.consts[0];
        assert_eq!(u.path(), "/u");
        assert!(u.entry.is_some());
        assert_eq!(u.consts.len(), 1);
        assert_eq!(u.consts[0].path(), "s");

        assert_eq!(find(&root, "/users").unwrap().0, "/users");
        assert_eq!(find(&root, "/usage").unwrap().0, "/usage");
        assert_eq!(find(&root, "/u").unwrap().0, "/u");
        assert!(find(&root, "/us").is_none());
    }

    #[test]
    fn test_multibyte_split() {
        let mut root = Node::root();
        add(&mut root, "/héllo");
        add(&mut root, "/hèllo");

        assert_eq!(find(&root, "/héllo").unwrap().0, "/héllo");
        assert_eq!(find(&root, "/hèllo").unwrap().0, "/hèllo");
    }

    #[test]
    fn test_param_dedup() {
        let mut root = Node::root();
        add(&mut root, "/users/:id");
        add(&mut root, "/users/:id/posts");

        let users = &root.consts[0];
        assert_eq!(users.params.len(), 1);
        assert_eq!(users.params[0].kind(), NodeKind::Param);
        assert_eq!(users.params[0].name(), "id");
    }

    #[test]
    fn test_validated_param_ordered_first() {
        let mut root = Node::root();
        add(&mut root, "/items/:slug");
        add(&mut root, "/items/:id<isnum>");

        let items = &root.consts[0];
        assert_eq!(items.params[0].kind(), NodeKind::ValidatedParam);
        assert_eq!(items.params[1].kind(), NodeKind::Param);

        let (route, params) = find(&root, "/items/42").unwrap();
        assert_eq!(route, "/items/:id<isnum>");
        assert_eq!(params.get("id"), Some("42"));

        let (route, params) = find(&root, "/items/hat").unwrap();
        assert_eq!(route, "/items/:slug");
        assert_eq!(params.get("slug"), Some("hat"));
    }

    #[test]
    fn test_backtracking_restores_params() {
        let mut root = Node::root();
        add(&mut root, "/a/:x/b");
        add(&mut root, "/a/*rest");

        let (route, params) = find(&root, "/a/1/c").unwrap();
        assert_eq!(route, "/a/*rest");
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("rest"), Some("1/c"));
        assert_eq!(params.get("x"), None);
    }

    #[test]
    fn test_wildcard_with_children() {
        let mut root = Node::root();
        add(&mut root, "/repo/*owner/settings");

        let (route, params) = find(&root, "/repo/acme/settings").unwrap();
        assert_eq!(route, "/repo/*owner/settings");
        assert_eq!(params.get("owner"), Some("acme"));

        let (_, params) = find(&root, "/repo/acme/team/settings").unwrap();
        assert_eq!(params.get("owner"), Some("acme/team"));

        assert!(find(&root, "/repo/acme").is_none());
    }

    #[test]
    fn test_param_rejects_empty_segment() {
        let mut root = Node::root();
        add(&mut root, "/users/:id");
        assert!(find(&root, "/users/").is_none());
    }
}
