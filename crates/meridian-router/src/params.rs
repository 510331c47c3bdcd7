//! Ordered request parameters.
//!
//! Parameters are produced by the router in discovery order and extended by
//! middleware (`userid`, `action`, `policy`, ...). Keys may repeat; lookups
//! return the most recently pushed value.

use smallvec::SmallVec;

/// Maximum number of parameters stored inline (stack allocated).
const INLINE_PARAMS: usize = 4;

/// Ordered `(name, value)` pairs.
///
/// # Example
///
/// ```rust
/// use meridian_router::Params;
///
/// let mut params = Params::new();
/// params.push("list", "orders");
/// params.push("route", "/api/v1/:list");
/// params.push("list", "users");
///
/// assert_eq!(params.get("list"), Some("users"));
/// assert_eq!(params.get_all("list").collect::<Vec<_>>(), vec!["orders", "users"]);
/// assert_eq!(params.get("unknown"), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Params {
    inner: SmallVec<[(String, String); INLINE_PARAMS]>,
}

impl Params {
    /// Creates a new empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a params set with the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: SmallVec::with_capacity(capacity),
        }
    }

    /// Appends a parameter, keeping earlier values with the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with a single trailing entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.inner.retain(|(n, _)| *n != name);
        self.inner.push((name, value.into()));
    }

    /// Returns the last value pushed for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value of `name` in push order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` if any value is stored under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(n, _)| n == name)
    }

    /// Removes every value of `name`, returning the last one.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut last = None;
        self.inner.retain(|(n, v)| {
            if n.as_str() == name {
                last = Some(std::mem::take(v));
                false
            } else {
                true
            }
        });
        last
    }

    /// Returns true if there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns an iterator over the parameters.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Appends every pair of `other` in order.
    pub fn extend_from(&mut self, other: &Params) {
        self.inner.extend(other.inner.iter().cloned());
    }

    /// Clears all parameters, retaining allocated capacity.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.inner.truncate(len);
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a str, &'a str);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, String)>,
        fn(&'a (String, String)) -> (&'a str, &'a str),
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Params {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_new() {
        let params = Params::new();
        assert!(params.is_empty());
        assert_eq!(params.len(), 0);
    }

    #[test]
    fn test_params_get_returns_last() {
        let mut params = Params::new();
        params.push("id", "123");
        params.push("name", "alice");
        params.push("id", "456");

        assert_eq!(params.get("id"), Some("456"));
        assert_eq!(params.get("name"), Some("alice"));
        assert_eq!(params.get("unknown"), None);
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_params_set_replaces_all() {
        let mut params = Params::new();
        params.push("a", "1");
        params.push("b", "2");
        params.push("a", "3");
        params.set("a", "9");

        let pairs: Vec<_> = params.iter().collect();
        assert_eq!(pairs, vec![("b", "2"), ("a", "9")]);
    }

    #[test]
    fn test_params_remove() {
        let mut params = Params::new();
        params.push("a", "1");
        params.push("a", "2");
        params.push("b", "3");

        assert_eq!(params.remove("a"), Some("2".to_string()));
        assert!(!params.contains("a"));
        assert_eq!(params.remove("a"), None);
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_params_iter_order() {
        let params: Params = [("a", "1"), ("b", "2")].into_iter().collect();
        let pairs: Vec<_> = (&params).into_iter().collect();
        assert_eq!(pairs, vec![("a", "1"), ("b", "2")]);
    }

    #[test]
    fn test_params_truncate_and_clear() {
        let mut params = Params::new();
        params.push("a", "1");
        params.push("b", "2");
        params.truncate(1);
        assert_eq!(params.get("b"), None);

        params.clear();
        assert!(params.is_empty());
    }

    #[test]
    fn test_params_many_params() {
        let mut params = Params::new();
        for i in 0..10 {
            params.push(format!("key{i}"), format!("value{i}"));
        }

        assert_eq!(params.len(), 10);
        assert_eq!(params.get("key5"), Some("value5"));
    }
}
