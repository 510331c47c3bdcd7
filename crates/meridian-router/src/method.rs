//! Method indexing for the per-method route trees.

use std::fmt;
use std::str::FromStr;

use http::Method;

use crate::RouterError;

/// The number of route trees a router keeps.
pub(crate) const TREE_COUNT: usize = 10;

/// Selects one of the per-method route trees.
///
/// `Any` is a pseudo-method: routes registered under it are installed into
/// every concrete tree that has no explicit registration for the same
/// pattern, and its own tree serves methods without a dedicated tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
    /// `HEAD`
    Head,
    /// `PATCH`
    Patch,
    /// `OPTIONS`
    Options,
    /// `CONNECT`
    Connect,
    /// `TRACE`
    Trace,
    /// Any method.
    Any,
}

impl MethodKind {
    /// All concrete methods in tree order.
    pub const CONCRETE: [MethodKind; 9] = [
        MethodKind::Get,
        MethodKind::Post,
        MethodKind::Put,
        MethodKind::Delete,
        MethodKind::Head,
        MethodKind::Patch,
        MethodKind::Options,
        MethodKind::Connect,
        MethodKind::Trace,
    ];

    /// Maps a request method onto its tree, `None` for extension methods.
    #[must_use]
    pub fn from_method(method: &Method) -> Option<Self> {
        let kind = match *method {
            Method::GET => Self::Get,
            Method::POST => Self::Post,
            Method::PUT => Self::Put,
            Method::DELETE => Self::Delete,
            Method::HEAD => Self::Head,
            Method::PATCH => Self::Patch,
            Method::OPTIONS => Self::Options,
            Method::CONNECT => Self::Connect,
            Method::TRACE => Self::Trace,
            _ => return None,
        };
        Some(kind)
    }

    /// Returns the HTTP method, `None` for [`MethodKind::Any`].
    #[must_use]
    pub fn to_method(self) -> Option<Method> {
        let method = match self {
            Self::Get => Method::GET,
            Self::Post => Method::POST,
            Self::Put => Method::PUT,
            Self::Delete => Method::DELETE,
            Self::Head => Method::HEAD,
            Self::Patch => Method::PATCH,
            Self::Options => Method::OPTIONS,
            Self::Connect => Method::CONNECT,
            Self::Trace => Method::TRACE,
            Self::Any => return None,
        };
        Some(method)
    }

    /// Upper-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Patch => "PATCH",
            Self::Options => "OPTIONS",
            Self::Connect => "CONNECT",
            Self::Trace => "TRACE",
            Self::Any => "ANY",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl FromStr for MethodKind {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("ANY") {
            return Ok(Self::Any);
        }
        let method = Method::from_bytes(s.to_ascii_uppercase().as_bytes())
            .map_err(|_| RouterError::UnsupportedMethod(s.to_string()))?;
        Self::from_method(&method).ok_or_else(|| RouterError::UnsupportedMethod(s.to_string()))
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_dense() {
        for (i, kind) in MethodKind::CONCRETE.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert_eq!(MethodKind::Any.index(), TREE_COUNT - 1);
    }

    #[test]
    fn test_round_trip_method() {
        for kind in MethodKind::CONCRETE {
            let method = kind.to_method().unwrap();
            assert_eq!(MethodKind::from_method(&method), Some(kind));
        }
        assert_eq!(MethodKind::Any.to_method(), None);
    }

    #[test]
    fn test_parse() {
        assert_eq!("get".parse::<MethodKind>().unwrap(), MethodKind::Get);
        assert_eq!("ANY".parse::<MethodKind>().unwrap(), MethodKind::Any);
        assert!(matches!(
            "PROPFIND".parse::<MethodKind>(),
            Err(RouterError::UnsupportedMethod(_))
        ));
    }
}
