//! IP black/allow list.
//!
//! A request whose real IP falls in a deny entry is refused with 403 unless
//! an allow entry also contains it. Entries are CIDR networks and can be
//! changed at runtime through the admin API.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use meridian_core::{BoxFuture, Context, Handler, IpNet, MeridianError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Which list an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    /// Exceptions to the deny list.
    Allow,
    /// Refused networks.
    Deny,
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        })
    }
}

/// Error for an unknown list name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown list '{0}', expected allow or deny")]
pub struct UnknownList(pub String);

impl FromStr for ListKind {
    type Err = UnknownList;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" | "white" => Ok(Self::Allow),
            "deny" | "black" => Ok(Self::Deny),
            _ => Err(UnknownList(s.to_string())),
        }
    }
}

/// Both lists, as reported by the admin API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpLists {
    /// Allow entries.
    pub allow: Vec<IpNet>,
    /// Deny entries.
    pub deny: Vec<IpNet>,
}

impl IpLists {
    fn list_mut(&mut self, kind: ListKind) -> &mut Vec<IpNet> {
        match kind {
            ListKind::Allow => &mut self.allow,
            ListKind::Deny => &mut self.deny,
        }
    }
}

/// Shared IP filter, also usable as middleware.
#[derive(Debug, Clone, Default)]
pub struct IpFilter {
    lists: Arc<RwLock<IpLists>>,
}

impl IpFilter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a filter with initial lists.
    #[must_use]
    pub fn with_lists(lists: IpLists) -> Self {
        Self {
            lists: Arc::new(RwLock::new(lists)),
        }
    }

    /// Adds `net` to a list. Returns `false` if it was already present.
    pub fn add(&self, kind: ListKind, net: IpNet) -> bool {
        let mut lists = self.lists.write();
        let list = lists.list_mut(kind);
        if list.contains(&net) {
            return false;
        }
        list.push(net);
        true
    }

    /// Removes `net` from a list. Returns `false` if it was absent.
    pub fn remove(&self, kind: ListKind, net: IpNet) -> bool {
        let mut lists = self.lists.write();
        let list = lists.list_mut(kind);
        let before = list.len();
        list.retain(|n| *n != net);
        list.len() != before
    }

    /// A copy of both lists.
    #[must_use]
    pub fn snapshot(&self) -> IpLists {
        self.lists.read().clone()
    }

    /// Returns `true` if `ip` may pass.
    #[must_use]
    pub fn permits(&self, ip: IpAddr) -> bool {
        let lists = self.lists.read();
        !lists.deny.iter().any(|n| n.contains(ip)) || lists.allow.iter().any(|n| n.contains(ip))
    }
}

impl Handler for IpFilter {
    fn name(&self) -> &'static str {
        "ip_filter"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(ip) = ctx.real_ip() else {
                return;
            };
            if !self.permits(ip) {
                tracing::debug!(%ip, "address blocked");
                ctx.fail(MeridianError::authorization(format!("address {ip} is blocked")))
                    .await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{get, ok, run};
    use http::StatusCode;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_deny_with_allow_exception() {
        let filter = IpFilter::new();
        filter.add(ListKind::Deny, net("10.0.0.0/8"));
        filter.add(ListKind::Allow, net("10.1.0.0/16"));

        assert!(!filter.permits("10.2.3.4".parse().unwrap()));
        assert!(filter.permits("10.1.3.4".parse().unwrap()));
        assert!(filter.permits("192.168.0.1".parse().unwrap()));
    }

    #[test]
    fn test_add_remove() {
        let filter = IpFilter::new();
        assert!(filter.add(ListKind::Deny, net("1.2.3.4")));
        assert!(!filter.add(ListKind::Deny, net("1.2.3.4/32")));
        assert!(filter.remove(ListKind::Deny, net("1.2.3.4")));
        assert!(!filter.remove(ListKind::Deny, net("1.2.3.4")));
        assert_eq!(filter.snapshot(), IpLists::default());
    }

    #[test]
    fn test_list_kind_parse() {
        assert_eq!("allow".parse::<ListKind>().unwrap(), ListKind::Allow);
        assert_eq!("black".parse::<ListKind>().unwrap(), ListKind::Deny);
        assert!("grey".parse::<ListKind>().is_err());
    }

    #[test]
    fn test_snapshot_serializes() {
        let filter = IpFilter::new();
        filter.add(ListKind::Deny, net("10.0.0.0/8"));
        let json = serde_json::to_value(filter.snapshot()).unwrap();
        assert_eq!(json["deny"][0], "10.0.0.0/8");
    }

    #[tokio::test]
    async fn test_blocked_request_forbidden() {
        let filter = IpFilter::new();
        filter.add(ListKind::Deny, net("203.0.113.0/24"));

        let req = get("/").with_header("x-forwarded-for", "203.0.113.9");
        let (_, recording) = run(filter.clone(), ok(), req).await;
        assert_eq!(recording.status(), StatusCode::FORBIDDEN);

        let req = get("/").with_header("x-forwarded-for", "198.51.100.1");
        let (_, recording) = run(filter, ok(), req).await;
        assert_eq!(recording.status(), StatusCode::OK);
    }
}
