//! Storage key layout
//!
//! Nodes live at `{namespace}/{env}/{app_id}/{lease_id}`; discovery scans the
//! `{namespace}/{env}/` prefix.

use crate::node::LeaseId;

/// Key a node is stored under.
pub fn node_key(namespace: &str, env: &str, app_id: &str, lease_id: LeaseId) -> String {
    format!("{namespace}/{env}/{app_id}/{lease_id}")
}

/// Prefix covering every node of one env.
///
/// The trailing slash keeps `prod` from matching `prod-canary`.
pub fn env_prefix(namespace: &str, env: &str) -> String {
    format!("{namespace}/{env}/")
}

/// Split a node key back into `(app_id, lease_id)`.
pub fn parse_node_key<'a>(prefix: &str, key: &'a str) -> Option<(&'a str, LeaseId)> {
    let rest = key.strip_prefix(prefix)?;
    let (app_id, lease) = rest.rsplit_once('/')?;
    if app_id.is_empty() {
        return None;
    }
    Some((app_id, lease.parse().ok()?))
}
