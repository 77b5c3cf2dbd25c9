//! Service and method index
//!
//! `ServiceIndex` holds the primary `app_id -> nodes` table and the derived
//! `method -> app_id` table. The method table is never edited on its own:
//! every change to an app's nodes recomputes that app's method entries from
//! its nodes, and full rebuilds derive the whole table from scratch.
//!
//! Method collisions (two apps serving the same method) resolve to the app
//! refreshed most recently. When an owner stops serving a method, another app
//! that still serves it takes the route over.

use crate::error::{Error, Result};
use crate::node::{LeaseId, ServiceNode};
use chrono::NaiveDateTime;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// How a full snapshot is filtered before it becomes the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildPolicy {
    /// Drop nodes whose `run_date` is older than this. `None` keeps every node,
    /// for backends that expire entries natively.
    pub stale_after: Option<Duration>,
}

impl RebuildPolicy {
    pub fn keep_all() -> Self {
        Self { stale_after: None }
    }

    pub fn stale_after(ttl: Duration) -> Self {
        Self {
            stale_after: Some(ttl),
        }
    }
}

/// In-memory `app_id -> nodes` table with its derived method index.
#[derive(Debug, Clone, Default)]
pub struct ServiceIndex {
    service: HashMap<String, Vec<Arc<ServiceNode>>>,
    method: HashMap<String, String>,
}

impl ServiceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a complete index from a snapshot.
    ///
    /// Stale nodes are dropped, each app's list is ordered freshest first and
    /// only the freshest entry per lease survives.
    pub fn rebuild<I>(nodes: I, policy: &RebuildPolicy, now: NaiveDateTime) -> Self
    where
        I: IntoIterator<Item = ServiceNode>,
    {
        let mut service: HashMap<String, Vec<Arc<ServiceNode>>> = HashMap::new();
        for node in nodes {
            if let Some(ttl) = policy.stale_after {
                if node.is_stale(now, ttl) {
                    continue;
                }
            }
            service
                .entry(node.app_id().to_string())
                .or_default()
                .push(Arc::new(node));
        }

        for nodes in service.values_mut() {
            nodes.sort_by(|a, b| ServiceNode::fresher_first(a, b));
            let mut seen = HashSet::new();
            nodes.retain(|n| seen.insert(n.lease_id));
        }

        let mut index = Self {
            service,
            method: HashMap::new(),
        };
        index.derive_methods();
        index.check();
        index
    }

    /// Insert or replace the node for its `(app_id, lease_id)`.
    ///
    /// The node goes to the front of its app's list.
    pub fn upsert(&mut self, node: ServiceNode) {
        let app_id = node.app_id().to_string();
        let nodes = self.service.entry(app_id.clone()).or_default();
        nodes.retain(|n| n.lease_id != node.lease_id);
        nodes.insert(0, Arc::new(node));
        self.refresh_methods(&app_id, true);
        self.check();
    }

    /// Remove one lease of an app. Returns whether anything was removed.
    pub fn remove(&mut self, app_id: &str, lease_id: LeaseId) -> bool {
        let Some(nodes) = self.service.get_mut(app_id) else {
            return false;
        };
        let before = nodes.len();
        nodes.retain(|n| n.lease_id != lease_id);
        let removed = nodes.len() != before;
        if nodes.is_empty() {
            self.service.remove(app_id);
        }
        if removed {
            self.refresh_methods(app_id, false);
        }
        self.check();
        removed
    }

    /// Nodes serving `method`, freshest first.
    pub fn lookup(&self, method: &str) -> Result<Vec<Arc<ServiceNode>>> {
        let app_id = self
            .method
            .get(method)
            .ok_or_else(|| Error::MethodNotFound(method.to_string()))?;
        self.nodes(app_id)
    }

    /// Nodes registered under `app_id`, freshest first.
    pub fn nodes(&self, app_id: &str) -> Result<Vec<Arc<ServiceNode>>> {
        match self.service.get(app_id) {
            Some(nodes) if !nodes.is_empty() => Ok(nodes.clone()),
            _ => Err(Error::NodeNotFound(app_id.to_string())),
        }
    }

    /// App currently owning `method`.
    pub fn owner(&self, method: &str) -> Option<&str> {
        self.method.get(method).map(String::as_str)
    }

    pub fn app_ids(&self) -> impl Iterator<Item = &str> {
        self.service.keys().map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.service.values().map(Vec::len).sum()
    }

    pub fn method_count(&self) -> usize {
        self.method.len()
    }

    pub fn is_empty(&self) -> bool {
        self.service.is_empty()
    }

    /// Check both index invariants.
    ///
    /// Every method entry points at an app with a node serving it, every
    /// served method has an entry, no app list is empty and no app holds the
    /// same lease twice.
    pub fn is_consistent(&self) -> bool {
        for (method, owner) in &self.method {
            let served = self
                .service
                .get(owner)
                .is_some_and(|nodes| nodes.iter().any(|n| n.methods.contains(method)));
            if !served {
                return false;
            }
        }

        for nodes in self.service.values() {
            if nodes.is_empty() {
                return false;
            }
            let mut leases = HashSet::new();
            for node in nodes {
                if !leases.insert(node.lease_id) {
                    return false;
                }
                if node.methods.iter().any(|m| !self.method.contains_key(m)) {
                    return false;
                }
            }
        }
        true
    }

    /// Recompute every method entry of one app from its current nodes.
    ///
    /// `claim` is set when the app was just refreshed and takes contested
    /// routes from other apps. Otherwise it only keeps or picks up routes
    /// nobody else owns.
    fn refresh_methods(&mut self, app_id: &str, claim: bool) {
        let released: Vec<String> = self
            .method
            .iter()
            .filter(|(_, owner)| owner.as_str() == app_id)
            .map(|(method, _)| method.clone())
            .collect();
        for method in &released {
            self.method.remove(method);
        }

        if let Some(nodes) = self.service.get(app_id) {
            let served: BTreeSet<&String> = nodes.iter().flat_map(|n| n.methods.iter()).collect();
            for method in served {
                if claim || !self.method.contains_key(method) {
                    self.method.insert(method.clone(), app_id.to_string());
                }
            }
        }

        // Hand orphaned routes to the freshest app that still serves them.
        for method in released {
            if self.method.contains_key(&method) {
                continue;
            }
            if let Some(heir) = self.freshest_server(&method) {
                self.method.insert(method, heir);
            }
        }
    }

    /// App whose head node is freshest among those serving `method`; ties go
    /// to the smaller app id, as in [`derive_methods`](Self::derive_methods).
    fn freshest_server(&self, method: &str) -> Option<String> {
        self.service
            .iter()
            .filter(|(_, nodes)| nodes.iter().any(|n| n.methods.contains(method)))
            .filter_map(|(app, nodes)| nodes.first().map(|head| (app, head)))
            .min_by(|(a_app, a), (b_app, b)| {
                ServiceNode::fresher_first(a, b).then_with(|| a_app.cmp(b_app))
            })
            .map(|(app, _)| app.clone())
    }

    /// Derive the whole method table; the app with the freshest node wins
    /// collisions.
    fn derive_methods(&mut self) {
        let mut apps: Vec<(&String, &Arc<ServiceNode>)> = self
            .service
            .iter()
            .filter_map(|(app, nodes)| nodes.first().map(|head| (app, head)))
            .collect();
        // Stalest first so fresher apps overwrite.
        apps.sort_by(|(a_app, a), (b_app, b)| {
            ServiceNode::fresher_first(b, a).then_with(|| b_app.cmp(a_app))
        });

        let mut method = HashMap::new();
        for (app, _) in apps {
            for node in &self.service[app] {
                for m in &node.methods {
                    method.insert(m.clone(), app.clone());
                }
            }
        }
        self.method = method;
    }

    fn check(&self) {
        debug_assert!(self.is_consistent(), "service index invariants violated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{format_run_date, Meta, RUN_DATE_FORMAT};

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, RUN_DATE_FORMAT).unwrap()
    }

    fn node(app: &str, lease: LeaseId, methods: &[&str], run_date: &str) -> ServiceNode {
        let mut node = ServiceNode::with_methods(methods.iter().copied());
        node.lease_id = lease;
        node.meta = Meta::new("prod", app, "v1");
        node.run_date = run_date.to_string();
        node
    }

    fn leases(nodes: &[Arc<ServiceNode>]) -> Vec<LeaseId> {
        nodes.iter().map(|n| n.lease_id).collect()
    }

    const T0: &str = "2024-05-01 10:00:00";

    #[test]
    fn test_lookup_errors() {
        let index = ServiceIndex::new();
        assert!(matches!(
            index.lookup("/a.A/X"),
            Err(Error::MethodNotFound(_))
        ));
        assert!(matches!(index.nodes("a"), Err(Error::NodeNotFound(_))));
    }

    #[test]
    fn test_upsert_and_remove_keep_consistency() {
        let mut index = ServiceIndex::new();
        index.upsert(node("a", 1, &["/a.A/X", "/a.A/Y"], T0));
        assert!(index.is_consistent());
        index.upsert(node("b", 7, &["/b.B/Z"], T0));
        assert!(index.is_consistent());
        index.upsert(node("a", 2, &["/a.A/X"], T0));
        assert!(index.is_consistent());
        assert!(index.remove("a", 1));
        assert!(index.is_consistent());
        assert!(index.remove("a", 2));
        assert!(index.is_consistent());

        assert!(index.nodes("a").is_err());
        assert_eq!(index.owner("/a.A/X"), None);
        assert_eq!(index.owner("/b.B/Z"), Some("b"));
        assert!(!index.remove("a", 2));
    }

    #[test]
    fn test_replayed_event_is_idempotent() {
        let mut index = ServiceIndex::new();
        index.upsert(node("a", 1, &["/a.A/X"], T0));
        index.upsert(node("a", 2, &["/a.A/X"], T0));
        let put = node("a", 2, &["/a.A/X", "/a.A/Y"], "2024-05-01 10:00:03");

        index.upsert(put.clone());
        let once = leases(&index.lookup("/a.A/X").unwrap());
        index.upsert(put);
        assert_eq!(leases(&index.lookup("/a.A/X").unwrap()), once);
        assert_eq!(index.method_count(), 2);

        assert!(index.remove("a", 1));
        assert!(!index.remove("a", 1));
        assert_eq!(leases(&index.lookup("/a.A/X").unwrap()), vec![2]);
    }

    #[test]
    fn test_lease_is_unique_within_app() {
        let mut index = ServiceIndex::new();
        for second in 0..5 {
            let run_date = format!("2024-05-01 10:00:0{second}");
            index.upsert(node("a", 1, &["/a.A/X"], &run_date));
        }
        let nodes = index.nodes("a").unwrap();
        assert_eq!(leases(&nodes), vec![1]);
        assert_eq!(nodes[0].run_date, "2024-05-01 10:00:04");
    }

    #[test]
    fn test_dropped_method_is_not_found() {
        let mut index = ServiceIndex::new();
        index.upsert(node("a", 1, &["A", "B"], T0));
        assert!(index.lookup("B").is_ok());

        index.upsert(node("a", 1, &["A"], T0));
        assert!(matches!(index.lookup("B"), Err(Error::MethodNotFound(_))));
        assert_eq!(leases(&index.lookup("A").unwrap()), vec![1]);
    }

    #[test]
    fn test_delete_one_lease_keeps_the_other() {
        let mut index = ServiceIndex::new();
        index.upsert(node("a", 1, &["X"], T0));
        index.upsert(node("a", 2, &["X"], T0));
        assert_eq!(leases(&index.lookup("X").unwrap()), vec![2, 1]);

        index.remove("a", 2);
        assert_eq!(leases(&index.lookup("X").unwrap()), vec![1]);
    }

    #[test]
    fn test_method_collision_hands_over_route() {
        let mut index = ServiceIndex::new();
        index.upsert(node("a", 1, &["X"], T0));
        index.upsert(node("b", 2, &["X"], T0));
        assert_eq!(index.owner("X"), Some("b"));

        // b stops serving X; a still does.
        index.upsert(node("b", 2, &["Y"], T0));
        assert_eq!(index.owner("X"), Some("a"));
        assert!(index.is_consistent());

        index.remove("a", 1);
        assert!(matches!(index.lookup("X"), Err(Error::MethodNotFound(_))));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_removing_lease_leaves_contested_route_alone() {
        let nodes = [
            node("a", 1, &["X"], "2024-05-01 10:00:01"),
            node("a", 2, &["X"], "2024-05-01 10:00:02"),
            node("b", 3, &["X"], "2024-05-01 10:00:03"),
        ];
        let mut index = ServiceIndex::new();
        for n in nodes.iter().cloned() {
            index.upsert(n);
        }
        assert_eq!(index.owner("X"), Some("b"));

        assert!(index.remove("a", 1));
        assert_eq!(index.owner("X"), Some("b"));
        assert!(index.is_consistent());

        let rebuilt = ServiceIndex::rebuild(
            nodes.into_iter().filter(|n| n.lease_id != 1),
            &RebuildPolicy::keep_all(),
            at(T0),
        );
        assert_eq!(rebuilt.owner("X"), index.owner("X"));
    }

    #[test]
    fn test_orphaned_route_goes_to_freshest_server() {
        let mut index = ServiceIndex::new();
        index.upsert(node("a", 1, &["X"], "2024-05-01 10:00:01"));
        index.upsert(node("c", 2, &["X"], "2024-05-01 10:00:05"));
        index.upsert(node("b", 3, &["X"], "2024-05-01 10:00:03"));
        assert_eq!(index.owner("X"), Some("b"));

        index.remove("b", 3);
        assert_eq!(index.owner("X"), Some("c"));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_rebuild_orders_freshest_first() {
        let now = at("2024-05-01 10:00:09");
        let snapshot = vec![
            node("a", 1, &["X"], "2024-05-01 10:00:01"),
            node("a", 3, &["X"], "2024-05-01 10:00:05"),
            node("a", 2, &["X"], "2024-05-01 10:00:05"),
            node("a", 4, &["X"], "2024-05-01 10:00:08"),
        ];
        let index = ServiceIndex::rebuild(snapshot, &RebuildPolicy::stale_after(Duration::from_secs(10)), now);
        let nodes = index.lookup("X").unwrap();
        assert_eq!(leases(&nodes), vec![4, 3, 2, 1]);
        for pair in nodes.windows(2) {
            assert!(pair[0].run_at() >= pair[1].run_at());
        }
        assert!(index.is_consistent());
    }

    #[test]
    fn test_rebuild_drops_stale_nodes() {
        let now = at("2024-05-01 10:01:00");
        let fresh = format_run_date(at("2024-05-01 10:00:55"));
        let snapshot = vec![
            node("a", 1, &["X"], &fresh),
            node("a", 2, &["X"], "2024-05-01 10:00:49"),
            node("b", 3, &["Y"], "2024-05-01 10:00:00"),
            node("c", 4, &["Z"], "garbage"),
        ];
        let index = ServiceIndex::rebuild(
            snapshot.clone(),
            &RebuildPolicy::stale_after(Duration::from_secs(10)),
            now,
        );
        assert_eq!(leases(&index.lookup("X").unwrap()), vec![1]);
        assert!(matches!(index.lookup("Y"), Err(Error::MethodNotFound(_))));
        assert!(matches!(index.lookup("Z"), Err(Error::MethodNotFound(_))));
        assert_eq!(index.node_count(), 1);

        let kept = ServiceIndex::rebuild(snapshot, &RebuildPolicy::keep_all(), now);
        assert_eq!(kept.node_count(), 4);
    }

    #[test]
    fn test_rebuild_dedupes_leases_keeping_freshest() {
        let snapshot = vec![
            node("a", 1, &["X"], "2024-05-01 10:00:01"),
            node("a", 1, &["X", "Y"], "2024-05-01 10:00:07"),
        ];
        let index = ServiceIndex::rebuild(snapshot, &RebuildPolicy::keep_all(), at(T0));
        let nodes = index.nodes("a").unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].run_date, "2024-05-01 10:00:07");
        assert!(index.lookup("Y").is_ok());
    }

    #[test]
    fn test_rebuild_collision_prefers_freshest_app() {
        let snapshot = vec![
            node("old", 1, &["X"], "2024-05-01 10:00:01"),
            node("new", 2, &["X"], "2024-05-01 10:00:06"),
        ];
        let index = ServiceIndex::rebuild(snapshot, &RebuildPolicy::keep_all(), at(T0));
        assert_eq!(index.owner("X"), Some("new"));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_lookup_returns_independent_copy() {
        let mut index = ServiceIndex::new();
        index.upsert(node("a", 1, &["X"], T0));
        let mut copy = index.lookup("X").unwrap();
        copy.clear();
        assert_eq!(index.lookup("X").unwrap().len(), 1);
    }
}
