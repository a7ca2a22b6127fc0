//! Live resource tree mirrored from a destination cluster
//!
//! The tree is a flat list of nodes; ownership is expressed through each
//! node's `parentRefs`. Lookups that walk ownership (e.g. "every Pod owned by
//! this Deployment") are reachability queries over that list.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::crd::HealthStatus;

/// Kind name of core/v1 Pods
pub const POD_KIND: &str = "Pod";

/// Identifies one object in a cluster
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// API group (empty for core)
    #[serde(default)]
    pub group: String,
    /// API version
    #[serde(default)]
    pub version: String,
    /// Kind
    pub kind: String,
    /// Namespace (empty for cluster-scoped objects)
    #[serde(default)]
    pub namespace: String,
    /// Name
    pub name: String,
    /// Object UID
    #[serde(default)]
    pub uid: String,
}

impl ResourceRef {
    /// Whether this reference names the same object as the given coordinates
    pub fn is(&self, group: &str, kind: &str, namespace: &str, name: &str) -> bool {
        self.group == group && self.kind == kind && self.namespace == namespace && self.name == name
    }
}

/// One live object in the tree
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceNode {
    /// Object identity
    #[serde(flatten)]
    pub resource_ref: ResourceRef,
    /// Owners of this object
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_refs: Vec<ResourceRef>,
    /// Assessed health
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
    /// Creation time (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Live resource version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
}

impl ResourceNode {
    /// Whether the object exists in the cluster
    pub fn exists(&self) -> bool {
        !self.resource_version.is_empty()
            || !self.resource_ref.uid.is_empty()
            || self.created_at.is_some()
    }
}

/// All live objects belonging to an Application
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationTree {
    /// Managed objects and their descendants
    #[serde(default)]
    pub nodes: Vec<ResourceNode>,
    /// Objects in the destination namespace not owned by the Application
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orphaned_nodes: Vec<ResourceNode>,
}

impl ApplicationTree {
    /// Find a node by group, kind, namespace and name.
    ///
    /// Orphaned nodes are included in the search.
    pub fn find_node(
        &self,
        group: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Option<&ResourceNode> {
        self.nodes
            .iter()
            .chain(self.orphaned_nodes.iter())
            .find(|n| n.resource_ref.is(group, kind, namespace, name))
    }

    /// Pods transitively owned by the selected object.
    ///
    /// With no selector every Pod in the tree is returned; empty selector
    /// fields match anything. Pods without a UID are skipped. Ownership is
    /// followed through `parentRefs` by identity, so UID-less and cyclic
    /// ownership data are handled.
    pub fn pods_owned_by(&self, selector: Option<&ResourceRef>) -> Vec<&ResourceNode> {
        let pods = self.nodes.iter().filter(|n| {
            n.resource_ref.kind == POD_KIND
                && n.resource_ref.group.is_empty()
                && !n.resource_ref.uid.is_empty()
        });
        match selector {
            None => pods.collect(),
            Some(target) => {
                let owned = self.owned_by(target);
                pods.filter(|pod| owned.contains(&identity(&pod.resource_ref)))
                    .collect()
            }
        }
    }

    /// Identities of every node that is selected or descends from one that is
    fn owned_by<'a>(&'a self, target: &ResourceRef) -> HashSet<Identity<'a>> {
        let mut children: HashMap<Identity<'a>, Vec<Identity<'a>>> = HashMap::new();
        for node in &self.nodes {
            for parent in &node.parent_refs {
                children
                    .entry(identity(parent))
                    .or_default()
                    .push(identity(&node.resource_ref));
            }
        }

        let mut owned = HashSet::new();
        let mut pending: VecDeque<Identity<'a>> = VecDeque::new();
        for node in self.nodes.iter().filter(|n| selects(target, &n.resource_ref)) {
            let id = identity(&node.resource_ref);
            if owned.insert(id) {
                pending.push_back(id);
            }
        }
        while let Some(id) = pending.pop_front() {
            for &child in children.get(&id).into_iter().flatten() {
                if owned.insert(child) {
                    pending.push_back(child);
                }
            }
        }
        owned
    }
}

/// Group, kind, namespace and name
type Identity<'a> = (&'a str, &'a str, &'a str, &'a str);

fn identity(r: &ResourceRef) -> Identity<'_> {
    (&r.group, &r.kind, &r.namespace, &r.name)
}

fn selects(selector: &ResourceRef, candidate: &ResourceRef) -> bool {
    let matches = |wanted: &str, value: &str| wanted.is_empty() || wanted == value;
    matches(&selector.group, &candidate.group)
        && matches(&selector.kind, &candidate.kind)
        && matches(&selector.namespace, &candidate.namespace)
        && matches(&selector.name, &candidate.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(group: &str, kind: &str, name: &str, uid: &str, parents: &[(&str, &str, &str)]) -> ResourceNode {
        ResourceNode {
            resource_ref: ResourceRef {
                group: group.to_string(),
                version: "v1".to_string(),
                kind: kind.to_string(),
                namespace: "default".to_string(),
                name: name.to_string(),
                uid: uid.to_string(),
            },
            parent_refs: parents
                .iter()
                .map(|(g, k, n)| ResourceRef {
                    group: g.to_string(),
                    kind: k.to_string(),
                    namespace: "default".to_string(),
                    name: n.to_string(),
                    ..Default::default()
                })
                .collect(),
            resource_version: "1".to_string(),
            ..Default::default()
        }
    }

    fn sample_tree() -> ApplicationTree {
        ApplicationTree {
            nodes: vec![
                node("apps", "Deployment", "web", "d1", &[]),
                node("apps", "ReplicaSet", "web-abc", "r1", &[("apps", "Deployment", "web")]),
                node("", "Pod", "web-abc-1", "p1", &[("apps", "ReplicaSet", "web-abc")]),
                node("", "Pod", "web-abc-2", "p2", &[("apps", "ReplicaSet", "web-abc")]),
                node("apps", "StatefulSet", "db", "s1", &[]),
                node("", "Pod", "db-0", "p3", &[("apps", "StatefulSet", "db")]),
                node("", "Pod", "pending", "", &[]),
            ],
            orphaned_nodes: vec![],
        }
    }

    fn selector(group: &str, kind: &str, name: &str) -> ResourceRef {
        ResourceRef {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn pods_are_found_through_ownership_chain() {
        let tree = sample_tree();
        let pods = tree.pods_owned_by(Some(&selector("apps", "Deployment", "web")));
        let names: Vec<&str> = pods.iter().map(|p| p.resource_ref.name.as_str()).collect();
        assert_eq!(names, vec!["web-abc-1", "web-abc-2"]);
    }

    #[test]
    fn selecting_a_pod_directly_returns_it() {
        let tree = sample_tree();
        let pods = tree.pods_owned_by(Some(&selector("", "Pod", "db-0")));
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].resource_ref.uid, "p3");
    }

    #[test]
    fn empty_selector_fields_match_anything() {
        let tree = sample_tree();
        let pods = tree.pods_owned_by(Some(&selector("", "StatefulSet", "")));
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].resource_ref.name, "db-0");
    }

    #[test]
    fn no_selector_returns_every_pod_with_uid() {
        let tree = sample_tree();
        assert_eq!(tree.pods_owned_by(None).len(), 3);
    }

    #[test]
    fn cyclic_ownership_terminates() {
        let tree = ApplicationTree {
            nodes: vec![
                node("apps", "ReplicaSet", "a", "a", &[("apps", "ReplicaSet", "b")]),
                node("apps", "ReplicaSet", "b", "b", &[("apps", "ReplicaSet", "a")]),
                node("", "Pod", "p", "p", &[("apps", "ReplicaSet", "a")]),
            ],
            orphaned_nodes: vec![],
        };
        assert!(tree
            .pods_owned_by(Some(&selector("apps", "Deployment", "web")))
            .is_empty());
        assert_eq!(
            tree.pods_owned_by(Some(&selector("apps", "ReplicaSet", "b")))
                .len(),
            1
        );
    }

    #[test]
    fn cycle_through_uidless_owners_terminates() {
        let tree = ApplicationTree {
            nodes: vec![
                node("", "Pod", "p", "p", &[("apps", "ReplicaSet", "a")]),
                node("apps", "ReplicaSet", "a", "", &[("apps", "ReplicaSet", "b")]),
                node("apps", "ReplicaSet", "b", "", &[("apps", "ReplicaSet", "a")]),
            ],
            orphaned_nodes: vec![],
        };
        assert!(tree
            .pods_owned_by(Some(&selector("apps", "Deployment", "web")))
            .is_empty());
        assert_eq!(
            tree.pods_owned_by(Some(&selector("apps", "ReplicaSet", "b")))
                .len(),
            1
        );
    }

    #[test]
    fn pods_sharing_a_cyclic_owner_are_all_selected() {
        let tree = ApplicationTree {
            nodes: vec![
                node("apps", "Deployment", "dep", "d", &[]),
                node(
                    "apps",
                    "ReplicaSet",
                    "rs",
                    "rs",
                    &[("apps", "ReplicaSet", "x"), ("apps", "Deployment", "dep")],
                ),
                node("apps", "ReplicaSet", "x", "x", &[("apps", "ReplicaSet", "rs")]),
                node("", "Pod", "p1", "p1", &[("apps", "ReplicaSet", "rs")]),
                node("", "Pod", "p2", "p2", &[("apps", "ReplicaSet", "x")]),
            ],
            orphaned_nodes: vec![],
        };
        let pods = tree.pods_owned_by(Some(&selector("apps", "Deployment", "dep")));
        let names: Vec<&str> = pods.iter().map(|p| p.resource_ref.name.as_str()).collect();
        assert_eq!(names, vec!["p1", "p2"]);
    }

    #[test]
    fn find_node_searches_orphans() {
        let mut tree = sample_tree();
        tree.orphaned_nodes.push(node("", "ConfigMap", "stray", "c1", &[]));
        assert!(tree.find_node("", "ConfigMap", "default", "stray").is_some());
        assert!(tree.find_node("", "ConfigMap", "default", "missing").is_none());
    }

    #[test]
    fn node_without_markers_does_not_exist() {
        let mut n = node("", "Service", "svc", "", &[]);
        n.resource_version.clear();
        assert!(!n.exists());
    }
}
