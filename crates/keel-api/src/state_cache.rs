//! Cached application state written by the reconciliation controller
//!
//! The controller publishes each Application's live resource tree and
//! per-resource diffs keyed by instance name. The API only reads them; a
//! miss means the controller has not processed the Application yet.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use keel_common::crd::{Application, HealthStatus, HealthStatusCode};
use keel_common::resource_tree::{ApplicationTree, ResourceNode};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::error::Result;

/// Live/desired comparison for one managed resource
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDiff {
    /// API group
    #[serde(default)]
    pub group: String,
    /// Kind
    pub kind: String,
    /// Namespace
    #[serde(default)]
    pub namespace: String,
    /// Name
    pub name: String,
    /// Live object as JSON
    #[serde(default)]
    pub live_state: String,
    /// Desired object as JSON
    #[serde(default)]
    pub target_state: String,
    /// Live object after normalization
    #[serde(default)]
    pub normalized_live_state: String,
    /// Object the controller expects after applying the desired state
    #[serde(default)]
    pub predicted_live_state: String,
    /// Whether the resource is a sync hook
    #[serde(default)]
    pub hook: bool,
    /// Resource version of the live object
    #[serde(default)]
    pub resource_version: String,
}

/// Read access to controller-published application state
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppStateCache: Send + Sync {
    /// Live resource tree, `None` on a cache miss
    async fn resource_tree(&self, instance: &str) -> Result<Option<ApplicationTree>>;

    /// Managed resource diffs, `None` on a cache miss
    async fn managed_resources(&self, instance: &str) -> Result<Option<Vec<ResourceDiff>>>;
}

/// Process-local [`AppStateCache`]
#[derive(Default)]
pub struct InMemoryStateCache {
    trees: DashMap<String, ApplicationTree>,
    managed: DashMap<String, Vec<ResourceDiff>>,
}

impl InMemoryStateCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a resource tree
    pub fn set_tree(&self, instance: &str, tree: ApplicationTree) {
        self.trees.insert(instance.to_string(), tree);
    }

    /// Publish managed resource diffs
    pub fn set_managed_resources(&self, instance: &str, diffs: Vec<ResourceDiff>) {
        self.managed.insert(instance.to_string(), diffs);
    }

    /// Drop everything cached for an instance
    pub fn evict(&self, instance: &str) {
        self.trees.remove(instance);
        self.managed.remove(instance);
    }
}

#[async_trait]
impl AppStateCache for InMemoryStateCache {
    async fn resource_tree(&self, instance: &str) -> Result<Option<ApplicationTree>> {
        Ok(self.trees.get(instance).map(|t| t.clone()))
    }

    async fn managed_resources(&self, instance: &str) -> Result<Option<Vec<ResourceDiff>>> {
        Ok(self.managed.get(instance).map(|m| m.clone()))
    }
}

/// Copy per-resource health from the live tree onto `app.status.resources`.
///
/// A tree node that does not exist in the cluster is reported `Missing`.
pub fn infer_resource_health(app: &mut Application, tree: &ApplicationTree) {
    let by_key: HashMap<(&str, &str, &str, &str), &ResourceNode> = tree
        .nodes
        .iter()
        .map(|n| {
            let r = &n.resource_ref;
            ((r.group.as_str(), r.kind.as_str(), r.namespace.as_str(), r.name.as_str()), n)
        })
        .collect();

    for res in app.status.resources.iter_mut() {
        let key = (
            res.group.as_str(),
            res.kind.as_str(),
            res.namespace.as_str(),
            res.name.as_str(),
        );
        res.health = match by_key.get(&key) {
            Some(node) if !node.exists() => Some(HealthStatus {
                status: HealthStatusCode::Missing,
                message: Some("Resource has not been created".to_string()),
            }),
            Some(node) => node.health.clone(),
            None => None,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_until_published_then_evicted() {
        let cache = InMemoryStateCache::new();
        assert!(cache.resource_tree("guestbook").await.unwrap().is_none());

        cache.set_tree("guestbook", ApplicationTree::default());
        cache.set_managed_resources("guestbook", vec![ResourceDiff::default()]);
        assert!(cache.resource_tree("guestbook").await.unwrap().is_some());
        assert_eq!(
            cache
                .managed_resources("guestbook")
                .await
                .unwrap()
                .map(|m| m.len()),
            Some(1)
        );

        cache.evict("guestbook");
        assert!(cache.managed_resources("guestbook").await.unwrap().is_none());
    }

    #[test]
    fn health_is_copied_from_the_tree() {
        use keel_common::crd::{ApplicationSpec, ResourceStatus};
        use keel_common::resource_tree::ResourceRef;

        let mut app = Application::new("keel", "guestbook", ApplicationSpec::default());
        let status = |name: &str| ResourceStatus {
            kind: "Deployment".to_string(),
            group: "apps".to_string(),
            namespace: "guestbook".to_string(),
            name: name.to_string(),
            ..Default::default()
        };
        app.status.resources = vec![status("live"), status("pending"), status("untracked")];
        let node = |name: &str, uid: &str| ResourceNode {
            resource_ref: ResourceRef {
                group: "apps".to_string(),
                version: "v1".to_string(),
                kind: "Deployment".to_string(),
                namespace: "guestbook".to_string(),
                name: name.to_string(),
                uid: uid.to_string(),
            },
            health: Some(HealthStatus {
                status: HealthStatusCode::Healthy,
                message: None,
            }),
            ..Default::default()
        };
        let tree = ApplicationTree {
            nodes: vec![node("live", "u1"), node("pending", "")],
            orphaned_nodes: vec![],
        };

        infer_resource_health(&mut app, &tree);

        let health: Vec<_> = app
            .status
            .resources
            .iter()
            .map(|r| r.health.as_ref().map(|h| h.status))
            .collect();
        assert_eq!(
            health,
            vec![
                Some(HealthStatusCode::Healthy),
                Some(HealthStatusCode::Missing),
                None
            ]
        );
    }
}
