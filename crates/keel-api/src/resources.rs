//! Live resources managed by an Application
//!
//! A live resource is addressed through the Application's resource tree: the
//! tree proves the object belongs to the Application before anything is read
//! from or written to the destination cluster.

use std::future::Future;
use std::sync::Arc;

use keel_common::crd::{AppProject, Application};
use keel_common::resource_tree::{ApplicationTree, ResourceRef};
use kube::api::DynamicObject;
use serde_json::Value;
use tracing::debug;

use crate::access::AccessGate;
use crate::audit::{app_reference, reasons, AuditSink};
use crate::cluster::{ClusterStore, DeleteOptions, DownstreamClient, PatchType, PropagationPolicy};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::rbac::{actions, UserIdentity};
use crate::request::{AppKey, ResourceKey, ResourceResponse, ResourcesQuery};
use crate::state_cache::ResourceDiff;

/// Replacement written over every Secret value
pub const SECRET_MASK: &str = "++++++++";

const SECRET_KIND: &str = "Secret";
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// RBAC action for `action` on one managed resource
pub fn resource_scoped_action(action: &str, key: &ResourceKey) -> String {
    format!(
        "{action}/{}/{}/{}/{}",
        key.group, key.kind, key.namespace, key.resource_name
    )
}

/// Find the tree node for `key`; nodes without a UID are not live.
pub fn locate(app: &Application, tree: &ApplicationTree, key: &ResourceKey) -> Result<ResourceRef> {
    tree.find_node(&key.group, &key.kind, &key.namespace, &key.resource_name)
        .filter(|node| !node.resource_ref.uid.is_empty())
        .map(|node| {
            let mut found = node.resource_ref.clone();
            if !key.version.is_empty() {
                found.version = key.version.clone();
            }
            found
        })
        .ok_or_else(|| {
            Error::invalid(format!(
                "{} {} {} not found as part of application {}",
                key.kind,
                key.group,
                key.resource_name,
                app.name()
            ))
        })
}

/// Managed resource diffs matching the query; empty filter fields match anything.
/// Hooks are never returned.
pub fn filter_managed(diffs: Vec<ResourceDiff>, query: &ResourcesQuery) -> Vec<ResourceDiff> {
    let matches = |filter: &str, value: &str| filter.is_empty() || filter == value;
    diffs
        .into_iter()
        .filter(|d| !d.hook)
        .filter(|d| {
            matches(&query.group, &d.group)
                && matches(&query.kind, &d.kind)
                && matches(&query.namespace, &d.namespace)
                && matches(&query.name, &d.name)
        })
        .collect()
}

/// Replace Secret values with masks and drop the last-applied annotation.
///
/// Objects of any other kind are returned unchanged.
pub fn mask_secret(mut object: Value) -> Value {
    let is_secret = object.get("kind").and_then(Value::as_str) == Some(SECRET_KIND)
        && object
            .get("apiVersion")
            .and_then(Value::as_str)
            .is_some_and(|v| v == "v1");
    if !is_secret {
        return object;
    }

    for field in ["data", "stringData"] {
        if let Some(Value::Object(values)) = object.get_mut(field) {
            for value in values.values_mut() {
                *value = Value::String(SECRET_MASK.to_string());
            }
        }
    }
    if let Some(Value::Object(annotations)) = object.pointer_mut("/metadata/annotations") {
        annotations.remove(LAST_APPLIED_ANNOTATION);
    }
    object
}

fn is_secret(target: &ResourceRef) -> bool {
    target.group.is_empty() && target.kind == SECRET_KIND
}

fn manifest_of(object: &DynamicObject) -> Result<ResourceResponse> {
    let value = serde_json::to_value(object)
        .map_err(|e| Error::internal(format!("failed to serialize resource: {e}")))?;
    Ok(ResourceResponse {
        manifest: mask_secret(value).to_string(),
    })
}

/// Reads and mutates managed resources in destination clusters
#[derive(Clone)]
pub struct LiveResources {
    gate: AccessGate,
    clusters: Arc<dyn ClusterStore>,
    downstream: Arc<dyn DownstreamClient>,
    audit: Arc<dyn AuditSink>,
    config: Arc<ServerConfig>,
}

impl LiveResources {
    /// Create a live resource handler
    pub fn new(
        gate: AccessGate,
        clusters: Arc<dyn ClusterStore>,
        downstream: Arc<dyn DownstreamClient>,
        audit: Arc<dyn AuditSink>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            gate,
            clusters,
            downstream,
            audit,
            config,
        }
    }

    /// Resolve the owning Application for `action` on one of its resources.
    ///
    /// `update` and `delete` rights on the Application cover its resources
    /// unless fine-grained inheritance is enabled, in which case only the
    /// resource-scoped form is checked. Without it, a denied Application-level
    /// check falls back to the resource-scoped form.
    pub async fn authorize<F, Fut>(
        &self,
        caller: &UserIdentity,
        action: &str,
        app: &AppKey,
        resource: &ResourceKey,
        namespace: &str,
        fetch: F,
    ) -> Result<(Application, AppProject)>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Application>>,
    {
        let scoped = matches!(action, actions::UPDATE | actions::DELETE);
        if scoped && self.config.fine_grained_inheritance {
            let action = resource_scoped_action(action, resource);
            return self
                .gate
                .resolve(caller, &action, &app.project, namespace, &app.name, &fetch)
                .await;
        }

        match self
            .gate
            .resolve(caller, action, &app.project, namespace, &app.name, &fetch)
            .await
        {
            Err(Error::PermissionDenied) if scoped => {
                debug!(application = %app.name, action, "falling back to resource-scoped rights");
                let action = resource_scoped_action(action, resource);
                self.gate
                    .resolve(caller, &action, &app.project, namespace, &app.name, &fetch)
                    .await
            }
            other => other,
        }
    }

    /// Read a live object, Secrets masked
    pub async fn get(&self, app: &Application, target: &ResourceRef) -> Result<ResourceResponse> {
        let cluster = self.clusters.resolve(&app.spec.destination).await?;
        let object = self
            .downstream
            .get(&cluster, target)
            .await
            .map_err(|e| e.context("error getting resource"))?;
        manifest_of(&object)
    }

    /// Patch a live object
    pub async fn patch(
        &self,
        caller: &UserIdentity,
        app: &Application,
        target: &ResourceRef,
        patch: &str,
        patch_type: &str,
    ) -> Result<ResourceResponse> {
        let patch_type = PatchType::parse(patch_type)
            .ok_or_else(|| Error::invalid(format!("Patch type '{patch_type}' is not supported")))?;
        let patch: Value = serde_json::from_str(patch)
            .map_err(|e| Error::invalid(format!("invalid patch: {e}")))?;
        let cluster = self.clusters.resolve(&app.spec.destination).await?;

        let patched = self
            .downstream
            .patch(&cluster, target, patch_type, &patch, false)
            .await
            .map_err(|e| {
                if is_secret(target) {
                    // never echo API errors for Secrets, they can contain the data
                    Error::internal(format!(
                        "failed to patch Secret {}/{}",
                        target.namespace, target.name
                    ))
                } else {
                    e.context("error patching resource")
                }
            })?;

        self.audit
            .record(
                &app_reference(app),
                reasons::RESOURCE_UPDATED,
                &format!(
                    "patched resource {}/{} '{}'",
                    target.group, target.kind, target.name
                ),
                &caller.username,
            )
            .await;
        manifest_of(&patched)
    }

    /// Delete a live object
    pub async fn delete(
        &self,
        caller: &UserIdentity,
        app: &Application,
        target: &ResourceRef,
        force: bool,
        orphan: bool,
    ) -> Result<()> {
        let options = delete_options(force, orphan);
        let cluster = self.clusters.resolve(&app.spec.destination).await?;
        self.downstream
            .delete(&cluster, target, &options)
            .await
            .map_err(|e| e.context("error deleting resource"))?;

        self.audit
            .record(
                &app_reference(app),
                reasons::RESOURCE_DELETED,
                &format!(
                    "deleted resource {}/{} '{}'",
                    target.group, target.kind, target.name
                ),
                &caller.username,
            )
            .await;
        Ok(())
    }
}

/// Propagation for a resource delete: orphan wins over force
pub fn delete_options(force: bool, orphan: bool) -> DeleteOptions {
    if orphan {
        DeleteOptions {
            propagation_policy: PropagationPolicy::Orphan,
            grace_period_seconds: None,
        }
    } else if force {
        DeleteOptions {
            propagation_policy: PropagationPolicy::Background,
            grace_period_seconds: Some(0),
        }
    } else {
        DeleteOptions {
            propagation_policy: PropagationPolicy::Foreground,
            grace_period_seconds: None,
        }
    }
}
