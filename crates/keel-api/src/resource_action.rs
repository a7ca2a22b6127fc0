//! ResourceActionEngine: runs action scripts against live objects
//!
//! An action proposes a list of impacted resources. Every impact is checked
//! against the project (and create impacts are dry-run) before the first one
//! is applied. The apply pass itself is not transactional: when an impact
//! fails, the ones before it stay applied and the error names the failure.

use std::sync::Arc;

use keel_common::crd::{AppProject, Application, APPLICATION_KIND};
use keel_common::kube_utils::parse_api_version;
use keel_common::resource_tree::ResourceRef;
use keel_common::KEEL_GROUP;
use kube::api::DynamicObject;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::audit::{app_reference, reasons, resource_reference, AuditSink};
use crate::cluster::{Cluster, ClusterStore, DownstreamClient, PatchType};
use crate::error::{Error, Result};
use crate::rbac::UserIdentity;
use crate::request::ResourceKey;
use crate::script::{
    ImpactOperation, ImpactedResource, ResourceActionDefinition, ResourceActionParam, ScriptEngine,
};

/// What an action runs against
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionTarget {
    /// The Application object itself
    Application,
    /// A live resource from the Application's tree
    Resource(ResourceRef),
}

impl ActionTarget {
    /// Whether `key` addresses the Application itself rather than a live resource
    pub fn is_self(app: &Application, key: &ResourceKey) -> bool {
        key.kind == APPLICATION_KIND && key.group == KEEL_GROUP && key.resource_name == app.name()
    }
}

/// RBAC action for running `action` on resources of `group`/`kind`
pub fn action_permission(group: &str, kind: &str, action: &str) -> String {
    format!("action/{group}/{kind}/{action}")
}

/// Identity of the object a DynamicObject describes
fn reference_of(object: &DynamicObject) -> ResourceRef {
    let (api_version, kind) = object
        .types
        .as_ref()
        .map(|t| (t.api_version.as_str(), t.kind.clone()))
        .unwrap_or_default();
    let (group, version) = parse_api_version(api_version);
    ResourceRef {
        group,
        version,
        kind,
        namespace: object.metadata.namespace.clone().unwrap_or_default(),
        name: object.metadata.name.clone().unwrap_or_default(),
        uid: object.metadata.uid.clone().unwrap_or_default(),
    }
}

fn describe(target: &ResourceRef) -> String {
    format!(
        "{}/{}/{} in {}",
        target.group, target.kind, target.name, target.namespace
    )
}

/// RFC 7386 merge patch turning `live` into `desired`
pub fn merge_patch(live: &Value, desired: &Value) -> Value {
    match (live, desired) {
        (Value::Object(live), Value::Object(desired)) => {
            let mut patch = Map::new();
            for (key, value) in desired {
                match live.get(key) {
                    Some(current) if current == value => {}
                    Some(current) if current.is_object() && value.is_object() => {
                        patch.insert(key.clone(), merge_patch(current, value));
                    }
                    _ => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in live.keys() {
                if !desired.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}

fn is_empty_patch(patch: &Value) -> bool {
    patch.as_object().is_some_and(Map::is_empty)
}

/// Discovers, validates and applies resource actions
#[derive(Clone)]
pub struct ResourceActionEngine {
    clusters: Arc<dyn ClusterStore>,
    downstream: Arc<dyn DownstreamClient>,
    scripts: Arc<dyn ScriptEngine>,
    audit: Arc<dyn AuditSink>,
}

impl ResourceActionEngine {
    /// Create an engine
    pub fn new(
        clusters: Arc<dyn ClusterStore>,
        downstream: Arc<dyn DownstreamClient>,
        scripts: Arc<dyn ScriptEngine>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            clusters,
            downstream,
            scripts,
            audit,
        }
    }

    /// Actions available for the target
    pub async fn list(
        &self,
        app: &Application,
        target: &ActionTarget,
    ) -> Result<Vec<ResourceActionDefinition>> {
        let (_, live) = self.live_object(app, target).await?;
        self.scripts
            .discover(&live)
            .await
            .map_err(|e| e.context("error listing resource actions"))
    }

    /// Run `action` on the target; the caller has already been authorized
    /// with [`action_permission`].
    pub async fn run(
        &self,
        caller: &UserIdentity,
        app: &Application,
        project: &AppProject,
        target: &ActionTarget,
        action: &str,
        params: &[ResourceActionParam],
    ) -> Result<()> {
        let (cluster, live) = self.live_object(app, target).await?;

        let definition = self
            .scripts
            .discover(&live)
            .await
            .map_err(|e| e.context("error discovering resource actions"))?
            .into_iter()
            .find(|d| d.name == action)
            .ok_or_else(|| Error::invalid(format!("action {action} is not available")))?;
        if definition.disabled {
            return Err(Error::invalid(format!("action {action} is disabled")));
        }

        let impacts = self
            .scripts
            .execute(&live, &definition, params)
            .await
            .map_err(|e| e.context("error executing resource action"))?;

        let destination = match target {
            ActionTarget::Application => Cluster::in_cluster(),
            ActionTarget::Resource(_) => cluster.clone(),
        };
        for impact in &impacts {
            self.verify(app, project, target, &destination, &live, impact)
                .await?;
        }

        let mut applied: Vec<String> = Vec::with_capacity(impacts.len());
        for impact in &impacts {
            let reference = reference_of(&impact.object);
            if let Err(e) = self.apply(&cluster, &live, impact).await {
                if !applied.is_empty() {
                    warn!(
                        application = %app.qualified_name(),
                        action,
                        applied = ?applied,
                        "resource action failed part way, earlier impacts remain applied"
                    );
                }
                return Err(Error::upstream(
                    format!("error applying {}", describe(&reference)),
                    e,
                ));
            }
            applied.push(describe(&reference));
        }

        info!(application = %app.qualified_name(), action, impacts = applied.len(), "ran resource action");
        let message = format!("running action {action}");
        self.audit
            .record(
                &app_reference(app),
                reasons::RESOURCE_ACTION_RAN,
                &message,
                &caller.username,
            )
            .await;
        if let ActionTarget::Resource(resource) = target {
            self.audit
                .record(
                    &resource_reference(resource),
                    reasons::RESOURCE_ACTION_RAN,
                    &message,
                    &caller.username,
                )
                .await;
        }
        Ok(())
    }

    async fn live_object(
        &self,
        app: &Application,
        target: &ActionTarget,
    ) -> Result<(Cluster, DynamicObject)> {
        match target {
            ActionTarget::Application => {
                let value = serde_json::to_value(app)
                    .map_err(|e| Error::internal(format!("failed to serialize application: {e}")))?;
                let live = serde_json::from_value(value)
                    .map_err(|e| Error::internal(format!("failed to convert application: {e}")))?;
                Ok((Cluster::in_cluster(), live))
            }
            ActionTarget::Resource(resource) => {
                let cluster = self.clusters.resolve(&app.spec.destination).await?;
                let live = self
                    .downstream
                    .get(&cluster, resource)
                    .await
                    .map_err(|e| e.context("error getting resource"))?;
                Ok((cluster, live))
            }
        }
    }

    async fn verify(
        &self,
        app: &Application,
        project: &AppProject,
        target: &ActionTarget,
        destination: &Cluster,
        live: &DynamicObject,
        impact: &ImpactedResource,
    ) -> Result<()> {
        let reference = reference_of(&impact.object);
        let not_permitted = || {
            Error::precondition(format!(
                "application is not permitted to manage {}",
                describe(&reference)
            ))
        };

        if *target == ActionTarget::Application {
            // an Application may only patch itself
            let own = reference_of(live);
            let is_self = reference.kind == APPLICATION_KIND
                && reference.group == own.group
                && reference.namespace == own.namespace
                && reference.name == own.name;
            return if is_self && impact.operation == ImpactOperation::Patch {
                Ok(())
            } else {
                Err(not_permitted())
            };
        }

        let namespaced = !reference.namespace.is_empty();
        if !project.is_group_kind_permitted(&reference.group, &reference.kind, namespaced) {
            return Err(not_permitted());
        }
        if namespaced
            && !project.is_destination_permitted(
                &destination.server,
                &destination.name,
                &reference.namespace,
            )
        {
            return Err(not_permitted());
        }

        if impact.operation == ImpactOperation::Create {
            self.downstream
                .create(destination, &impact.object, true)
                .await
                .map_err(|e| {
                    warn!(application = %app.qualified_name(), resource = %describe(&reference), error = %e, "dry-run create failed");
                    Error::upstream(format!("dry-run create of {}", describe(&reference)), e)
                })?;
        }
        Ok(())
    }

    async fn apply(&self, cluster: &Cluster, live: &DynamicObject, impact: &ImpactedResource) -> Result<()> {
        match impact.operation {
            ImpactOperation::Create => {
                self.downstream.create(cluster, &impact.object, false).await?;
                Ok(())
            }
            ImpactOperation::Patch => {
                let named = reference_of(&impact.object);
                let own = reference_of(live);
                if named.is(&own.group, &own.kind, &own.namespace, &own.name) {
                    return self.patch(cluster, live, &impact.object).await;
                }
                let current = self.downstream.get(cluster, &named).await?;
                self.patch(cluster, &current, &impact.object).await
            }
        }
    }

    /// Patch `live` towards `desired`, status and spec separately
    async fn patch(&self, cluster: &Cluster, live: &DynamicObject, desired: &DynamicObject) -> Result<()> {
        let target = reference_of(live);
        let live = serde_json::to_value(live)
            .map_err(|e| Error::internal(format!("failed to serialize live object: {e}")))?;
        let desired = serde_json::to_value(desired)
            .map_err(|e| Error::internal(format!("failed to serialize new object: {e}")))?;

        let full = merge_patch(&live, &desired);
        if is_empty_patch(&full) {
            return Ok(());
        }

        let mut rest = full.clone();
        let status = rest.as_object_mut().and_then(|m| m.remove("status"));
        if let Some(status) = status {
            let status_patch = serde_json::json!({ "status": status });
            match self
                .downstream
                .patch(cluster, &target, PatchType::Merge, &status_patch, true)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    // no status subresource on this kind
                    self.downstream
                        .patch(cluster, &target, PatchType::Merge, &full, false)
                        .await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        if !is_empty_patch(&rest) {
            self.downstream
                .patch(cluster, &target, PatchType::Merge, &rest, false)
                .await?;
        }
        Ok(())
    }
}
