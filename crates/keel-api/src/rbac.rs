//! Permission oracle: Cedar-backed RBAC for Applications
//!
//! Every check is a pure function of (caller, resource class, action, object
//! path). The object path is the Application's RBAC name
//! (`project/name` or `project/namespace/name`).
//!
//! # Entity Model
//!
//! ```text
//! Keel::User::"alice@example.com"                      (principal, parents: groups)
//! Keel::Group::"platform"                              (principal)
//! Keel::Action::"sync"                                 (action)
//! Keel::Action::"action/apps/Deployment/restart"       (action, parent: Keel::Action::"action")
//! Keel::Application::"payments/checkout"               (resource, parent: Keel::Project::"payments")
//! Keel::Logs::"payments/apps/checkout"                 (resource, parent: Keel::Project::"payments")
//! ```
//!
//! Resource entities carry `project`, `namespace` and `name` attributes so
//! policies can match on them in `when` clauses.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use cedar_policy::{
    Authorizer, Context, Decision, Entities, Entity, EntityId, EntityTypeName, EntityUid,
    PolicySet, Request, RestrictedExpression,
};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Cedar namespace for Keel entities
const NAMESPACE: &str = "Keel";

/// ConfigMap holding the Cedar policies
pub const RBAC_CONFIG_MAP: &str = "keel-rbac";

/// Resource classes checked by the API
pub mod resources {
    /// Application objects
    pub const APPLICATIONS: &str = "applications";
    /// Pod logs of an Application's resources
    pub const LOGS: &str = "logs";
}

/// Actions checked by the API
pub mod actions {
    /// Read an Application
    pub const GET: &str = "get";
    /// Create an Application
    pub const CREATE: &str = "create";
    /// Modify an Application or its resources
    pub const UPDATE: &str = "update";
    /// Delete an Application or its resources
    pub const DELETE: &str = "delete";
    /// Queue sync, rollback or terminate operations
    pub const SYNC: &str = "sync";
    /// Sync with locally supplied manifests
    pub const OVERRIDE: &str = "override";
    /// Run resource actions (`action/<group>/<kind>/<name>`)
    pub const ACTION: &str = "action";
}

/// Authenticated caller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserIdentity {
    /// Subject name
    pub username: String,
    /// Group memberships
    pub groups: Vec<String>,
}

impl UserIdentity {
    /// Create an identity with group memberships
    pub fn new(username: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            username: username.into(),
            groups,
        }
    }
}

/// Role-based policy check
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PermissionOracle: Send + Sync {
    /// Whether `caller` may perform `action` on `object` of class `resource`
    async fn enforce(&self, caller: &UserIdentity, resource: &str, action: &str, object: &str)
        -> bool;
}

/// Cedar policy engine evaluating Keel RBAC requests
pub struct CedarPermissionOracle {
    authorizer: Authorizer,
    policy_set: Arc<RwLock<PolicySet>>,
}

impl CedarPermissionOracle {
    /// Create an oracle with no policies (default-deny)
    pub fn new() -> Self {
        Self {
            authorizer: Authorizer::new(),
            policy_set: Arc::new(RwLock::new(PolicySet::new())),
        }
    }

    /// Create an oracle with explicit policies
    pub fn with_policies(policy_text: &str) -> Result<Self> {
        let policy_set = parse_policies(policy_text)?;
        Ok(Self {
            authorizer: Authorizer::new(),
            policy_set: Arc::new(RwLock::new(policy_set)),
        })
    }

    /// Create an oracle from the RBAC ConfigMap in the control namespace
    pub async fn from_config_map(client: &Client, namespace: &str) -> Result<Self> {
        let policy_set = load_policies(client, namespace).await?;
        Ok(Self {
            authorizer: Authorizer::new(),
            policy_set: Arc::new(RwLock::new(policy_set)),
        })
    }

    /// Reload policies from the RBAC ConfigMap
    pub async fn reload(&self, client: &Client, namespace: &str) -> Result<()> {
        let new_policy_set = load_policies(client, namespace).await?;
        *self.policy_set.write().await = new_policy_set;
        info!("Reloaded RBAC policies");
        Ok(())
    }

    /// Check if any policies are loaded
    pub async fn has_policies(&self) -> bool {
        self.policy_set.read().await.policies().next().is_some()
    }

    fn evaluate(
        &self,
        caller: &UserIdentity,
        resource: &str,
        action: &str,
        object: &str,
        policy_set: &PolicySet,
    ) -> Result<Decision> {
        let type_name = resource_type(resource)
            .ok_or_else(|| Error::internal(format!("unknown resource class '{resource}'")))?;

        let principal = build_entity_uid("User", &caller.username)?;
        let action_uid = build_entity_uid("Action", action)?;
        let resource_uid = build_entity_uid(type_name, object)?;

        let mut entity_vec = build_user_entities(caller)?;
        entity_vec.extend(build_action_entities(action)?);
        entity_vec.extend(build_resource_entities(type_name, object)?);
        let entities = Entities::from_entities(entity_vec, None)
            .map_err(|e| Error::internal(format!("failed to create entities set: {e}")))?;

        let request = Request::new(
            principal.clone(),
            action_uid.clone(),
            resource_uid.clone(),
            Context::empty(),
            None,
        )
        .map_err(|e| Error::internal(format!("failed to build Cedar request: {e}")))?;

        let response = self
            .authorizer
            .is_authorized(&request, policy_set, &entities);

        debug!(
            principal = %principal,
            action = %action_uid,
            resource = %resource_uid,
            decision = ?response.decision(),
            "RBAC decision"
        );

        Ok(response.decision())
    }
}

impl Default for CedarPermissionOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionOracle for CedarPermissionOracle {
    async fn enforce(
        &self,
        caller: &UserIdentity,
        resource: &str,
        action: &str,
        object: &str,
    ) -> bool {
        let policy_set = self.policy_set.read().await;
        match self.evaluate(caller, resource, action, object, &policy_set) {
            Ok(decision) => decision == Decision::Allow,
            Err(e) => {
                // Fail closed
                warn!(error = %e, resource, action, "RBAC evaluation failed");
                false
            }
        }
    }
}

fn parse_policies(policy_text: &str) -> Result<PolicySet> {
    policy_text
        .parse()
        .map_err(|e: cedar_policy::ParseErrors| {
            Error::invalid(format!("invalid Cedar policy: {e}"))
        })
}

/// Load every `*.cedar` key of the RBAC ConfigMap, in key order.
///
/// Keys that fail to parse are skipped with a warning so one bad policy does
/// not lock every caller out.
async fn load_policies(client: &Client, namespace: &str) -> Result<PolicySet> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let data = match api.get_opt(RBAC_CONFIG_MAP).await? {
        Some(cm) => cm.data.unwrap_or_default(),
        None => {
            warn!(namespace, "RBAC ConfigMap not found, denying all requests");
            Default::default()
        }
    };

    let mut policy_set = PolicySet::new();
    let mut loaded = 0;
    let mut errors = 0;
    for (key, text) in data.iter().filter(|(k, _)| k.ends_with(".cedar")) {
        match parse_policies(text) {
            Ok(parsed) => {
                for policy in parsed.policies() {
                    if let Err(e) = policy_set.add(policy.clone()) {
                        warn!(key = %key, error = %e, "Failed to add policy (duplicate ID?)");
                        errors += 1;
                    } else {
                        loaded += 1;
                    }
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to parse RBAC policy");
                errors += 1;
            }
        }
    }

    info!(loaded, errors, "Loaded RBAC policies");
    Ok(policy_set)
}

fn resource_type(resource: &str) -> Option<&'static str> {
    match resource {
        resources::APPLICATIONS => Some("Application"),
        resources::LOGS => Some("Logs"),
        _ => None,
    }
}

fn build_entity_uid(type_name: &str, id: &str) -> Result<EntityUid> {
    let full_type_name = format!("{NAMESPACE}::{type_name}");
    let entity_type: EntityTypeName =
        full_type_name
            .parse()
            .map_err(|e: cedar_policy::ParseErrors| {
                Error::internal(format!(
                    "invalid Cedar entity type name '{full_type_name}': {e}"
                ))
            })?;
    Ok(EntityUid::from_type_name_and_id(
        entity_type,
        EntityId::new(id),
    ))
}

fn entity(
    uid: EntityUid,
    attrs: HashMap<String, RestrictedExpression>,
    parents: HashSet<EntityUid>,
) -> Result<Entity> {
    Entity::new(uid, attrs, parents)
        .map_err(|e| Error::internal(format!("failed to create entity: {e}")))
}

fn build_user_entities(caller: &UserIdentity) -> Result<Vec<Entity>> {
    let mut entities = Vec::with_capacity(caller.groups.len() + 1);
    let mut group_uids = HashSet::new();
    for group in &caller.groups {
        let uid = build_entity_uid("Group", group)?;
        if group_uids.insert(uid.clone()) {
            entities.push(entity(uid, HashMap::new(), HashSet::new())?);
        }
    }
    entities.push(entity(
        build_entity_uid("User", &caller.username)?,
        HashMap::new(),
        group_uids,
    )?);
    Ok(entities)
}

/// Scoped actions (`action/apps/Deployment/restart`, `update/apps/Deployment/ns/name`)
/// are children of their verb so `action in Keel::Action::"action"` matches them.
fn build_action_entities(action: &str) -> Result<Vec<Entity>> {
    let uid = build_entity_uid("Action", action)?;
    match action.split_once('/') {
        Some((verb, _)) => {
            let parent = build_entity_uid("Action", verb)?;
            Ok(vec![
                entity(parent.clone(), HashMap::new(), HashSet::new())?,
                entity(uid, HashMap::new(), HashSet::from([parent]))?,
            ])
        }
        None => Ok(vec![entity(uid, HashMap::new(), HashSet::new())?]),
    }
}

fn build_resource_entities(type_name: &str, object: &str) -> Result<Vec<Entity>> {
    let segments: Vec<&str> = object.split('/').collect();
    let (project, namespace, name) = match segments.as_slice() {
        [project, name] => (*project, "", *name),
        [project, namespace, name] => (*project, *namespace, *name),
        _ => (segments.first().copied().unwrap_or_default(), "", object),
    };

    let project_uid = build_entity_uid("Project", project)?;
    let attrs = HashMap::from([
        (
            "project".to_string(),
            RestrictedExpression::new_string(project.to_string()),
        ),
        (
            "namespace".to_string(),
            RestrictedExpression::new_string(namespace.to_string()),
        ),
        (
            "name".to_string(),
            RestrictedExpression::new_string(name.to_string()),
        ),
    ]);

    Ok(vec![
        entity(project_uid.clone(), HashMap::new(), HashSet::new())?,
        entity(
            build_entity_uid(type_name, object)?,
            attrs,
            HashSet::from([project_uid]),
        )?,
    ])
}
