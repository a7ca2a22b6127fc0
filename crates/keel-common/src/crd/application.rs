//! Application resource: the deployment-intent object served by the API
//!
//! An Application names one or more sources (repository + revision), a
//! destination cluster/namespace, and the project it is governed by. The
//! top-level `operation` field is a transient directive consumed by the
//! reconciliation loop, which is why the type is written by hand instead of
//! derived: `CustomResource` only models `spec` and `status`.

use std::collections::BTreeMap;

use kube::api::{ObjectMeta, TypeMeta};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_PROJECT, KEEL_GROUP, KEEL_VERSION, REFRESH_ANNOTATION};

/// Kind name of the Application resource
pub const APPLICATION_KIND: &str = "Application";

/// Finalizer requesting cascaded deletion with the default (foreground-like) policy
pub const RESOURCES_FINALIZER: &str = "resources-finalizer.keel.dev";

/// Finalizer requesting cascaded deletion with foreground propagation
pub const FOREGROUND_FINALIZER: &str = "resources-finalizer.keel.dev/foreground";

/// Finalizer requesting cascaded deletion with background propagation
pub const BACKGROUND_FINALIZER: &str = "resources-finalizer.keel.dev/background";

/// Condition type reported when the controller could not compare live and desired state
pub const CONDITION_COMPARISON_ERROR: &str = "ComparisonError";

/// Condition type reported when the Application spec is invalid
pub const CONDITION_INVALID_SPEC_ERROR: &str = "InvalidSpecError";

/// Build the RBAC object path for an Application.
///
/// Applications in the control namespace (or with no namespace) are addressed
/// as `project/name`; all others as `project/namespace/name`.
pub fn rbac_name(control_namespace: &str, project: &str, namespace: &str, name: &str) -> String {
    if namespace.is_empty() || namespace == control_namespace {
        format!("{project}/{name}")
    } else {
        format!("{project}/{namespace}/{name}")
    }
}

/// Deployment-intent object
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// apiVersion/kind, populated on construction and by the API server
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    /// Standard object metadata
    pub metadata: ObjectMeta,
    /// Desired state
    #[serde(default)]
    pub spec: ApplicationSpec,
    /// Queued sync or rollback directive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    /// Observed state
    #[serde(default)]
    pub status: ApplicationStatus,
}

impl k8s_openapi::Resource for Application {
    const API_VERSION: &'static str = "keel.dev/v1alpha1";
    const GROUP: &'static str = KEEL_GROUP;
    const KIND: &'static str = APPLICATION_KIND;
    const VERSION: &'static str = KEEL_VERSION;
    const URL_PATH_SEGMENT: &'static str = "applications";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::Metadata for Application {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// How aggressively the controller should refresh an Application
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshType {
    /// Re-compare live state against cached manifests
    Normal,
    /// Also invalidate the rendered manifest cache
    Hard,
}

impl RefreshType {
    /// Annotation value for this refresh type
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshType::Normal => "normal",
            RefreshType::Hard => "hard",
        }
    }

    /// Parse an annotation or request value
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(RefreshType::Normal),
            "hard" => Some(RefreshType::Hard),
            _ => None,
        }
    }
}

impl Application {
    /// Create an Application with type metadata set
    pub fn new(namespace: &str, name: &str, spec: ApplicationSpec) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: format!("{KEEL_GROUP}/{KEEL_VERSION}"),
                kind: APPLICATION_KIND.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec,
            operation: None,
            status: ApplicationStatus::default(),
        }
    }

    /// Object name, empty when unset
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Object namespace, empty when unset
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// `namespace/name`, or just the name when no namespace is set
    pub fn qualified_name(&self) -> String {
        if self.namespace().is_empty() {
            self.name().to_string()
        } else {
            format!("{}/{}", self.namespace(), self.name())
        }
    }

    /// Key used by the controller's state cache
    pub fn instance_name(&self, control_namespace: &str) -> String {
        if self.namespace().is_empty() || self.namespace() == control_namespace {
            self.name().to_string()
        } else {
            format!("{}_{}", self.namespace(), self.name())
        }
    }

    /// Project the Application is governed by
    pub fn effective_project(&self) -> &str {
        if self.spec.project.is_empty() {
            DEFAULT_PROJECT
        } else {
            &self.spec.project
        }
    }

    /// RBAC object path for this Application
    pub fn rbac_name(&self, control_namespace: &str) -> String {
        rbac_name(
            control_namespace,
            self.effective_project(),
            self.namespace(),
            self.name(),
        )
    }

    /// Store version token, if the object has been persisted
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    /// Version token as an integer, when the store issues numeric versions
    pub fn version_number(&self) -> Option<u64> {
        self.resource_version().and_then(|v| v.parse().ok())
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Pending refresh requested through the refresh annotation
    pub fn refresh_requested(&self) -> Option<RefreshType> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(REFRESH_ANNOTATION))
            .and_then(|v| RefreshType::parse(v))
    }

    /// Labels, empty when unset
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    /// Annotations, empty when unset
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }

    /// Finalizers, empty when unset
    pub fn finalizers(&self) -> Vec<String> {
        self.metadata.finalizers.clone().unwrap_or_default()
    }

    /// Whether any cascade finalizer is present
    pub fn cascaded_deletion(&self) -> bool {
        self.finalizers().iter().any(|f| is_cascade_finalizer(f))
    }

    /// Replace any cascade finalizer with the given one
    pub fn set_cascaded_deletion(&mut self, finalizer: &str) {
        let mut finalizers: Vec<String> = self
            .finalizers()
            .into_iter()
            .filter(|f| !is_cascade_finalizer(f))
            .collect();
        finalizers.push(finalizer.to_string());
        self.metadata.finalizers = Some(finalizers);
    }

    /// Remove every cascade finalizer
    pub fn unset_cascaded_deletion(&mut self) {
        let finalizers: Vec<String> = self
            .finalizers()
            .into_iter()
            .filter(|f| !is_cascade_finalizer(f))
            .collect();
        self.metadata.finalizers = Some(finalizers);
    }

    /// Condition entries of the given types
    pub fn conditions_of(&self, types: &[&str]) -> Vec<&ApplicationCondition> {
        self.status
            .conditions
            .iter()
            .filter(|c| types.contains(&c.type_.as_str()))
            .collect()
    }
}

fn is_cascade_finalizer(finalizer: &str) -> bool {
    finalizer == RESOURCES_FINALIZER
        || finalizer == FOREGROUND_FINALIZER
        || finalizer == BACKGROUND_FINALIZER
}

/// Desired state of an Application
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Single source (ignored when `sources` is non-empty)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ApplicationSource>,
    /// Multiple sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ApplicationSource>,
    /// Where the rendered manifests are deployed
    #[serde(default)]
    pub destination: ApplicationDestination,
    /// Governing project
    #[serde(default)]
    pub project: String,
    /// Automation, retry and sync options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,
    /// Number of history entries to retain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i64>,
}

impl ApplicationSpec {
    /// Whether the spec uses the multi-source form
    pub fn has_multiple_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    /// All sources, in declaration order
    pub fn get_sources(&self) -> Vec<ApplicationSource> {
        if self.has_multiple_sources() {
            self.sources.clone()
        } else {
            self.source.iter().cloned().collect()
        }
    }

    /// The first source
    pub fn get_source(&self) -> ApplicationSource {
        if self.has_multiple_sources() {
            self.sources.first().cloned().unwrap_or_default()
        } else {
            self.source.clone().unwrap_or_default()
        }
    }

    /// Whether automated sync is configured and not explicitly disabled
    pub fn is_automated(&self) -> bool {
        self.sync_policy
            .as_ref()
            .is_some_and(SyncPolicy::is_automated_sync_enabled)
    }
}

/// Repository reference and revision pointer
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    /// Repository URL (git or Helm/OCI)
    #[serde(rename = "repoURL", default)]
    pub repo_url: String,
    /// Directory within a git repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Branch, tag, commit or chart version
    #[serde(default)]
    pub target_revision: String,
    /// Helm chart name for chart repositories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    /// Reference name other sources can use to read files from this one
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Source name, unique within a multi-source Application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ApplicationSource {
    /// Whether this source points at a Helm chart
    pub fn is_helm(&self) -> bool {
        self.chart.as_deref().is_some_and(|c| !c.is_empty())
    }

    /// Whether nothing was recorded for this source
    pub fn is_zero(&self) -> bool {
        self.repo_url.is_empty()
            && self.path.is_none()
            && self.chart.is_none()
            && self.target_revision.is_empty()
    }
}

/// Target cluster and namespace
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDestination {
    /// Cluster API server URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Target namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Registered cluster name (alternative to `server`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Automation settings
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Automated sync configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<SyncPolicyAutomated>,
    /// Options passed to every sync (e.g. `Replace=true`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,
    /// Retry strategy for failed syncs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryStrategy>,
}

impl SyncPolicy {
    /// Whether automated sync is on
    pub fn is_automated_sync_enabled(&self) -> bool {
        self.automated
            .as_ref()
            .is_some_and(|a| a.enabled.unwrap_or(true))
    }
}

/// Automated sync configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicyAutomated {
    /// Delete resources no longer in git
    #[serde(default)]
    pub prune: bool,
    /// Revert drift automatically
    #[serde(default)]
    pub self_heal: bool,
    /// Explicit on/off switch; absent means on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Retry strategy for a sync
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    /// Maximum attempts; negative means unlimited
    #[serde(default)]
    pub limit: i64,
    /// Backoff between attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

/// Backoff settings for sync retries
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    /// Initial delay (e.g. `5s`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// Multiplier applied per attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<i64>,
    /// Upper bound on the delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<String>,
}

/// Queued directive consumed by the reconciliation loop
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Sync request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncOperation>,
    /// Who asked for the operation
    #[serde(default)]
    pub initiated_by: OperationInitiator,
    /// Free-form name/value pairs supplied by the initiator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub info: Vec<Info>,
    /// Retry strategy for this operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryStrategy>,
}

/// Sync parameters
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Concrete revision for single-source Applications
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    /// Concrete revisions, one per source
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<String>,
    /// Delete resources not present in the target state
    #[serde(default)]
    pub prune: bool,
    /// Validate without applying
    #[serde(default)]
    pub dry_run: bool,
    /// Sync options for this operation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,
    /// Apply or hook strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_strategy: Option<SyncStrategy>,
    /// Restrict the sync to these resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<SyncOperationResource>,
    /// Locally supplied manifests overriding the sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<String>,
    /// Source override for rollbacks of single-source Applications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ApplicationSource>,
    /// Source overrides for rollbacks of multi-source Applications
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ApplicationSource>,
}

/// How manifests are applied
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStrategy {
    /// Plain apply, hooks skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply: Option<SyncStrategyApply>,
    /// Apply with hooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<SyncStrategyHook>,
}

/// Apply strategy options
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncStrategyApply {
    /// Use `--force` semantics
    #[serde(default)]
    pub force: bool,
}

/// Hook strategy options
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncStrategyHook {
    /// Use `--force` semantics
    #[serde(default)]
    pub force: bool,
}

/// A resource selected for a partial sync
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperationResource {
    /// API group
    #[serde(default)]
    pub group: String,
    /// Kind
    pub kind: String,
    /// Name
    pub name: String,
    /// Namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Operation initiator
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationInitiator {
    /// Username of a human initiator
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Set when the controller initiated the operation
    #[serde(default)]
    pub automated: bool,
}

/// Name/value pair attached to an operation
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Info {
    /// Name
    pub name: String,
    /// Value
    pub value: String,
}

/// Observed state of an Application
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    /// Managed resources and their sync/health status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
    /// Aggregate sync status
    #[serde(default)]
    pub sync: SyncStatus,
    /// Aggregate health
    #[serde(default)]
    pub health: HealthStatus,
    /// Deployment history, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<RevisionHistory>,
    /// Warnings and errors reported by the controller
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ApplicationCondition>,
    /// State of the current or last operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_state: Option<OperationState>,
}

impl ApplicationStatus {
    /// History entry with the given id
    pub fn history_entry(&self, id: i64) -> Option<&RevisionHistory> {
        self.history.iter().find(|h| h.id == id)
    }
}

/// Aggregate sync status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// `Synced`, `OutOfSync` or `Unknown`
    #[serde(default)]
    pub status: String,
    /// Revision last compared
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    /// Revisions last compared, one per source
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<String>,
}

/// Health status code
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum HealthStatusCode {
    /// Health has not been assessed
    #[default]
    Unknown,
    /// Resource is converging
    Progressing,
    /// Resource is healthy
    Healthy,
    /// Resource is paused
    Suspended,
    /// Resource is failing
    Degraded,
    /// Resource does not exist in the cluster
    Missing,
}

/// Health of an Application or resource
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Status code
    #[serde(default)]
    pub status: HealthStatusCode,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Sync/health status of one managed resource
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// API group
    #[serde(default)]
    pub group: String,
    /// API version
    #[serde(default)]
    pub version: String,
    /// Kind
    pub kind: String,
    /// Namespace
    #[serde(default)]
    pub namespace: String,
    /// Name
    pub name: String,
    /// Sync status code
    #[serde(default)]
    pub status: String,
    /// Health, when assessed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
    /// Whether the resource is a sync hook
    #[serde(default)]
    pub hook: bool,
    /// Whether the resource would be pruned by the next sync
    #[serde(default)]
    pub requires_pruning: bool,
}

/// Record of a completed sync
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionHistory {
    /// Sequence id
    pub id: i64,
    /// Revision for single-source Applications
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    /// Revisions for multi-source Applications
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<String>,
    /// Source as it was when deployed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ApplicationSource>,
    /// Sources as they were when deployed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ApplicationSource>,
    /// Deployment time (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<String>,
    /// Who triggered the deployment
    #[serde(default)]
    pub initiated_by: OperationInitiator,
}

impl RevisionHistory {
    /// Whether this entry recorded the source(s) it was deployed from
    pub fn has_recorded_source(&self) -> bool {
        self.source.as_ref().is_some_and(|s| !s.is_zero())
            || self.sources.iter().any(|s| !s.is_zero())
    }
}

/// Controller-reported condition
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationCondition {
    /// Condition type (e.g. `ComparisonError`)
    #[serde(rename = "type")]
    pub type_: String,
    /// Detail
    #[serde(default)]
    pub message: String,
}

/// Phase of an operation
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationPhase {
    /// In progress
    #[default]
    Running,
    /// Termination requested
    Terminating,
    /// Finished unsuccessfully
    Failed,
    /// Could not run
    Error,
    /// Finished successfully
    Succeeded,
}

impl OperationPhase {
    /// Whether the operation has finished
    pub fn completed(&self) -> bool {
        matches!(
            self,
            OperationPhase::Failed | OperationPhase::Error | OperationPhase::Succeeded
        )
    }
}

/// State of an operation
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    /// The operation being run
    #[serde(default)]
    pub operation: Operation,
    /// Current phase
    #[serde(default)]
    pub phase: OperationPhase,
    /// Detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Start time (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Finish time (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}
