//! Request and response types for [`ApplicationService`](crate::ApplicationService)
//!
//! These are transport-neutral: a gRPC or REST layer deserializes into them
//! and serializes the responses back.

use keel_common::crd::{
    Application, ApplicationSpec, Info, RetryStrategy, SyncOperationResource, SyncStrategy,
};
use keel_common::sync_window::SyncWindow;
use serde::{Deserialize, Serialize};

use crate::script::ResourceActionParam;

/// Addresses one Application
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppKey {
    /// Application name
    pub name: String,
    /// Namespace; empty means the control namespace
    #[serde(default)]
    pub app_namespace: String,
    /// Project the caller believes the Application is in; empty means "don't know"
    #[serde(default)]
    pub project: String,
}

impl AppKey {
    /// Key for an Application in the control namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.app_namespace = namespace.into();
        self
    }

    /// Declare the project
    pub fn in_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }
}

/// Addresses one live resource managed by an Application
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    /// Resource namespace
    #[serde(default)]
    pub namespace: String,
    /// Resource name
    pub resource_name: String,
    /// API version; empty uses the version recorded in the resource tree
    #[serde(default)]
    pub version: String,
    /// API group
    #[serde(default)]
    pub group: String,
    /// Kind
    pub kind: String,
}

/// List, get and watch filters
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationQuery {
    /// Restrict to one Application
    #[serde(default)]
    pub name: Option<String>,
    /// `normal` or `hard` to force a refresh before returning
    #[serde(default)]
    pub refresh: Option<String>,
    /// Restrict to these projects
    #[serde(default)]
    pub projects: Vec<String>,
    /// Watch: skip events older than this version
    #[serde(default)]
    pub resource_version: String,
    /// Label selector
    #[serde(default)]
    pub selector: String,
    /// Restrict to Applications deploying from this repository
    #[serde(default)]
    pub repo: String,
    /// Namespace
    #[serde(default)]
    pub app_namespace: String,
    /// Declared project for single-Application gets
    #[serde(default)]
    pub project: String,
}

impl ApplicationQuery {
    /// Query for a single Application
    pub fn named(key: &AppKey) -> Self {
        Self {
            name: Some(key.name.clone()),
            app_namespace: key.app_namespace.clone(),
            project: key.project.clone(),
            ..Default::default()
        }
    }

    pub(crate) fn key(&self) -> AppKey {
        AppKey {
            name: self.name.clone().unwrap_or_default(),
            app_namespace: self.app_namespace.clone(),
            project: self.project.clone(),
        }
    }
}

/// Result of a list call
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationList {
    /// Cache version the list was read at
    pub resource_version: String,
    /// Matching Applications, sorted by qualified name
    pub items: Vec<Application>,
}

/// Create an Application
#[derive(Clone, Debug, Default)]
pub struct CreateRequest {
    /// Desired Application
    pub application: Application,
    /// Overwrite an existing Application with a different spec
    pub upsert: bool,
    /// Resolve source revisions against the manifest service (default on)
    pub validate: Option<bool>,
}

/// Replace an Application's spec, labels, annotations and finalizers
#[derive(Clone, Debug, Default)]
pub struct UpdateRequest {
    /// Desired Application
    pub application: Application,
    /// Resolve source revisions (default on)
    pub validate: Option<bool>,
    /// Declared project of the *existing* Application
    pub project: String,
}

/// Replace only the spec
#[derive(Clone, Debug, Default)]
pub struct UpdateSpecRequest {
    /// Target
    pub app: AppKey,
    /// New spec
    pub spec: ApplicationSpec,
    /// Resolve source revisions (default on)
    pub validate: Option<bool>,
}

/// Patch an Application
#[derive(Clone, Debug, Default)]
pub struct PatchRequest {
    /// Target
    pub app: AppKey,
    /// Patch document
    pub patch: String,
    /// `json` (default) or `merge`
    pub patch_type: String,
}

/// Delete an Application
#[derive(Clone, Debug, Default)]
pub struct DeleteRequest {
    /// Target
    pub app: AppKey,
    /// Whether managed resources are deleted too; unset means yes
    pub cascade: Option<bool>,
    /// `foreground` or `background`
    pub propagation_policy: Option<String>,
}

/// Filter for managed resource diffs
#[derive(Clone, Debug, Default)]
pub struct ResourcesQuery {
    /// Target
    pub app: AppKey,
    /// Resource namespace
    pub namespace: String,
    /// Resource name
    pub name: String,
    /// API version
    pub version: String,
    /// API group
    pub group: String,
    /// Kind
    pub kind: String,
}

/// Read a live resource
#[derive(Clone, Debug, Default)]
pub struct ResourceRequest {
    /// Owning Application
    pub app: AppKey,
    /// Resource
    pub resource: ResourceKey,
}

/// Live resource as YAML-compatible JSON
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceResponse {
    /// Serialized object
    pub manifest: String,
}

/// Patch a live resource
#[derive(Clone, Debug, Default)]
pub struct ResourcePatchRequest {
    /// Owning Application
    pub app: AppKey,
    /// Resource
    pub resource: ResourceKey,
    /// Patch document
    pub patch: String,
    /// `json`, `merge` or `strategic` (content types are accepted too)
    pub patch_type: String,
}

/// Delete a live resource
#[derive(Clone, Debug, Default)]
pub struct ResourceDeleteRequest {
    /// Owning Application
    pub app: AppKey,
    /// Resource
    pub resource: ResourceKey,
    /// Background propagation with a zero grace period
    pub force: bool,
    /// Orphan dependents
    pub orphan: bool,
}

/// Run a resource action
#[derive(Clone, Debug, Default)]
pub struct ResourceActionRunRequest {
    /// Owning Application
    pub app: AppKey,
    /// Target resource; the Application itself when it names the Application
    pub resource: ResourceKey,
    /// Action name
    pub action: String,
    /// Action parameters
    pub params: Vec<ResourceActionParam>,
}

/// Queue a sync
#[derive(Clone, Debug, Default)]
pub struct SyncRequest {
    /// Target
    pub app: AppKey,
    /// Revision for single-source Applications
    pub revision: String,
    /// Revisions for the sources named in `source_positions`
    pub revisions: Vec<String>,
    /// 1-based source positions `revisions` apply to
    pub source_positions: Vec<i64>,
    /// Validate only
    pub dry_run: bool,
    /// Delete resources not in the target state
    pub prune: bool,
    /// Apply or hook strategy
    pub strategy: Option<SyncStrategy>,
    /// Restrict the sync to these resources
    pub resources: Vec<SyncOperationResource>,
    /// Local manifests overriding the sources
    pub manifests: Vec<String>,
    /// Free-form name/value pairs recorded on the operation
    pub infos: Vec<Info>,
    /// Sync options replacing the policy's
    pub sync_options: Option<Vec<String>>,
    /// Retry strategy overriding the policy's
    pub retry_strategy: Option<RetryStrategy>,
}

/// Queue a rollback
#[derive(Clone, Debug, Default)]
pub struct RollbackRequest {
    /// Target
    pub app: AppKey,
    /// History entry id
    pub id: i64,
    /// Validate only
    pub dry_run: bool,
    /// Delete resources not in the target state
    pub prune: bool,
}

/// Sync windows for an Application
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncWindowsResponse {
    /// Windows active now
    pub active_windows: Vec<SyncWindow>,
    /// Windows applying to the Application
    pub assigned_windows: Vec<SyncWindow>,
    /// Whether a manual sync may run now
    pub can_sync: bool,
}

/// Commit or chart lookup for one source
#[derive(Clone, Debug, Default)]
pub struct RevisionQuery {
    /// Target
    pub app: AppKey,
    /// Revision to describe
    pub revision: String,
    /// Index into the sources (default 0)
    pub source_index: Option<i32>,
    /// History entry whose sources are used instead of the current ones
    pub version_id: Option<i32>,
}

/// Render manifests
#[derive(Clone, Debug, Default)]
pub struct ManifestQuery {
    /// Target
    pub app: AppKey,
    /// Revision for single-source Applications
    pub revision: Option<String>,
    /// 1-based source positions `revisions` apply to
    pub source_positions: Vec<i64>,
    /// Revisions for the sources named in `source_positions`
    pub revisions: Vec<String>,
}

/// Rendered manifests across all sources
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestsResponse {
    /// Rendered objects, Secrets masked
    pub manifests: Vec<String>,
    /// Resolved revision of the last source
    pub revision: String,
    /// Namespace manifests render into
    pub namespace: String,
}

/// Stream pod logs
#[derive(Clone, Debug, Default)]
pub struct PodLogsQuery {
    /// Owning Application
    pub app: AppKey,
    /// Namespace of the pod or target resource
    pub namespace: String,
    /// Single pod; when set the resource fields are ignored
    pub pod_name: Option<String>,
    /// Container
    pub container: Option<String>,
    /// Only lines newer than this many seconds
    pub since_seconds: Option<i64>,
    /// Last N lines only
    pub tail_lines: Option<i64>,
    /// Keep streaming
    pub follow: bool,
    /// Previous container instance
    pub previous: bool,
    /// Substring filter; a leading `!` inverts it
    pub filter: Option<String>,
    /// Case-sensitive filter
    pub match_case: bool,
    /// Target resource group
    pub group: String,
    /// Target resource kind
    pub kind: String,
    /// Target resource name
    pub resource_name: String,
}
