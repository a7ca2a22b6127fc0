//! AppProject resource: the authorization and policy boundary for Applications
//!
//! A project restricts which repositories an Application may deploy from,
//! which clusters/namespaces it may deploy to, which resource kinds it may
//! manage, whether commits must be signed, and when syncs may run.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::application::{Application, ApplicationDestination, ApplicationSource};
use crate::glob;
use crate::sync_window::{SyncWindow, SyncWindows};

/// AppProject groups Applications and constrains what they may do.
///
/// Example:
/// ```yaml
/// apiVersion: keel.dev/v1alpha1
/// kind: AppProject
/// metadata:
///   name: payments
///   namespace: keel
/// spec:
///   sourceRepos: ["https://github.com/acme/payments-*"]
///   destinations:
///     - server: https://kubernetes.default.svc
///       namespace: payments-*
///   syncWindows:
///     - kind: deny
///       schedule: "0 22 * * *"
///       duration: 8h
///       applications: ["*"]
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "AppProject",
    namespaced,
    printcolumn = r#"{"name":"Description","type":"string","jsonPath":".spec.description"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppProjectSpec {
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Repository URL globs Applications may deploy from (`!` prefix denies)
    #[serde(default)]
    pub source_repos: Vec<String>,

    /// Clusters and namespaces Applications may deploy to
    #[serde(default)]
    pub destinations: Vec<ApplicationDestination>,

    /// Namespaces, besides the control namespace, whose Applications may use this project
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_namespaces: Vec<String>,

    /// Cluster-scoped kinds that may be managed (deny-all when empty)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_resource_whitelist: Vec<GroupKind>,

    /// Cluster-scoped kinds that may never be managed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_resource_blacklist: Vec<GroupKind>,

    /// Namespaced kinds that may be managed (allow-all when empty)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_resource_whitelist: Vec<GroupKind>,

    /// Namespaced kinds that may never be managed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_resource_blacklist: Vec<GroupKind>,

    /// GnuPG keys that must have signed any deployed commit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signature_keys: Vec<SignatureKey>,

    /// Time-scheduled allow/deny rules for syncs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_windows: Vec<SyncWindow>,
}

/// API group and kind pattern
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct GroupKind {
    /// Group glob (empty is the core group)
    #[serde(default)]
    pub group: String,
    /// Kind glob
    pub kind: String,
}

impl GroupKind {
    fn matches(&self, group: &str, kind: &str) -> bool {
        glob::matches(&self.group, group) && glob::matches(&self.kind, kind)
    }
}

/// Required signing key
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignatureKey {
    /// GnuPG key ID
    #[serde(rename = "keyID")]
    pub key_id: String,
}

impl AppProject {
    /// Project name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Whether the project requires signed commits
    pub fn has_signature_keys(&self) -> bool {
        !self.spec.signature_keys.is_empty()
    }

    /// Whether Applications may deploy from the source's repository
    pub fn is_source_permitted(&self, source: &ApplicationSource) -> bool {
        glob::permitted_by(&self.spec.source_repos, &source.repo_url)
    }

    /// Whether Applications may deploy to the given cluster and namespace
    pub fn is_destination_permitted(
        &self,
        server: &str,
        cluster_name: &str,
        namespace: &str,
    ) -> bool {
        self.spec.destinations.iter().any(|d| {
            let cluster_ok = d
                .server
                .as_deref()
                .is_some_and(|p| glob::matches(p, server))
                || d
                    .name
                    .as_deref()
                    .is_some_and(|p| glob::matches(p, cluster_name));
            cluster_ok && glob::matches(d.namespace.as_deref().unwrap_or_default(), namespace)
        })
    }

    /// Whether Applications may manage resources of this group and kind
    pub fn is_group_kind_permitted(&self, group: &str, kind: &str, namespaced: bool) -> bool {
        if namespaced {
            let allowed = self.spec.namespace_resource_whitelist.is_empty()
                || self
                    .spec
                    .namespace_resource_whitelist
                    .iter()
                    .any(|gk| gk.matches(group, kind));
            allowed
                && !self
                    .spec
                    .namespace_resource_blacklist
                    .iter()
                    .any(|gk| gk.matches(group, kind))
        } else {
            self.spec
                .cluster_resource_whitelist
                .iter()
                .any(|gk| gk.matches(group, kind))
                && !self
                    .spec
                    .cluster_resource_blacklist
                    .iter()
                    .any(|gk| gk.matches(group, kind))
        }
    }

    /// Whether an Application living in `namespace` may use this project
    pub fn is_app_namespace_permitted(&self, namespace: &str, control_namespace: &str) -> bool {
        namespace.is_empty()
            || namespace == control_namespace
            || glob::any_matches(&self.spec.source_namespaces, namespace)
    }

    /// Sync windows applying to the given Application
    pub fn windows_for(&self, app: &Application) -> SyncWindows {
        SyncWindows::new(self.spec.sync_windows.clone()).matching(app)
    }
}
