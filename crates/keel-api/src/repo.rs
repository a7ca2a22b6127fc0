//! Manifest and revision service seam
//!
//! Rendering manifests and resolving revisions happen in a separate service
//! that owns repository credentials and caches. This module defines the
//! interface the API uses and the small amount of revision logic that does
//! not need a round-trip.

use async_trait::async_trait;
use keel_common::crd::{AppProject, Application, ApplicationSource};

#[cfg(test)]
use mockall::automock;

use crate::error::Result;

/// Display value for an unset revision
pub const HEAD: &str = "HEAD";

/// A revision resolved to its concrete, content-addressed form
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedRevision {
    /// Commit SHA or exact chart version
    pub revision: String,
    /// Human-readable form of what was requested
    pub display: String,
}

/// Commit metadata for a revision
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RevisionMetadata {
    /// Commit author
    pub author: String,
    /// Commit date (RFC 3339)
    pub date: Option<String>,
    /// Tags pointing at the commit
    pub tags: Vec<String>,
    /// Commit message
    pub message: String,
    /// Signature verification result, when requested
    pub signature_info: Option<String>,
}

/// Helm chart metadata for a revision
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChartDetails {
    /// Chart description
    pub description: String,
    /// Chart home page
    pub home: String,
    /// Chart maintainers
    pub maintainers: Vec<String>,
}

/// Parameters for rendering one source
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestRequest {
    /// Application instance name used for tracking labels
    pub app_instance: String,
    /// Destination namespace
    pub namespace: String,
    /// Source to render
    pub source: ApplicationSource,
    /// Revision to render at
    pub revision: String,
    /// Governing project name
    pub project: String,
    /// Repository globs permitted by the project
    pub project_source_repos: Vec<String>,
    /// Whether the Application uses the multi-source form
    pub has_multiple_sources: bool,
}

/// Rendered manifests for one source
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestResponse {
    /// JSON-encoded objects
    pub manifests: Vec<String>,
    /// Concrete revision that was rendered
    pub revision: String,
    /// Namespace the manifests target
    pub namespace: String,
}

/// Manifest rendering and revision resolution
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestService: Send + Sync {
    /// Resolve an ambiguous revision (branch, tag, semver range) for a source
    async fn resolve_revision(
        &self,
        app: &Application,
        source: &ApplicationSource,
        ambiguous_revision: &str,
    ) -> Result<ResolvedRevision>;

    /// Render manifests for a source at a revision
    async fn generate_manifests(&self, request: &ManifestRequest) -> Result<ManifestResponse>;

    /// Commit metadata, with signature verification when `check_signature` is set
    async fn revision_metadata(
        &self,
        source: &ApplicationSource,
        revision: &str,
        check_signature: bool,
    ) -> Result<RevisionMetadata>;

    /// Helm chart metadata
    async fn chart_details(
        &self,
        source: &ApplicationSource,
        chart: &str,
        revision: &str,
    ) -> Result<ChartDetails>;

    /// Drop cached render results for a source so the next render is fresh
    async fn refresh_details(
        &self,
        app: &Application,
        source: &ApplicationSource,
        project: &AppProject,
    ) -> Result<()>;
}

/// Whether `revision` is a full SHA-1 or SHA-256 commit hash
pub fn is_commit_sha(revision: &str) -> bool {
    matches!(revision.len(), 40 | 64) && revision.chars().all(|c| c.is_ascii_hexdigit())
}

/// Display form of a requested revision
pub fn display_revision(ambiguous_revision: &str) -> &str {
    if ambiguous_revision.is_empty() {
        HEAD
    } else {
        ambiguous_revision
    }
}
