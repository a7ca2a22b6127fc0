//! SyncOrchestrator: turns sync and rollback requests into queued operations
//!
//! Every precondition is checked before anything is written. The only side
//! effect of a successful call is the operation attached to the Application
//! (plus its audit event); applying it is the reconciliation loop's job.

use std::sync::Arc;

use chrono::Utc;
use keel_common::crd::{
    AppProject, Application, Operation, OperationInitiator, SyncOperation, SyncStrategy,
    SyncStrategyApply,
};
use keel_common::lock::KeyedLock;
use tracing::info;

use crate::access::AccessGate;
use crate::audit::{app_reference, reasons, AuditSink};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::mutation::ConcurrencyMutator;
use crate::rbac::{actions, UserIdentity};
use crate::repo::{display_revision, is_commit_sha, ManifestService};
use crate::request::{RollbackRequest, SyncRequest, SyncWindowsResponse};

/// Sync option that replaces objects instead of applying them
pub const SYNC_OPTION_REPLACE: &str = "Replace=true";

/// Concrete revisions chosen for a sync
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedRevisions {
    /// Single-source revision
    pub revision: String,
    /// Single-source display form
    pub display: String,
    /// Multi-source revisions, one per source
    pub revisions: Vec<String>,
    /// Multi-source display forms
    pub displays: Vec<String>,
}

impl ResolvedRevisions {
    fn describe(&self, multi_source: bool) -> String {
        if multi_source {
            self.displays.join(",")
        } else {
            self.display.clone()
        }
    }
}

/// Validates and queues sync and rollback operations
#[derive(Clone)]
pub struct SyncOrchestrator {
    gate: AccessGate,
    manifests: Arc<dyn ManifestService>,
    mutator: ConcurrencyMutator,
    audit: Arc<dyn AuditSink>,
    locks: Arc<KeyedLock>,
    config: Arc<ServerConfig>,
}

impl SyncOrchestrator {
    /// Create an orchestrator
    pub fn new(
        gate: AccessGate,
        manifests: Arc<dyn ManifestService>,
        mutator: ConcurrencyMutator,
        audit: Arc<dyn AuditSink>,
        locks: Arc<KeyedLock>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            gate,
            manifests,
            mutator,
            audit,
            locks,
            config,
        }
    }

    /// Queue a sync of `app`, already resolved for `get` by the caller
    pub async fn sync(
        &self,
        caller: &UserIdentity,
        app: Application,
        project: &AppProject,
        request: &SyncRequest,
    ) -> Result<Application> {
        let windows = project.windows_for(&app);
        match windows.can_sync(true, Utc::now()) {
            Ok(true) => {}
            Ok(false) => return Err(Error::precondition("cannot sync: blocked by sync window")),
            Err(e) => {
                return Err(Error::precondition(format!(
                    "cannot sync: invalid sync window: {e}"
                )))
            }
        }

        self.gate.enforce_app(caller, actions::SYNC, &app).await?;

        let local = !request.manifests.is_empty();
        if local {
            self.gate.enforce_app(caller, actions::OVERRIDE, &app).await?;
            if app.spec.is_automated() && !request.dry_run {
                return Err(Error::precondition(
                    "cannot use local sync when Automatic Sync Policy is enabled unless for dry run",
                ));
            }
        }
        if app.is_deleting() {
            return Err(Error::precondition("application is deleting"));
        }

        let resolved = self.resolve_source_revisions(&app, request).await?;

        let policy = app.spec.sync_policy.clone().unwrap_or_default();
        let sync_options = request
            .sync_options
            .clone()
            .unwrap_or(policy.sync_options);
        let retry = request.retry_strategy.clone().or(policy.retry);

        if sync_options.iter().any(|o| o == SYNC_OPTION_REPLACE)
            && !self.config.sync_with_replace_allowed
        {
            return Err(Error::precondition(
                "sync with replace was disabled on the API Server level via the server configuration",
            ));
        }
        if local && project.has_signature_keys() {
            return Err(Error::precondition(
                "Cannot use local sync when signature keys are required.",
            ));
        }

        let operation = Operation {
            sync: Some(SyncOperation {
                revision: resolved.revision.clone(),
                revisions: resolved.revisions.clone(),
                prune: request.prune,
                dry_run: request.dry_run,
                sync_options,
                sync_strategy: request.strategy.clone(),
                resources: request.resources.clone(),
                manifests: request.manifests.clone(),
                sources: app.spec.sources.clone(),
                source: None,
            }),
            initiated_by: OperationInitiator {
                username: caller.username.clone(),
                automated: false,
            },
            info: request.infos.clone(),
            retry,
        };

        let updated = self.queue(&app, operation).await?;

        let partial = if request.resources.is_empty() { "" } else { "partial " };
        let message = if local {
            format!("initiated {partial}sync locally")
        } else {
            format!(
                "initiated {partial}sync to {}",
                resolved.describe(updated.spec.has_multiple_sources())
            )
        };
        info!(application = %updated.qualified_name(), user = %caller.username, "{message}");
        self.audit
            .record(
                &app_reference(&updated),
                reasons::OPERATION_STARTED,
                &message,
                &caller.username,
            )
            .await;
        Ok(updated)
    }

    /// Queue a rollback of `app`, already resolved for `sync` by the caller
    pub async fn rollback(
        &self,
        caller: &UserIdentity,
        app: Application,
        request: &RollbackRequest,
    ) -> Result<Application> {
        if app.is_deleting() {
            return Err(Error::precondition("application is deleting"));
        }
        if app.spec.is_automated() {
            return Err(Error::precondition(
                "rollback cannot be initiated when auto-sync is enabled",
            ));
        }

        let Some(entry) = app.status.history_entry(request.id) else {
            return Err(Error::invalid(format!(
                "application {} does not have deployment with id {}",
                app.qualified_name(),
                request.id
            )));
        };
        if !entry.has_recorded_source() {
            // History written before sources were recorded cannot be replayed
            return Err(Error::precondition(
                "cannot rollback to revision deployed with Keel v0.11 or lower. sync to revision instead.",
            ));
        }

        let sync_options = app
            .spec
            .sync_policy
            .as_ref()
            .map(|p| p.sync_options.clone())
            .unwrap_or_default();
        let operation = Operation {
            sync: Some(SyncOperation {
                revision: entry.revision.clone(),
                revisions: entry.revisions.clone(),
                dry_run: request.dry_run,
                prune: request.prune,
                sync_options,
                sync_strategy: Some(SyncStrategy {
                    apply: Some(SyncStrategyApply::default()),
                    hook: None,
                }),
                source: entry.source.clone(),
                sources: entry.sources.clone(),
                ..Default::default()
            }),
            initiated_by: OperationInitiator {
                username: caller.username.clone(),
                automated: false,
            },
            ..Default::default()
        };

        let updated = self.queue(&app, operation).await?;
        self.audit
            .record(
                &app_reference(&updated),
                reasons::OPERATION_STARTED,
                &format!("initiated rollback to {}", request.id),
                &caller.username,
            )
            .await;
        Ok(updated)
    }

    /// Ask the running operation to stop
    pub async fn terminate(&self, caller: &UserIdentity, app: Application) -> Result<Application> {
        self.mutator.terminate(caller, app).await
    }

    /// Windows assigned to `app`, those active now, and whether a manual sync may run
    pub fn sync_windows(&self, app: &Application, project: &AppProject) -> Result<SyncWindowsResponse> {
        let windows = project.windows_for(app);
        let now = Utc::now();
        let can_sync = windows
            .can_sync(true, now)
            .map_err(|e| Error::from(e).context("error checking if app can sync"))?;
        let active = windows
            .active(now)
            .map_err(|e| Error::from(e).context("error getting active sync windows"))?;
        Ok(SyncWindowsResponse {
            active_windows: active.windows().to_vec(),
            assigned_windows: windows.windows().to_vec(),
            can_sync,
        })
    }

    /// Resolve the revision of every source for `request`
    pub async fn resolve_source_revisions(
        &self,
        app: &Application,
        request: &SyncRequest,
    ) -> Result<ResolvedRevisions> {
        let current = app.spec.get_sources();
        validate_source_positions(&request.source_positions, &request.revisions, current.len())?;
        let automated = app.spec.is_automated() && !request.dry_run;

        if !app.spec.has_multiple_sources() {
            let source = app.spec.get_source();
            if automated
                && !request.revision.is_empty()
                && request.revision != display_revision(&source.target_revision)
            {
                return Err(Error::precondition(format!(
                    "Cannot sync to {}: auto-sync currently set to {}",
                    request.revision, source.target_revision
                )));
            }
            let (revision, display) = self.resolve_revision(app, request, None).await?;
            return Ok(ResolvedRevisions {
                revision,
                display,
                ..Default::default()
            });
        }

        let mut requested = current.clone();
        for (position, revision) in request.source_positions.iter().zip(&request.revisions) {
            requested[(*position - 1) as usize].target_revision = revision.clone();
        }

        let mut resolved = ResolvedRevisions::default();
        for (index, source) in requested.iter().enumerate() {
            if automated
                && display_revision(&current[index].target_revision)
                    != display_revision(&source.target_revision)
            {
                return Err(Error::precondition(format!(
                    "Cannot sync source {} to {}: auto-sync currently set to {}",
                    source.repo_url, source.target_revision, current[index].target_revision
                )));
            }
            let (revision, display) = self.resolve_revision(app, request, Some(index)).await?;
            resolved.revisions.push(revision);
            resolved.displays.push(display);
        }
        Ok(resolved)
    }

    async fn resolve_revision(
        &self,
        app: &Application,
        request: &SyncRequest,
        source_index: Option<usize>,
    ) -> Result<(String, String)> {
        if !request.manifests.is_empty() {
            return Ok((String::new(), String::new()));
        }

        let ambiguous = ambiguous_revision(app, request, source_index);
        let source = match source_index {
            Some(i) => app.spec.sources.get(i).cloned().unwrap_or_default(),
            None => app.spec.get_source(),
        };
        if !source.is_helm() && is_commit_sha(&ambiguous) {
            return Ok((ambiguous.clone(), ambiguous));
        }

        let resolved = self
            .manifests
            .resolve_revision(app, &source, &ambiguous)
            .await
            .map_err(|e| e.context("error resolving repo revision"))?;
        Ok((resolved.revision, resolved.display))
    }

    async fn queue(&self, app: &Application, operation: Operation) -> Result<Application> {
        let _guard = self.locks.read(app.effective_project()).await;
        self.mutator
            .attach_operation(app.namespace(), app.name(), operation)
            .await
    }
}

/// Check 1-based source positions against the number of sources
pub fn validate_source_positions(positions: &[i64], revisions: &[String], sources: usize) -> Result<()> {
    if positions.len() != revisions.len() {
        return Err(Error::invalid(
            "number of source positions must match number of revisions",
        ));
    }
    if positions.iter().any(|&p| p <= 0 || p > sources as i64) {
        return Err(Error::invalid("source position is out of range"));
    }
    Ok(())
}

/// The request's revision for a source, else the source's target revision
fn ambiguous_revision(app: &Application, request: &SyncRequest, source_index: Option<usize>) -> String {
    let Some(index) = source_index else {
        return if request.revision.is_empty() {
            app.spec.get_source().target_revision
        } else {
            request.revision.clone()
        };
    };

    let requested = request
        .source_positions
        .iter()
        .zip(&request.revisions)
        .filter(|(position, _)| **position == index as i64 + 1)
        .map(|(_, revision)| revision.clone())
        .next_back()
        .unwrap_or_default();
    if requested.is_empty() {
        app.spec
            .sources
            .get(index)
            .map(|s| s.target_revision.clone())
            .unwrap_or_default()
    } else {
        requested
    }
}
