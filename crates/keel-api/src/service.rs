//! ApplicationService: the operation surface of the API server
//!
//! Reads are served from the informer-backed cache; anything that writes
//! resolves the Application against the store so the write starts from the
//! authoritative copy. Every operation takes the caller's identity and goes
//! through the [`AccessGate`] before touching state.

use std::collections::HashSet;
use std::future::{self, Future};
use std::sync::Arc;

use keel_common::crd::{
    AppProject, Application, ApplicationSource, ApplicationSpec, RefreshType,
    BACKGROUND_FINALIZER, CONDITION_COMPARISON_ERROR, CONDITION_INVALID_SPEC_ERROR,
    FOREGROUND_FINALIZER, RESOURCES_FINALIZER,
};
use keel_common::lock::KeyedLock;
use keel_common::resource_tree::{ApplicationTree, ResourceRef};
use keel_common::{DEFAULT_PROJECT, REFRESH_ANNOTATION};
use serde_json::{json, Map, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::access::{AccessGate, SECURITY_LOW, SECURITY_MEDIUM};
use crate::audit::{app_reference, reasons, AuditSink};
use crate::broadcast::{ApplicationEvent, NotificationBus};
use crate::cluster::{ClusterStore, DownstreamClient};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::mutation::{ConcurrencyMutator, MergeMode};
use crate::pod_logs::{LogEntry, PodLogStreamer};
use crate::rbac::{actions, resources, PermissionOracle, UserIdentity};
use crate::read_model::ReadModelSynchronizer;
use crate::repo::{display_revision, ChartDetails, ManifestRequest, ManifestService, RevisionMetadata};
use crate::request::{
    AppKey, ApplicationList, ApplicationQuery, CreateRequest, DeleteRequest, ManifestQuery,
    ManifestsResponse, PatchRequest, PodLogsQuery, ResourceActionRunRequest,
    ResourceDeleteRequest, ResourceKey, ResourcePatchRequest, ResourceRequest, ResourceResponse,
    ResourcesQuery, RevisionQuery, RollbackRequest, SyncRequest, SyncWindowsResponse,
    UpdateRequest, UpdateSpecRequest,
};
use crate::resource_action::{action_permission, ActionTarget, ResourceActionEngine};
use crate::resources::{filter_managed, locate, mask_secret, LiveResources};
use crate::script::{ResourceActionDefinition, ScriptEngine};
use crate::selector::LabelSelector;
use crate::state_cache::{infer_resource_health, AppStateCache, ResourceDiff};
use crate::store::{ApplicationCache, ApplicationStore, ProjectStore};
use crate::sync::{validate_source_positions, SyncOrchestrator};
use crate::watch::{wait_for_refresh, Watcher};

/// External systems the service talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Authoritative Application store
    pub store: Arc<dyn ApplicationStore>,
    /// Informer-backed read model
    pub cache: Arc<dyn ApplicationCache>,
    /// AppProject lookup
    pub projects: Arc<dyn ProjectStore>,
    /// RBAC decisions
    pub oracle: Arc<dyn PermissionOracle>,
    /// Destination cluster registry
    pub clusters: Arc<dyn ClusterStore>,
    /// Client for destination clusters
    pub downstream: Arc<dyn DownstreamClient>,
    /// Manifest rendering and revision resolution
    pub manifests: Arc<dyn ManifestService>,
    /// Resource action scripts
    pub scripts: Arc<dyn ScriptEngine>,
    /// Controller-published resource trees and diffs
    pub state: Arc<dyn AppStateCache>,
    /// Kubernetes event recorder
    pub audit: Arc<dyn AuditSink>,
}

/// Application CRUD, sync and live resource operations
#[derive(Clone)]
pub struct ApplicationService {
    config: Arc<ServerConfig>,
    store: Arc<dyn ApplicationStore>,
    cache: Arc<dyn ApplicationCache>,
    clusters: Arc<dyn ClusterStore>,
    manifests: Arc<dyn ManifestService>,
    state: Arc<dyn AppStateCache>,
    audit: Arc<dyn AuditSink>,
    bus: NotificationBus,
    locks: Arc<KeyedLock>,
    gate: AccessGate,
    mutator: ConcurrencyMutator,
    watcher: Watcher,
    sync: SyncOrchestrator,
    live: LiveResources,
    actions: ResourceActionEngine,
    logs: PodLogStreamer,
}

impl ApplicationService {
    /// Wire the components over the given collaborators.
    ///
    /// `bus` must be the bus the cache feed publishes to.
    pub fn new(config: ServerConfig, deps: Collaborators, bus: NotificationBus) -> Self {
        let config = Arc::new(config);
        let locks = Arc::new(KeyedLock::new());
        let gate = AccessGate::new(deps.oracle, deps.projects, config.namespace.clone());
        let mutator = ConcurrencyMutator::new(
            deps.store.clone(),
            ReadModelSynchronizer::new(deps.cache.clone()),
            deps.audit.clone(),
        );
        let watcher = Watcher::new(
            deps.cache.clone(),
            deps.state.clone(),
            bus.clone(),
            gate.clone(),
            config.clone(),
        );
        let sync = SyncOrchestrator::new(
            gate.clone(),
            deps.manifests.clone(),
            mutator.clone(),
            deps.audit.clone(),
            locks.clone(),
            config.clone(),
        );
        let live = LiveResources::new(
            gate.clone(),
            deps.clusters.clone(),
            deps.downstream.clone(),
            deps.audit.clone(),
            config.clone(),
        );
        let actions = ResourceActionEngine::new(
            deps.clusters.clone(),
            deps.downstream.clone(),
            deps.scripts,
            deps.audit.clone(),
        );
        let logs = PodLogStreamer::new(deps.downstream, config.max_pod_logs_to_render);

        Self {
            config,
            store: deps.store,
            cache: deps.cache,
            clusters: deps.clusters,
            manifests: deps.manifests,
            state: deps.state,
            audit: deps.audit,
            bus,
            locks,
            gate,
            mutator,
            watcher,
            sync,
            live,
            actions,
            logs,
        }
    }

    // ------------------------------------------------------------------------
    // Applications
    // ------------------------------------------------------------------------

    /// Applications the caller may read, sorted by qualified name
    pub async fn list(
        &self,
        caller: &UserIdentity,
        query: &ApplicationQuery,
    ) -> Result<ApplicationList> {
        let selector = LabelSelector::parse(&query.selector)?;
        let name = query.name.as_deref().filter(|n| !n.is_empty());
        let mut projects: HashSet<&str> = query.projects.iter().map(String::as_str).collect();
        if !query.project.is_empty() {
            projects.insert(&query.project);
        }

        let mut items = Vec::new();
        for app in self.cache.list() {
            if !query.app_namespace.is_empty() && app.namespace() != query.app_namespace {
                continue;
            }
            if name.is_some_and(|n| n != app.name()) {
                continue;
            }
            if !projects.is_empty() && !projects.contains(app.effective_project()) {
                continue;
            }
            if !query.repo.is_empty()
                && !app
                    .spec
                    .get_sources()
                    .iter()
                    .any(|s| s.repo_url == query.repo)
            {
                continue;
            }
            if !selector.matches(&app.labels()) || !self.config.is_namespace_enabled(app.namespace()) {
                continue;
            }
            if self
                .gate
                .allowed(
                    caller,
                    resources::APPLICATIONS,
                    actions::GET,
                    &app.rbac_name(self.gate.control_namespace()),
                )
                .await
            {
                items.push(app);
            }
        }
        items.sort_by_key(Application::qualified_name);

        Ok(ApplicationList {
            resource_version: self.cache.last_synced_version(),
            items,
        })
    }

    /// One Application, optionally refreshed first.
    ///
    /// A refresh blocks until the controller publishes a newer copy without
    /// the refresh marker, or `cancel` fires.
    pub async fn get(
        &self,
        caller: &UserIdentity,
        query: &ApplicationQuery,
        cancel: &CancellationToken,
    ) -> Result<Application> {
        if query.projects.len() > 1 {
            return Err(Error::invalid(
                "multiple projects specified - the get endpoint accepts either zero or one project",
            ));
        }
        let mut key = query.key();
        if key.project.is_empty() {
            key.project = query.projects.first().cloned().unwrap_or_default();
        }

        let (app, project) = self.resolve_cached(caller, actions::GET, &key).await?;
        let mut app = match query.refresh.as_deref() {
            None => app,
            Some(refresh) => {
                let refresh = RefreshType::parse(refresh).unwrap_or(RefreshType::Normal);
                self.refresh_and_wait(app, refresh, &project, cancel).await?
            }
        };
        self.infer_health(&mut app).await;
        Ok(app)
    }

    /// Create an Application; identical re-creates are no-ops
    pub async fn create(
        &self,
        caller: &UserIdentity,
        request: CreateRequest,
    ) -> Result<Application> {
        let mut app = request.application;
        self.gate.enforce_app(caller, actions::CREATE, &app).await?;
        let namespace = self.namespace_of(app.namespace())?;
        app.metadata.namespace = Some(namespace.clone());

        let project = self.gate.project_for(&app).await?;
        self.validate_and_normalize(caller, &mut app, &project, request.validate.unwrap_or(true))
            .await?;

        if app.operation.take().is_some() {
            warn!(
                user = %caller.username,
                application = %app.name(),
                security = SECURITY_LOW,
                "user attempted to set operation on create, it was ignored"
            );
        }

        let _guard = self.locks.read(app.effective_project()).await;
        let existing = match self.store.create(&app).await {
            Ok(created) => {
                self.audit
                    .record(
                        &app_reference(&created),
                        reasons::RESOURCE_CREATED,
                        "created application",
                        &caller.username,
                    )
                    .await;
                self.mutator.read_model().wait_for(&created).await;
                return Ok(created);
            }
            Err(e) if e.is_already_exists() => {
                self.store.get(&namespace, app.name()).await.map_err(|e| {
                    Error::internal(format!(
                        "unable to check existing application details ({namespace}): {e}"
                    ))
                })?
            }
            Err(e) => return Err(e.context("error creating application")),
        };

        if let Err(e) = self.clusters.resolve(&existing.spec.destination).await {
            return Err(Error::invalid(format!(
                "application destination spec for {} is invalid: {e}",
                existing.name()
            )));
        }
        if same_desired_state(&existing, &app) {
            return Ok(existing);
        }
        if !request.upsert {
            return Err(Error::invalid(
                "existing application spec is different, use upsert flag to force update",
            ));
        }

        self.gate.enforce_app(caller, actions::UPDATE, &app).await?;
        self.mutator
            .update(caller, existing, &app, MergeMode::Merge)
            .await
            .map_err(|e| e.context("error updating application"))
    }

    /// Replace spec, labels, annotations and finalizers
    pub async fn update(
        &self,
        caller: &UserIdentity,
        request: UpdateRequest,
    ) -> Result<Application> {
        self.gate
            .enforce_app(caller, actions::UPDATE, &request.application)
            .await?;
        self.validate_and_update(
            caller,
            request.application,
            request.validate.unwrap_or(true),
            &request.project,
        )
        .await
    }

    /// Replace the spec only
    pub async fn update_spec(
        &self,
        caller: &UserIdentity,
        request: UpdateSpecRequest,
    ) -> Result<ApplicationSpec> {
        let (mut app, _) = self.resolve_stored(caller, actions::UPDATE, &request.app).await?;
        app.spec = request.spec;
        let updated = self
            .validate_and_update(
                caller,
                app,
                request.validate.unwrap_or(true),
                &request.app.project,
            )
            .await?;
        Ok(updated.spec)
    }

    /// Apply a JSON (RFC 6902) or merge (RFC 7386) patch to the whole object
    pub async fn patch(&self, caller: &UserIdentity, request: &PatchRequest) -> Result<Application> {
        let (app, _) = self.resolve_stored(caller, actions::GET, &request.app).await?;
        self.gate.enforce_app(caller, actions::UPDATE, &app).await?;

        let mut document = serde_json::to_value(&app)
            .map_err(|e| Error::internal(format!("error marshaling application: {e}")))?;
        match request.patch_type.as_str() {
            "" | "json" => {
                let patch: json_patch::Patch = serde_json::from_str(&request.patch)
                    .map_err(|e| Error::invalid(format!("error decoding json patch: {e}")))?;
                json_patch::patch(&mut document, &patch.0)
                    .map_err(|e| Error::invalid(format!("error applying json patch: {e}")))?;
            }
            "merge" => {
                let patch: Value = serde_json::from_str(&request.patch)
                    .map_err(|e| Error::invalid(format!("error decoding merge patch: {e}")))?;
                json_patch::merge(&mut document, &patch);
            }
            other => {
                return Err(Error::invalid(format!(
                    "Patch type '{other}' is not supported"
                )))
            }
        }

        let patched: Application = serde_json::from_value(document)
            .map_err(|e| Error::invalid(format!("error unmarshaling patched app: {e}")))?;
        self.validate_and_update(caller, patched, true, &request.app.project)
            .await
    }

    /// Delete an Application, choosing how its resources go with it
    pub async fn delete(&self, caller: &UserIdentity, request: &DeleteRequest) -> Result<()> {
        let (mut app, _) = self.resolve_stored(caller, actions::GET, &request.app).await?;
        let _guard = self.locks.read(app.effective_project()).await;
        self.gate.enforce_app(caller, actions::DELETE, &app).await?;

        let policy = request.propagation_policy.as_deref().unwrap_or_default();
        let cascade = request.cascade.unwrap_or(true);
        if !cascade && !policy.is_empty() {
            return Err(Error::invalid(
                "cannot set propagation policy when cascading is disabled",
            ));
        }

        let changed = if cascade {
            let finalizer = propagation_finalizer(policy)
                .ok_or_else(|| Error::invalid(format!("invalid propagation policy: {policy}")))?;
            if app.finalizers().iter().any(|f| f == finalizer) {
                false
            } else {
                app.set_cascaded_deletion(finalizer);
                true
            }
        } else if app.cascaded_deletion() {
            app.unset_cascaded_deletion();
            true
        } else {
            false
        };

        if changed {
            let patch = json!({ "metadata": { "finalizers": app.finalizers() } });
            self.store
                .patch(app.namespace(), app.name(), &patch)
                .await
                .map_err(|e| e.context("error patching application with finalizers"))?;
        }

        self.store
            .delete(app.namespace(), app.name())
            .await
            .map_err(|e| e.context("error deleting application"))?;
        info!(user = %caller.username, application = %app.qualified_name(), cascade, "deleted application");
        self.audit
            .record(
                &app_reference(&app),
                reasons::RESOURCE_DELETED,
                "deleted application",
                &caller.username,
            )
            .await;
        Ok(())
    }

    /// Snapshot-then-tail stream of Applications the caller may read
    pub fn watch(
        &self,
        caller: UserIdentity,
        query: &ApplicationQuery,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<ApplicationEvent>> {
        self.watcher.watch(caller, query, cancel)
    }

    // ------------------------------------------------------------------------
    // Controller state
    // ------------------------------------------------------------------------

    /// Live resource tree
    pub async fn resource_tree(
        &self,
        caller: &UserIdentity,
        app: &AppKey,
        cancel: &CancellationToken,
    ) -> Result<ApplicationTree> {
        let (app, project) = self.resolve_cached(caller, actions::GET, app).await?;
        self.cached_tree(&app, &project, cancel).await
    }

    /// Managed resource diffs matching the query
    pub async fn managed_resources(
        &self,
        caller: &UserIdentity,
        query: &ResourcesQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResourceDiff>> {
        let (app, project) = self.resolve_cached(caller, actions::GET, &query.app).await?;
        let instance = app.instance_name(self.gate.control_namespace());
        let diffs = self
            .controller_state(&app, &project, cancel, "managed resources", || {
                self.state.managed_resources(&instance)
            })
            .await?;
        Ok(filter_managed(diffs, query))
    }

    // ------------------------------------------------------------------------
    // Live resources
    // ------------------------------------------------------------------------

    /// Read a live resource, Secrets masked
    pub async fn get_resource(
        &self,
        caller: &UserIdentity,
        request: &ResourceRequest,
        cancel: &CancellationToken,
    ) -> Result<ResourceResponse> {
        let (app, _, target) = self
            .live_target(caller, actions::GET, &request.app, &request.resource, cancel)
            .await?;
        self.live.get(&app, &target).await
    }

    /// Patch a live resource
    pub async fn patch_resource(
        &self,
        caller: &UserIdentity,
        request: &ResourcePatchRequest,
        cancel: &CancellationToken,
    ) -> Result<ResourceResponse> {
        let (app, _, target) = self
            .live_target(caller, actions::UPDATE, &request.app, &request.resource, cancel)
            .await?;
        self.live
            .patch(caller, &app, &target, &request.patch, &request.patch_type)
            .await
    }

    /// Delete a live resource
    pub async fn delete_resource(
        &self,
        caller: &UserIdentity,
        request: &ResourceDeleteRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (app, _, target) = self
            .live_target(caller, actions::DELETE, &request.app, &request.resource, cancel)
            .await?;
        self.live
            .delete(caller, &app, &target, request.force, request.orphan)
            .await
    }

    /// Actions the scripts offer for a resource (or the Application itself)
    pub async fn list_resource_actions(
        &self,
        caller: &UserIdentity,
        request: &ResourceRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResourceActionDefinition>> {
        let (app, _, target) = self
            .action_target(caller, actions::GET, &request.app, &request.resource, cancel)
            .await?;
        self.actions.list(&app, &target).await
    }

    /// Run a resource action
    pub async fn run_resource_action(
        &self,
        caller: &UserIdentity,
        request: &ResourceActionRunRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let permission = action_permission(
            &request.resource.group,
            &request.resource.kind,
            &request.action,
        );
        let (app, project, target) = self
            .action_target(caller, &permission, &request.app, &request.resource, cancel)
            .await?;
        self.actions
            .run(caller, &app, &project, &target, &request.action, &request.params)
            .await
    }

    /// Merged logs of the selected pods
    pub async fn pod_logs(
        &self,
        caller: &UserIdentity,
        query: &PodLogsQuery,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<Result<LogEntry>>> {
        let (app, project) = self.resolve_cached(caller, actions::GET, &query.app).await?;
        self.gate
            .enforce(
                caller,
                resources::LOGS,
                actions::GET,
                &app.rbac_name(self.gate.control_namespace()),
            )
            .await?;

        let tree = self.cached_tree(&app, &project, &cancel).await?;
        let cluster = self
            .clusters
            .resolve(&app.spec.destination)
            .await
            .map_err(|e| e.context("error getting application cluster config"))?;
        self.logs.open(&cluster, &tree, query, cancel)
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Queue a sync
    pub async fn sync(&self, caller: &UserIdentity, request: &SyncRequest) -> Result<Application> {
        let (app, project) = self.resolve_stored(caller, actions::GET, &request.app).await?;
        self.sync.sync(caller, app, &project, request).await
    }

    /// Queue a rollback to a history entry
    pub async fn rollback(
        &self,
        caller: &UserIdentity,
        request: &RollbackRequest,
    ) -> Result<Application> {
        let (app, _) = self.resolve_stored(caller, actions::SYNC, &request.app).await?;
        self.sync.rollback(caller, app, request).await
    }

    /// Ask the running operation to stop
    pub async fn terminate_operation(
        &self,
        caller: &UserIdentity,
        app: &AppKey,
    ) -> Result<Application> {
        let (app, _) = self.resolve_stored(caller, actions::SYNC, app).await?;
        self.sync.terminate(caller, app).await
    }

    /// Sync windows for an Application
    pub async fn get_sync_windows(
        &self,
        caller: &UserIdentity,
        app: &AppKey,
    ) -> Result<SyncWindowsResponse> {
        let (app, project) = self.resolve_cached(caller, actions::GET, app).await?;
        self.sync.sync_windows(&app, &project)
    }

    // ------------------------------------------------------------------------
    // Repository views
    // ------------------------------------------------------------------------

    /// Commit metadata for a revision of one source
    pub async fn revision_metadata(
        &self,
        caller: &UserIdentity,
        query: &RevisionQuery,
    ) -> Result<RevisionMetadata> {
        let (app, project) = self.resolve_cached(caller, actions::GET, &query.app).await?;
        let source = source_at(&app, query.source_index, query.version_id)?;
        self.manifests
            .revision_metadata(&source, &query.revision, project.has_signature_keys())
            .await
            .map_err(|e| e.context("error getting revision metadata"))
    }

    /// Chart metadata for a revision of one Helm source
    pub async fn revision_chart_details(
        &self,
        caller: &UserIdentity,
        query: &RevisionQuery,
    ) -> Result<ChartDetails> {
        let (app, _) = self.resolve_cached(caller, actions::GET, &query.app).await?;
        let source = source_at(&app, query.source_index, query.version_id)?;
        let Some(chart) = source.chart.as_deref().filter(|c| !c.is_empty()) else {
            return Err(Error::invalid(format!(
                "no chart found for application: {}",
                app.name()
            )));
        };
        self.manifests
            .chart_details(&source, chart, &query.revision)
            .await
            .map_err(|e| e.context("error getting chart details"))
    }

    /// Render manifests for every source, Secrets masked
    pub async fn get_manifests(
        &self,
        caller: &UserIdentity,
        query: &ManifestQuery,
    ) -> Result<ManifestsResponse> {
        if query.app.name.is_empty() {
            return Err(Error::invalid("invalid request: application name is missing"));
        }
        let (app, project) = self.resolve_cached(caller, actions::GET, &query.app).await?;

        let mut sources = app.spec.get_sources();
        if app.spec.has_multiple_sources() {
            validate_source_positions(&query.source_positions, &query.revisions, sources.len())?;
            for (position, revision) in query.source_positions.iter().zip(&query.revisions) {
                sources[(*position - 1) as usize].target_revision = revision.clone();
            }
        } else if let Some(revision) = query.revision.as_deref().filter(|r| !r.is_empty()) {
            if let Some(source) = sources.first_mut() {
                source.target_revision = revision.to_string();
            }
        }

        let instance = app.instance_name(self.gate.control_namespace());
        let namespace = app.spec.destination.namespace.clone().unwrap_or_default();
        let mut response = ManifestsResponse::default();
        for source in sources {
            let rendered = self
                .manifests
                .generate_manifests(&ManifestRequest {
                    app_instance: instance.clone(),
                    namespace: namespace.clone(),
                    revision: source.target_revision.clone(),
                    source,
                    project: project.name().to_string(),
                    project_source_repos: project.spec.source_repos.clone(),
                    has_multiple_sources: app.spec.has_multiple_sources(),
                })
                .await
                .map_err(|e| e.context("error generating manifests"))?;
            for manifest in rendered.manifests {
                response.manifests.push(masked_manifest(manifest)?);
            }
            response.revision = rendered.revision;
            response.namespace = rendered.namespace;
        }
        Ok(response)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn namespace_of(&self, requested: &str) -> Result<String> {
        let namespace = self.config.namespace_or_default(requested);
        if !self.config.is_namespace_enabled(namespace) {
            warn!(
                namespace,
                security = SECURITY_MEDIUM,
                "request for application in a namespace that is not enabled"
            );
            return Err(Error::PermissionDenied);
        }
        Ok(namespace.to_string())
    }

    fn cached(&self, namespace: &str, name: &str) -> Result<Application> {
        self.cache
            .get(namespace, name)
            .ok_or_else(|| Error::app_not_found(name))
    }

    async fn resolve_cached(
        &self,
        caller: &UserIdentity,
        action: &str,
        key: &AppKey,
    ) -> Result<(Application, AppProject)> {
        let namespace = self.namespace_of(&key.app_namespace)?;
        self.gate
            .resolve(caller, action, &key.project, &namespace, &key.name, || {
                future::ready(self.cached(&namespace, &key.name))
            })
            .await
    }

    async fn resolve_stored(
        &self,
        caller: &UserIdentity,
        action: &str,
        key: &AppKey,
    ) -> Result<(Application, AppProject)> {
        let namespace = self.namespace_of(&key.app_namespace)?;
        self.gate
            .resolve(caller, action, &key.project, &namespace, &key.name, || {
                self.store.get(&namespace, &key.name)
            })
            .await
    }

    async fn live_target(
        &self,
        caller: &UserIdentity,
        action: &str,
        key: &AppKey,
        resource: &ResourceKey,
        cancel: &CancellationToken,
    ) -> Result<(Application, AppProject, ResourceRef)> {
        let namespace = self.namespace_of(&key.app_namespace)?;
        let (app, project) = self
            .live
            .authorize(caller, action, key, resource, &namespace, || {
                future::ready(self.cached(&namespace, &key.name))
            })
            .await?;
        let tree = self.cached_tree(&app, &project, cancel).await?;
        let target = locate(&app, &tree, resource)?;
        Ok((app, project, target))
    }

    async fn action_target(
        &self,
        caller: &UserIdentity,
        action: &str,
        key: &AppKey,
        resource: &ResourceKey,
        cancel: &CancellationToken,
    ) -> Result<(Application, AppProject, ActionTarget)> {
        let namespace = self.namespace_of(&key.app_namespace)?;
        let (app, project) = self
            .live
            .authorize(caller, action, key, resource, &namespace, || {
                future::ready(self.cached(&namespace, &key.name))
            })
            .await?;
        if ActionTarget::is_self(&app, resource) {
            return Ok((app, project, ActionTarget::Application));
        }
        let tree = self.cached_tree(&app, &project, cancel).await?;
        let target = locate(&app, &tree, resource)?;
        Ok((app, project, ActionTarget::Resource(target)))
    }

    async fn infer_health(&self, app: &mut Application) {
        let instance = app.instance_name(self.gate.control_namespace());
        match self.state.resource_tree(&instance).await {
            Ok(Some(tree)) => infer_resource_health(app, &tree),
            Ok(None) => {}
            Err(e) => warn!(application = %app.name(), error = %e, "failed to read resource tree"),
        }
    }

    async fn cached_tree(
        &self,
        app: &Application,
        project: &AppProject,
        cancel: &CancellationToken,
    ) -> Result<ApplicationTree> {
        let instance = app.instance_name(self.gate.control_namespace());
        self.controller_state(app, project, cancel, "resource tree", || {
            self.state.resource_tree(&instance)
        })
        .await
    }

    /// Read controller state, refreshing once on a miss.
    ///
    /// A miss explained by a comparison or spec error is reported as is.
    async fn controller_state<T, F, Fut>(
        &self,
        app: &Application,
        project: &AppProject,
        cancel: &CancellationToken,
        what: &str,
        read: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        if let Some(found) = read().await? {
            return Ok(found);
        }

        let blocking = app.conditions_of(&[CONDITION_COMPARISON_ERROR, CONDITION_INVALID_SPEC_ERROR]);
        if !blocking.is_empty() {
            let messages: Vec<String> = blocking
                .iter()
                .map(|c| format!("{}: {}", c.type_, c.message))
                .collect();
            return Err(Error::precondition(messages.join("; ")));
        }

        self.refresh_and_wait(app.clone(), RefreshType::Normal, project, cancel)
            .await?;
        read().await?.ok_or_else(|| {
            Error::precondition(format!("{what} of application {} is not available", app.name()))
        })
    }

    async fn refresh_and_wait(
        &self,
        app: Application,
        refresh: RefreshType,
        project: &AppProject,
        cancel: &CancellationToken,
    ) -> Result<Application> {
        let namespace = app.namespace().to_string();
        let name = app.name().to_string();

        // Subscribe before writing the marker so the refreshed copy can't slip past
        let mut subscription = {
            let (namespace, name) = (namespace.clone(), name.clone());
            self.bus
                .subscribe(move |candidate| candidate.namespace() == namespace && candidate.name() == name)
        };

        let mut annotations = Map::new();
        annotations.insert(
            REFRESH_ANNOTATION.to_string(),
            Value::String(refresh.as_str().to_string()),
        );
        let patch = json!({ "metadata": { "annotations": annotations } });
        let patched = self
            .store
            .patch(&namespace, &name, &patch)
            .await
            .map_err(|e| e.context("error refreshing the app"))?;

        if refresh == RefreshType::Hard {
            for source in app.spec.get_sources() {
                if let Err(e) = self.manifests.refresh_details(&app, &source, project).await {
                    warn!(application = %name, repo = %source.repo_url, error = %e, "failed to invalidate cached manifests");
                }
            }
        }

        let baseline = patched.version_number().unwrap_or_default();
        wait_for_refresh(&mut subscription, baseline, cancel).await
    }

    async fn validate_and_update(
        &self,
        caller: &UserIdentity,
        mut desired: Application,
        validate: bool,
        declared_project: &str,
    ) -> Result<Application> {
        let namespace = self.namespace_of(desired.namespace())?;
        desired.metadata.namespace = Some(namespace.clone());
        let key = AppKey {
            name: desired.name().to_string(),
            app_namespace: namespace,
            project: declared_project.to_string(),
        };

        let (current, current_project) = self.resolve_stored(caller, actions::UPDATE, &key).await?;
        let project = if desired.effective_project() == current.effective_project() {
            current_project
        } else {
            self.gate.project_for(&desired).await?
        };
        self.validate_and_normalize(caller, &mut desired, &project, validate)
            .await?;

        // A project move excludes syncs and deletes queued under the old project
        let moving = desired.effective_project() != current.effective_project();
        let _guard = self.locks.lock(current.effective_project(), moving).await;
        self.mutator
            .update(caller, current, &desired, MergeMode::Replace)
            .await
            .map_err(|e| e.context("error updating application"))
    }

    /// Check names, project moves, destination and sources; default the project
    async fn validate_and_normalize(
        &self,
        caller: &UserIdentity,
        app: &mut Application,
        project: &AppProject,
        validate: bool,
    ) -> Result<()> {
        if app.name().is_empty() {
            return Err(Error::invalid("resource name may not be empty"));
        }

        let sources = app.spec.get_sources();
        let mut names = HashSet::new();
        for name in sources.iter().filter_map(|s| s.name.as_deref()).filter(|n| !n.is_empty()) {
            if !names.insert(name) {
                return Err(Error::invalid(format!(
                    "application {} has duplicate source name: {name}",
                    app.name()
                )));
            }
        }

        let current = match self.store.get(app.namespace(), app.name()).await {
            Ok(current) => Some(current),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.context("error getting application by name")),
        };
        if let Some(current) = &current {
            if current.effective_project() != app.effective_project() {
                // Moving between projects needs rights in both
                self.gate.enforce_app(caller, actions::CREATE, app).await?;
                self.gate.enforce_app(caller, actions::UPDATE, current).await?;
            }
        }

        let cluster = self
            .clusters
            .resolve(&app.spec.destination)
            .await
            .map_err(|e| {
                Error::invalid(format!(
                    "application destination spec for {} is invalid: {e}",
                    app.name()
                ))
            })?;

        let mut conditions = Vec::new();
        if sources.is_empty() {
            conditions.push("spec.source or spec.sources must be specified".to_string());
        }
        for source in &sources {
            if !project.is_source_permitted(source) {
                conditions.push(format!(
                    "application repo {} is not permitted in project '{}'",
                    source.repo_url,
                    project.name()
                ));
                continue;
            }
            if validate {
                if let Err(e) = self
                    .manifests
                    .resolve_revision(app, source, &source.target_revision)
                    .await
                {
                    conditions.push(format!(
                        "unable to resolve '{}' in {}: {e}",
                        display_revision(&source.target_revision),
                        source.repo_url
                    ));
                }
            }
        }

        let destination_namespace = app.spec.destination.namespace.as_deref().unwrap_or_default();
        if !project.is_destination_permitted(&cluster.server, &cluster.name, destination_namespace) {
            conditions.push(format!(
                "application destination server '{}' and namespace '{}' do not match any of the allowed destinations in project '{}'",
                cluster.server,
                destination_namespace,
                project.name()
            ));
        }

        if !conditions.is_empty() {
            return Err(Error::invalid(format!(
                "application spec for {} is invalid: {}",
                app.name(),
                conditions.join("; ")
            )));
        }

        if app.spec.project.is_empty() {
            app.spec.project = DEFAULT_PROJECT.to_string();
        }
        Ok(())
    }
}

fn same_desired_state(existing: &Application, desired: &Application) -> bool {
    existing.spec == desired.spec
        && existing.labels() == desired.labels()
        && existing.annotations() == desired.annotations()
        && existing.finalizers() == desired.finalizers()
}

fn propagation_finalizer(policy: &str) -> Option<&'static str> {
    match policy.to_ascii_lowercase().as_str() {
        "" => Some(RESOURCES_FINALIZER),
        "foreground" => Some(FOREGROUND_FINALIZER),
        "background" => Some(BACKGROUND_FINALIZER),
        _ => None,
    }
}

fn masked_manifest(manifest: String) -> Result<String> {
    let object: Value = serde_json::from_str(&manifest)
        .map_err(|e| Error::internal(format!("error unmarshaling manifest into object: {e}")))?;
    let masked = mask_secret(object.clone());
    if masked == object {
        Ok(manifest)
    } else {
        Ok(masked.to_string())
    }
}

/// The source at `source_index` (default 0), taken from the history entry
/// `version_id` when given and from the spec otherwise.
pub fn source_at(
    app: &Application,
    source_index: Option<i32>,
    version_id: Option<i32>,
) -> Result<ApplicationSource> {
    let sources = match version_id {
        None => app.spec.get_sources(),
        Some(id) => {
            if app.status.history.is_empty() {
                return Err(Error::invalid(format!(
                    "version ID {id} not found because the app has no history"
                )));
            }
            let entry = app
                .status
                .history_entry(i64::from(id))
                .ok_or_else(|| Error::invalid(format!("revision history not found for version ID {id}")))?;
            if entry.sources.is_empty() {
                vec![entry.source.clone().unwrap_or_default()]
            } else {
                entry.sources.clone()
            }
        }
    };

    let index = source_index.unwrap_or(0);
    usize::try_from(index)
        .ok()
        .and_then(|i| sources.get(i))
        .cloned()
        .ok_or_else(|| {
            if sources.len() == 1 {
                Error::invalid(format!(
                    "source index {index} not found because there is only 1 source"
                ))
            } else {
                Error::invalid(format!(
                    "source index {index} not found because there are only {} sources",
                    sources.len()
                ))
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopAuditSink;
    use crate::broadcast::EventType;
    use crate::cluster::{Cluster, MockClusterStore, MockDownstreamClient};
    use crate::repo::{MockManifestService, ManifestResponse, ResolvedRevision};
    use crate::resources::SECRET_MASK;
    use crate::script::MockScriptEngine;
    use crate::state_cache::InMemoryStateCache;
    use crate::testing::{app_in, caller, project, source, Grants, InMemoryStore, StaticProjects};
    use futures::StreamExt;
    use keel_common::crd::{
        ApplicationCondition, Operation, RevisionHistory, SignatureKey,
    };
    use keel_common::resource_tree::ResourceNode;
    use kube::api::DynamicObject;
    use rstest::rstest;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryStore>,
        state: Arc<InMemoryStateCache>,
        bus: NotificationBus,
        service: ApplicationService,
    }

    struct Setup {
        grants: Grants,
        manifests: MockManifestService,
        downstream: MockDownstreamClient,
        scripts: MockScriptEngine,
        config: ServerConfig,
    }

    impl Setup {
        fn new(grants: Grants) -> Self {
            Self {
                grants,
                manifests: resolving(),
                downstream: MockDownstreamClient::new(),
                scripts: MockScriptEngine::new(),
                config: ServerConfig::default(),
            }
        }

        fn build(self) -> Harness {
            let store = Arc::new(InMemoryStore::new());
            let state = Arc::new(InMemoryStateCache::new());
            let bus = NotificationBus::new(16);

            let mut restricted = project("restricted");
            restricted.spec.source_repos = vec!["https://github.com/acme/other".to_string()];
            let mut signed = project("signed");
            signed.spec.signature_keys = vec![SignatureKey {
                key_id: "4AEE18F83AFDEB23".to_string(),
            }];

            let mut clusters = MockClusterStore::new();
            clusters.expect_resolve().returning(|_| Ok(Cluster::in_cluster()));

            let service = ApplicationService::new(
                self.config,
                Collaborators {
                    store: store.clone(),
                    cache: store.clone(),
                    projects: Arc::new(StaticProjects::new([
                        project("default"),
                        project("p1"),
                        project("p2"),
                        restricted,
                        signed,
                    ])),
                    oracle: Arc::new(self.grants),
                    clusters: Arc::new(clusters),
                    downstream: Arc::new(self.downstream),
                    manifests: Arc::new(self.manifests),
                    scripts: Arc::new(self.scripts),
                    state: state.clone(),
                    audit: Arc::new(NoopAuditSink),
                },
                bus.clone(),
            );
            Harness {
                store,
                state,
                bus,
                service,
            }
        }
    }

    fn harness(grants: Grants) -> Harness {
        Setup::new(grants).build()
    }

    fn resolving() -> MockManifestService {
        let mut manifests = MockManifestService::new();
        manifests.expect_resolve_revision().returning(|_, _, ambiguous| {
            Ok(ResolvedRevision {
                revision: format!("sha-of-{}", display_revision(ambiguous)),
                display: display_revision(ambiguous).to_string(),
            })
        });
        manifests
    }

    fn create_request(app: Application) -> CreateRequest {
        CreateRequest {
            application: app,
            ..Default::default()
        }
    }

    fn labelled(mut app: Application, key: &str, value: &str) -> Application {
        app.metadata.labels = Some(BTreeMap::from([(key.to_string(), value.to_string())]));
        app
    }

    fn node(group: &str, kind: &str, name: &str, uid: &str) -> ResourceNode {
        ResourceNode {
            resource_ref: ResourceRef {
                group: group.to_string(),
                version: "v1".to_string(),
                kind: kind.to_string(),
                namespace: "guestbook".to_string(),
                name: name.to_string(),
                uid: uid.to_string(),
            },
            ..Default::default()
        }
    }

    fn tree_with(nodes: Vec<ResourceNode>) -> ApplicationTree {
        ApplicationTree {
            nodes,
            ..Default::default()
        }
    }

    /// Wait for the refresh marker written by the service
    async fn refresh_requested(h: &Harness, name: &str) -> Application {
        loop {
            if let Some(app) = h.store.current("keel", name) {
                if app.refresh_requested().is_some() {
                    return app;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Play the controller: clear the marker, bump the version and publish
    fn complete_refresh(h: &Harness, mut app: Application) {
        if let Some(annotations) = app.metadata.annotations.as_mut() {
            annotations.remove(REFRESH_ANNOTATION);
        }
        let refreshed = h.store.seed(app);
        h.bus
            .publish(ApplicationEvent::new(EventType::Modified, refreshed));
    }

    // ========================================================================
    // Story: create is idempotent and guarded
    // ========================================================================

    #[tokio::test]
    async fn create_requires_create_rights() {
        let h = harness(Grants::none().allow("applications", "get", "p1/guestbook"));

        let err = h
            .service
            .create(&caller("alice"), create_request(app_in("keel", "guestbook", "p1")))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PermissionDenied));
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn identical_create_returns_the_existing_application() {
        let h = harness(Grants::none().allow("applications", "create", "p1/guestbook"));
        let alice = caller("alice");

        let first = h
            .service
            .create(&alice, create_request(app_in("keel", "guestbook", "p1")))
            .await
            .unwrap();
        let second = h
            .service
            .create(&alice, create_request(app_in("keel", "guestbook", "p1")))
            .await
            .unwrap();

        assert_eq!(second.resource_version(), first.resource_version());
        assert_eq!(h.store.writes(), 1);
    }

    #[tokio::test]
    async fn different_spec_needs_upsert_and_update_rights() {
        let h = harness(Grants::none().allow("applications", "create", "p1/guestbook"));
        let alice = caller("alice");
        h.service
            .create(&alice, create_request(app_in("keel", "guestbook", "p1")))
            .await
            .unwrap();

        let mut changed = app_in("keel", "guestbook", "p1");
        changed.spec.source = Some(source("https://github.com/acme/guestbook", "v2"));

        let err = h
            .service
            .create(&alice, create_request(changed.clone()))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, Error::InvalidArgument(m) if m.contains("use upsert flag")),
            "{err:?}"
        );

        let upsert = CreateRequest {
            application: changed,
            upsert: true,
            validate: None,
        };
        let err = h.service.create(&alice, upsert).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied));
        assert_eq!(h.store.writes(), 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_a_different_spec() {
        let h = harness(
            Grants::none()
                .allow("applications", "create", "p1/guestbook")
                .allow("applications", "update", "p1/guestbook"),
        );
        let alice = caller("alice");
        h.service
            .create(&alice, create_request(app_in("keel", "guestbook", "p1")))
            .await
            .unwrap();

        let mut changed = app_in("keel", "guestbook", "p1");
        changed.spec.source = Some(source("https://github.com/acme/guestbook", "v2"));
        let updated = h
            .service
            .create(
                &alice,
                CreateRequest {
                    application: changed,
                    upsert: true,
                    validate: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.spec.get_source().target_revision, "v2");
        let stored = h.store.current("keel", "guestbook").unwrap();
        assert_eq!(stored.spec.get_source().target_revision, "v2");
    }

    #[tokio::test]
    async fn client_supplied_operation_is_dropped() {
        let h = harness(Grants::all());
        let mut app = app_in("keel", "guestbook", "default");
        app.operation = Some(Operation::default());

        let created = h
            .service
            .create(&caller("alice"), create_request(app))
            .await
            .unwrap();

        assert!(created.operation.is_none());
        assert!(h.store.current("keel", "guestbook").unwrap().operation.is_none());
    }

    #[tokio::test]
    async fn disabled_namespace_is_denied() {
        let h = harness(Grants::all());

        let err = h
            .service
            .create(&caller("alice"), create_request(app_in("other", "guestbook", "default")))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PermissionDenied));
    }

    #[tokio::test]
    async fn empty_project_is_normalized_to_default() {
        let h = harness(Grants::all());

        let created = h
            .service
            .create(&caller("alice"), create_request(app_in("keel", "guestbook", "")))
            .await
            .unwrap();

        assert_eq!(created.spec.project, DEFAULT_PROJECT);
    }

    // ========================================================================
    // Story: spec validation
    // ========================================================================

    #[tokio::test]
    async fn unresolvable_revision_fails_validation_unless_disabled() {
        let mut setup = Setup::new(Grants::all());
        setup.manifests = MockManifestService::new();
        setup
            .manifests
            .expect_resolve_revision()
            .returning(|_, _, _| Err(Error::upstream("repo server", "reference not found")));
        let h = setup.build();
        let alice = caller("alice");

        let err = h
            .service
            .create(&alice, create_request(app_in("keel", "guestbook", "default")))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, Error::InvalidArgument(m) if m.starts_with("application spec for guestbook is invalid")),
            "{err:?}"
        );

        let unvalidated = CreateRequest {
            application: app_in("keel", "guestbook", "default"),
            upsert: false,
            validate: Some(false),
        };
        h.service.create(&alice, unvalidated).await.unwrap();
    }

    #[tokio::test]
    async fn repository_outside_the_project_is_rejected() {
        let h = harness(Grants::all());
        let request = CreateRequest {
            application: app_in("keel", "guestbook", "restricted"),
            upsert: false,
            validate: Some(false),
        };

        let err = h.service.create(&caller("alice"), request).await.unwrap_err();

        assert!(
            matches!(&err, Error::InvalidArgument(m) if m.contains("is not permitted in project 'restricted'")),
            "{err:?}"
        );
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn duplicate_source_names_are_rejected() {
        let h = harness(Grants::all());
        let mut app = app_in("keel", "guestbook", "default");
        let mut named = source("https://github.com/acme/guestbook", "main");
        named.name = Some("web".to_string());
        app.spec.source = None;
        app.spec.sources = vec![named.clone(), named];

        let err = h
            .service
            .create(&caller("alice"), create_request(app))
            .await
            .unwrap_err();

        assert!(
            matches!(&err, Error::InvalidArgument(m) if m.contains("duplicate source name: web")),
            "{err:?}"
        );
    }

    // ========================================================================
    // Story: update and patch
    // ========================================================================

    #[tokio::test]
    async fn updates_from_two_callers_both_land() {
        let h = harness(Grants::all());
        h.store.seed(app_in("keel", "guestbook", "default"));
        let alice = caller("alice");
        let request = |team: &str| UpdateRequest {
            application: labelled(app_in("keel", "guestbook", "default"), "team", team),
            validate: Some(false),
            project: String::new(),
        };

        let (a, b) = tokio::join!(
            h.service.update(&alice, request("a")),
            h.service.update(&alice, request("b"))
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.resource_version(), b.resource_version());
        assert_eq!(h.store.writes(), 2);
    }

    #[tokio::test]
    async fn moving_between_projects_needs_create_in_the_new_one() {
        let grants = Grants::none()
            .allow("applications", "update", "p1/guestbook")
            .allow("applications", "update", "p2/guestbook");
        let h = harness(grants);
        h.store.seed(app_in("keel", "guestbook", "p1"));
        let request = UpdateRequest {
            application: app_in("keel", "guestbook", "p2"),
            validate: Some(false),
            project: String::new(),
        };

        let err = h.service.update(&caller("alice"), request).await.unwrap_err();

        assert!(matches!(err, Error::PermissionDenied));
        assert_eq!(h.store.current("keel", "guestbook").unwrap().spec.project, "p1");
    }

    #[tokio::test]
    async fn project_move_with_rights_in_both() {
        let grants = Grants::none()
            .allow("applications", "update", "p1/guestbook")
            .allow("applications", "update", "p2/guestbook")
            .allow("applications", "create", "p2/guestbook");
        let h = harness(grants);
        h.store.seed(app_in("keel", "guestbook", "p1"));
        let request = UpdateRequest {
            application: app_in("keel", "guestbook", "p2"),
            validate: Some(false),
            project: String::new(),
        };

        let updated = h.service.update(&caller("alice"), request).await.unwrap();

        assert_eq!(updated.spec.project, "p2");
    }

    #[tokio::test]
    async fn project_move_waits_for_operations_queued_under_the_old_project() {
        let h = harness(Grants::all());
        h.store.seed(app_in("keel", "guestbook", "p1"));
        let alice = caller("alice");
        let in_flight = h.service.locks.read("p1").await;

        let same_project = UpdateRequest {
            application: labelled(app_in("keel", "guestbook", "p1"), "team", "web"),
            validate: Some(false),
            project: String::new(),
        };
        tokio::time::timeout(Duration::from_secs(1), h.service.update(&alice, same_project))
            .await
            .unwrap()
            .unwrap();

        let move_request = UpdateRequest {
            application: app_in("keel", "guestbook", "p2"),
            validate: Some(false),
            project: String::new(),
        };
        let moved = h.service.update(&alice, move_request);
        tokio::pin!(moved);
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut moved)
            .await
            .is_err());
        assert_eq!(h.store.current("keel", "guestbook").unwrap().spec.project, "p1");

        drop(in_flight);
        let updated = tokio::time::timeout(Duration::from_secs(1), moved)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.spec.project, "p2");
    }

    #[tokio::test]
    async fn update_spec_keeps_metadata() {
        let h = harness(Grants::all());
        h.store
            .seed(labelled(app_in("keel", "guestbook", "default"), "team", "web"));
        let mut spec = app_in("keel", "guestbook", "default").spec;
        spec.source = Some(source("https://github.com/acme/guestbook", "v3"));

        let updated = h
            .service
            .update_spec(
                &caller("alice"),
                UpdateSpecRequest {
                    app: AppKey::new("guestbook"),
                    spec,
                    validate: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.get_source().target_revision, "v3");
        let stored = h.store.current("keel", "guestbook").unwrap();
        assert_eq!(stored.labels().get("team").map(String::as_str), Some("web"));
    }

    #[tokio::test]
    async fn merge_patch_adds_labels() {
        let h = harness(Grants::all());
        h.store.seed(app_in("keel", "guestbook", "default"));

        let patched = h
            .service
            .patch(
                &caller("alice"),
                &PatchRequest {
                    app: AppKey::new("guestbook"),
                    patch: r#"{"metadata":{"labels":{"team":"web"}}}"#.to_string(),
                    patch_type: "merge".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(patched.labels().get("team").map(String::as_str), Some("web"));
    }

    #[tokio::test]
    async fn json_patch_is_the_default() {
        let h = harness(Grants::all());
        h.store.seed(app_in("keel", "guestbook", "default"));

        let patched = h
            .service
            .patch(
                &caller("alice"),
                &PatchRequest {
                    app: AppKey::new("guestbook"),
                    patch: r#"[{"op":"replace","path":"/spec/source/targetRevision","value":"v3"}]"#
                        .to_string(),
                    patch_type: String::new(),
                },
            )
            .await
            .unwrap();

        assert_eq!(patched.spec.get_source().target_revision, "v3");
    }

    #[tokio::test]
    async fn unknown_patch_type_is_rejected() {
        let h = harness(Grants::all());
        h.store.seed(app_in("keel", "guestbook", "default"));

        let err = h
            .service
            .patch(
                &caller("alice"),
                &PatchRequest {
                    app: AppKey::new("guestbook"),
                    patch: "{}".to_string(),
                    patch_type: "xml".to_string(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::InvalidArgument(m) if m == "Patch type 'xml' is not supported"));
        assert_eq!(h.store.writes(), 0);
    }

    // ========================================================================
    // Story: delete
    // ========================================================================

    fn delete_request(cascade: Option<bool>, policy: Option<&str>) -> DeleteRequest {
        DeleteRequest {
            app: AppKey::new("guestbook"),
            cascade,
            propagation_policy: policy.map(str::to_string),
        }
    }

    #[rstest]
    #[case::default_cascade(None, None, false, 1)]
    #[case::finalizer_already_set(None, None, true, 0)]
    #[case::foreground_replaces_finalizer(Some(true), Some("Foreground"), true, 1)]
    #[case::non_cascading_removes_finalizer(Some(false), None, true, 1)]
    #[case::non_cascading_without_finalizer(Some(false), None, false, 0)]
    #[tokio::test]
    async fn delete_patches_finalizers_only_when_needed(
        #[case] cascade: Option<bool>,
        #[case] policy: Option<&str>,
        #[case] has_finalizer: bool,
        #[case] patches: usize,
    ) {
        let h = harness(Grants::all());
        let mut app = app_in("keel", "guestbook", "default");
        if has_finalizer {
            app.set_cascaded_deletion(RESOURCES_FINALIZER);
        }
        h.store.seed(app);

        h.service
            .delete(&caller("alice"), &delete_request(cascade, policy))
            .await
            .unwrap();

        assert_eq!(h.store.writes(), patches);
        assert!(h.store.current("keel", "guestbook").is_none());
    }

    #[rstest]
    #[case::policy_without_cascade(Some(false), Some("foreground"), "cannot set propagation policy")]
    #[case::unknown_policy(None, Some("sideways"), "invalid propagation policy: sideways")]
    #[tokio::test]
    async fn invalid_delete_options_keep_the_application(
        #[case] cascade: Option<bool>,
        #[case] policy: Option<&str>,
        #[case] message: &str,
    ) {
        let h = harness(Grants::all());
        h.store.seed(app_in("keel", "guestbook", "default"));

        let err = h
            .service
            .delete(&caller("alice"), &delete_request(cascade, policy))
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::InvalidArgument(m) if m.contains(message)), "{err:?}");
        assert!(h.store.current("keel", "guestbook").is_some());
    }

    #[tokio::test]
    async fn delete_needs_delete_rights() {
        let h = harness(Grants::none().allow("applications", "get", "default/guestbook"));
        h.store.seed(app_in("keel", "guestbook", "default"));

        let err = h
            .service
            .delete(&caller("alice"), &delete_request(None, None))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PermissionDenied));
        assert!(h.store.current("keel", "guestbook").is_some());
    }

    // ========================================================================
    // Story: list and get
    // ========================================================================

    #[tokio::test]
    async fn list_is_sorted_and_filtered_by_access() {
        let h = harness(
            Grants::none()
                .allow("applications", "get", "default/alpha")
                .allow("applications", "get", "default/beta")
                .allow("applications", "get", "p1/gamma"),
        );
        h.store.seed(app_in("keel", "beta", "default"));
        h.store.seed(app_in("keel", "hidden", "default"));
        h.store.seed(app_in("keel", "gamma", "p1"));
        h.store.seed(app_in("keel", "alpha", "default"));

        let list = h
            .service
            .list(&caller("alice"), &ApplicationQuery::default())
            .await
            .unwrap();

        let names: Vec<&str> = list.items.iter().map(Application::name).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
        assert_eq!(list.resource_version, "4");
    }

    #[tokio::test]
    async fn list_filters_by_project_repo_selector_and_namespace() {
        let h = harness(Grants::all());
        h.store
            .seed(labelled(app_in("keel", "alpha", "default"), "team", "web"));
        h.store.seed(app_in("keel", "beta", "p1"));
        let mut other_repo = app_in("keel", "gamma", "p1");
        other_repo.spec.source = Some(source("https://github.com/acme/other", "main"));
        h.store.seed(other_repo);
        h.store.seed(app_in("elsewhere", "delta", "default"));
        let alice = caller("alice");
        let names = |list: ApplicationList| -> Vec<String> {
            list.items.iter().map(|a| a.name().to_string()).collect()
        };

        let all = h.service.list(&alice, &ApplicationQuery::default()).await.unwrap();
        assert_eq!(names(all), vec!["alpha", "beta", "gamma"]);

        let by_project = ApplicationQuery {
            projects: vec!["p1".to_string()],
            ..Default::default()
        };
        assert_eq!(names(h.service.list(&alice, &by_project).await.unwrap()), vec!["beta", "gamma"]);

        let by_repo = ApplicationQuery {
            repo: "https://github.com/acme/other".to_string(),
            ..Default::default()
        };
        assert_eq!(names(h.service.list(&alice, &by_repo).await.unwrap()), vec!["gamma"]);

        let by_selector = ApplicationQuery {
            selector: "team=web".to_string(),
            ..Default::default()
        };
        assert_eq!(names(h.service.list(&alice, &by_selector).await.unwrap()), vec!["alpha"]);
    }

    #[tokio::test]
    async fn get_rejects_multiple_projects() {
        let h = harness(Grants::all());
        let query = ApplicationQuery {
            name: Some("guestbook".to_string()),
            projects: vec!["p1".to_string(), "p2".to_string()],
            ..Default::default()
        };

        let err = h
            .service
            .get(&caller("alice"), &query, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn get_with_refresh_waits_for_the_refreshed_copy() {
        let h = harness(Grants::all());
        let seeded = h.store.seed(app_in("keel", "guestbook", "default"));
        let query = ApplicationQuery {
            name: Some("guestbook".to_string()),
            refresh: Some("normal".to_string()),
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let alice = caller("alice");
        let (got, _) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(h.service.get(&alice, &query, &cancel), async {
                let requested = refresh_requested(&h, "guestbook").await;
                complete_refresh(&h, requested);
            })
        })
        .await
        .unwrap();
        let got = got.unwrap();

        assert!(got.refresh_requested().is_none());
        assert!(got.version_number() > seeded.version_number());
    }

    #[tokio::test]
    async fn hard_refresh_survives_a_failed_cache_invalidation() {
        let mut setup = Setup::new(Grants::all());
        setup
            .manifests
            .expect_refresh_details()
            .times(1)
            .returning(|_, _, _| Err(Error::upstream("repo server", "unavailable")));
        let h = setup.build();
        h.store.seed(app_in("keel", "guestbook", "default"));
        let query = ApplicationQuery {
            name: Some("guestbook".to_string()),
            refresh: Some("hard".to_string()),
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let alice = caller("alice");
        let (got, _) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(h.service.get(&alice, &query, &cancel), async {
                let requested = refresh_requested(&h, "guestbook").await;
                assert_eq!(requested.refresh_requested(), Some(RefreshType::Hard));
                complete_refresh(&h, requested);
            })
        })
        .await
        .unwrap();

        assert!(got.is_ok());
    }

    #[tokio::test]
    async fn cancelled_refresh_is_a_deadline_error() {
        let h = harness(Grants::all());
        h.store.seed(app_in("keel", "guestbook", "default"));
        let query = ApplicationQuery {
            name: Some("guestbook".to_string()),
            refresh: Some("normal".to_string()),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .service
            .get(&caller("alice"), &query, &cancel)
            .await
            .unwrap_err();

        assert!(
            matches!(&err, Error::FailedPrecondition(m) if m == "application refresh deadline exceeded")
        );
    }

    // ========================================================================
    // Story: controller state
    // ========================================================================

    #[tokio::test]
    async fn resource_tree_comes_from_the_state_cache() {
        let h = harness(Grants::all());
        let app = h.store.seed(app_in("keel", "guestbook", "default"));
        h.state.set_tree(
            &app.instance_name("keel"),
            tree_with(vec![node("apps", "Deployment", "web", "d1")]),
        );

        let tree = h
            .service
            .resource_tree(&caller("alice"), &AppKey::new("guestbook"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tree.nodes.len(), 1);
    }

    #[tokio::test]
    async fn comparison_error_explains_a_missing_tree() {
        let h = harness(Grants::all());
        let mut app = app_in("keel", "guestbook", "default");
        app.status.conditions = vec![ApplicationCondition {
            type_: CONDITION_COMPARISON_ERROR.to_string(),
            message: "repository not accessible".to_string(),
        }];
        h.store.seed(app);

        let err = h
            .service
            .resource_tree(&caller("alice"), &AppKey::new("guestbook"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(
            matches!(&err, Error::FailedPrecondition(m) if m == "ComparisonError: repository not accessible"),
            "{err:?}"
        );
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn missing_tree_triggers_one_refresh() {
        let h = harness(Grants::all());
        let app = h.store.seed(app_in("keel", "guestbook", "default"));
        let instance = app.instance_name("keel");
        let cancel = CancellationToken::new();

        let alice = caller("alice");
        let key = AppKey::new("guestbook");
        let (tree, _) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                h.service.resource_tree(&alice, &key, &cancel),
                async {
                    let requested = refresh_requested(&h, "guestbook").await;
                    h.state
                        .set_tree(&instance, tree_with(vec![node("", "Service", "web", "s1")]));
                    complete_refresh(&h, requested);
                }
            )
        })
        .await
        .unwrap();

        assert_eq!(tree.unwrap().nodes[0].resource_ref.kind, "Service");
    }

    #[tokio::test]
    async fn managed_resources_are_filtered() {
        let h = harness(Grants::all());
        let app = h.store.seed(app_in("keel", "guestbook", "default"));
        let diff = |kind: &str, name: &str| ResourceDiff {
            kind: kind.to_string(),
            namespace: "guestbook".to_string(),
            name: name.to_string(),
            ..Default::default()
        };
        h.state.set_managed_resources(
            &app.instance_name("keel"),
            vec![diff("Service", "web"), diff("ConfigMap", "settings")],
        );

        let diffs = h
            .service
            .managed_resources(
                &caller("alice"),
                &ResourcesQuery {
                    app: AppKey::new("guestbook"),
                    kind: "Service".to_string(),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(diffs, vec![diff("Service", "web")]);
    }

    // ========================================================================
    // Story: live resources and actions
    // ========================================================================

    #[tokio::test]
    async fn live_secret_is_masked() {
        let mut setup = Setup::new(Grants::all());
        setup.downstream.expect_get().returning(|_, _| {
            Ok(serde_json::from_value::<DynamicObject>(json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": { "name": "creds", "namespace": "guestbook" },
                "data": { "password": "aHVudGVyMg==" }
            }))
            .unwrap())
        });
        let h = setup.build();
        let app = h.store.seed(app_in("keel", "guestbook", "default"));
        h.state
            .set_tree(&app.instance_name("keel"), tree_with(vec![node("", "Secret", "creds", "u1")]));

        let response = h
            .service
            .get_resource(
                &caller("alice"),
                &ResourceRequest {
                    app: AppKey::new("guestbook"),
                    resource: ResourceKey {
                        namespace: "guestbook".to_string(),
                        resource_name: "creds".to_string(),
                        kind: "Secret".to_string(),
                        ..Default::default()
                    },
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(response.manifest.contains(SECRET_MASK));
        assert!(!response.manifest.contains("aHVudGVyMg=="));
    }

    #[tokio::test]
    async fn resource_outside_the_tree_is_rejected() {
        let h = harness(Grants::all());
        let app = h.store.seed(app_in("keel", "guestbook", "default"));
        h.state.set_tree(&app.instance_name("keel"), tree_with(vec![]));

        let err = h
            .service
            .delete_resource(
                &caller("alice"),
                &ResourceDeleteRequest {
                    app: AppKey::new("guestbook"),
                    resource: ResourceKey {
                        namespace: "kube-system".to_string(),
                        resource_name: "coredns".to_string(),
                        group: "apps".to_string(),
                        kind: "Deployment".to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::InvalidArgument(m) if m.contains("not found as part of application guestbook")));
    }

    fn self_key() -> ResourceKey {
        ResourceKey {
            namespace: "keel".to_string(),
            resource_name: "guestbook".to_string(),
            group: keel_common::KEEL_GROUP.to_string(),
            kind: keel_common::crd::APPLICATION_KIND.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn actions_can_target_the_application_itself() {
        let mut setup = Setup::new(Grants::all());
        setup.scripts.expect_discover().returning(|live| {
            assert_eq!(live.metadata.name.as_deref(), Some("guestbook"));
            Ok(vec![ResourceActionDefinition {
                name: "refresh".to_string(),
                ..Default::default()
            }])
        });
        let h = setup.build();
        h.store.seed(app_in("keel", "guestbook", "default"));

        let listed = h
            .service
            .list_resource_actions(
                &caller("alice"),
                &ResourceRequest {
                    app: AppKey::new("guestbook"),
                    resource: self_key(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(listed[0].name, "refresh");
    }

    #[tokio::test]
    async fn running_an_action_needs_the_action_right() {
        let mut setup = Setup::new(Grants::none().allow("applications", "get", "default/guestbook"));
        setup.scripts.expect_discover().never();
        let h = setup.build();
        h.store.seed(app_in("keel", "guestbook", "default"));

        let err = h
            .service
            .run_resource_action(
                &caller("alice"),
                &ResourceActionRunRequest {
                    app: AppKey::new("guestbook"),
                    resource: self_key(),
                    action: "refresh".to_string(),
                    params: vec![],
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PermissionDenied));
    }

    #[tokio::test]
    async fn pod_logs_need_log_rights() {
        let h = harness(Grants::none().allow("applications", "get", "default/guestbook"));
        h.store.seed(app_in("keel", "guestbook", "default"));

        let err = h
            .service
            .pod_logs(
                &caller("alice"),
                &PodLogsQuery {
                    app: AppKey::new("guestbook"),
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PermissionDenied));
    }

    #[tokio::test]
    async fn pod_logs_without_pods_end_immediately() {
        let h = harness(
            Grants::none()
                .allow("applications", "get", "default/guestbook")
                .allow("logs", "get", "default/guestbook"),
        );
        let app = h.store.seed(app_in("keel", "guestbook", "default"));
        h.state.set_tree(&app.instance_name("keel"), tree_with(vec![]));

        let mut stream = h
            .service
            .pod_logs(
                &caller("alice"),
                &PodLogsQuery {
                    app: AppKey::new("guestbook"),
                    namespace: "guestbook".to_string(),
                    kind: "Deployment".to_string(),
                    group: "apps".to_string(),
                    resource_name: "web".to_string(),
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(stream.next().await.is_none());
    }

    // ========================================================================
    // Story: operations
    // ========================================================================

    #[tokio::test]
    async fn out_of_range_source_position_writes_nothing() {
        let h = harness(Grants::all());
        h.store.seed(app_in("keel", "guestbook", "default"));

        let err = h
            .service
            .sync(
                &caller("alice"),
                &SyncRequest {
                    app: AppKey::new("guestbook"),
                    source_positions: vec![3],
                    revisions: vec!["v2".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn sync_queues_an_operation() {
        let h = harness(Grants::all());
        h.store.seed(app_in("keel", "guestbook", "default"));

        let updated = h
            .service
            .sync(
                &caller("alice"),
                &SyncRequest {
                    app: AppKey::new("guestbook"),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.operation.unwrap().sync.unwrap().revision, "sha-of-main");
    }

    #[tokio::test]
    async fn rollback_to_legacy_history_is_refused() {
        let h = harness(Grants::all());
        let mut app = app_in("keel", "guestbook", "default");
        app.status.history = vec![RevisionHistory {
            id: 1,
            revision: "abc".to_string(),
            ..Default::default()
        }];
        h.store.seed(app);

        let err = h
            .service
            .rollback(
                &caller("alice"),
                &RollbackRequest {
                    app: AppKey::new("guestbook"),
                    id: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::FailedPrecondition(_)));
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn terminate_without_operation_is_invalid() {
        let h = harness(Grants::all());
        h.store.seed(app_in("keel", "guestbook", "default"));

        let err = h
            .service
            .terminate_operation(&caller("alice"), &AppKey::new("guestbook"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn sync_windows_without_windows_allow_sync() {
        let h = harness(Grants::all());
        h.store.seed(app_in("keel", "guestbook", "default"));

        let windows = h
            .service
            .get_sync_windows(&caller("alice"), &AppKey::new("guestbook"))
            .await
            .unwrap();

        assert!(windows.can_sync);
        assert!(windows.assigned_windows.is_empty());
    }

    // ========================================================================
    // Story: repository views
    // ========================================================================

    fn multi_source(mut app: Application) -> Application {
        app.spec.source = None;
        app.spec.sources = vec![
            source("https://github.com/acme/one", "main"),
            source("https://github.com/acme/two", "v1.0.0"),
        ];
        app
    }

    #[rstest]
    #[case::single_source_second_index(false, Some(1), "there is only 1 source")]
    #[case::multi_source_third_index(true, Some(2), "there are only 2 sources")]
    #[case::negative_index(true, Some(-1), "source index -1 not found")]
    fn out_of_range_source_index(
        #[case] multi: bool,
        #[case] index: Option<i32>,
        #[case] message: &str,
    ) {
        let app = app_in("keel", "guestbook", "default");
        let app = if multi { multi_source(app) } else { app };

        let err = source_at(&app, index, None).unwrap_err();

        assert!(matches!(&err, Error::InvalidArgument(m) if m.contains(message)), "{err:?}");
    }

    #[test]
    fn version_lookup_uses_history() {
        let mut app = app_in("keel", "guestbook", "default");
        assert!(matches!(
            source_at(&app, None, Some(3)),
            Err(Error::InvalidArgument(m)) if m == "version ID 3 not found because the app has no history"
        ));

        app.status.history = vec![RevisionHistory {
            id: 1,
            source: Some(source("https://github.com/acme/legacy", "v0.1")),
            ..Default::default()
        }];
        assert!(matches!(
            source_at(&app, None, Some(2)),
            Err(Error::InvalidArgument(m)) if m == "revision history not found for version ID 2"
        ));
        assert_eq!(
            source_at(&app, None, Some(1)).unwrap().repo_url,
            "https://github.com/acme/legacy"
        );
    }

    #[tokio::test]
    async fn signature_keys_request_signature_checks() {
        let mut setup = Setup::new(Grants::all());
        setup
            .manifests
            .expect_revision_metadata()
            .withf(|_, _, check_signature| *check_signature)
            .times(1)
            .returning(|_, _, _| {
                Ok(RevisionMetadata {
                    author: "alice".to_string(),
                    ..Default::default()
                })
            });
        let h = setup.build();
        h.store.seed(app_in("keel", "guestbook", "signed"));

        let metadata = h
            .service
            .revision_metadata(
                &caller("alice"),
                &RevisionQuery {
                    app: AppKey::new("guestbook"),
                    revision: "abc".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(metadata.author, "alice");
    }

    #[tokio::test]
    async fn chart_details_need_a_chart_source() {
        let h = harness(Grants::all());
        h.store.seed(app_in("keel", "guestbook", "default"));

        let err = h
            .service
            .revision_chart_details(
                &caller("alice"),
                &RevisionQuery {
                    app: AppKey::new("guestbook"),
                    revision: "1.0.0".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::InvalidArgument(m) if m == "no chart found for application: guestbook"));
    }

    #[tokio::test]
    async fn rendered_secrets_are_masked() {
        let secret = r#"{"apiVersion":"v1","kind":"Secret","metadata":{"name":"creds"},"data":{"password":"aHVudGVyMg=="}}"#;
        let config_map = r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"settings"}}"#;
        let mut setup = Setup::new(Grants::all());
        setup
            .manifests
            .expect_generate_manifests()
            .withf(|request| request.revision == "v2")
            .times(1)
            .returning(move |_| {
                Ok(ManifestResponse {
                    manifests: vec![secret.to_string(), config_map.to_string()],
                    revision: "sha-of-v2".to_string(),
                    namespace: "guestbook".to_string(),
                })
            });
        let h = setup.build();
        h.store.seed(app_in("keel", "guestbook", "default"));

        let response = h
            .service
            .get_manifests(
                &caller("alice"),
                &ManifestQuery {
                    app: AppKey::new("guestbook"),
                    revision: Some("v2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(response.manifests[0].contains(SECRET_MASK));
        assert_eq!(response.manifests[1], config_map);
        assert_eq!(response.revision, "sha-of-v2");
    }

    #[tokio::test]
    async fn manifest_positions_are_checked_for_multi_source() {
        let mut setup = Setup::new(Grants::all());
        setup.manifests.expect_generate_manifests().never();
        let h = setup.build();
        h.store
            .seed(multi_source(app_in("keel", "guestbook", "default")));

        let err = h
            .service
            .get_manifests(
                &caller("alice"),
                &ManifestQuery {
                    app: AppKey::new("guestbook"),
                    source_positions: vec![3],
                    revisions: vec!["v2".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::InvalidArgument(m) if m == "source position is out of range"));
    }

    #[tokio::test]
    async fn manifests_need_an_application_name() {
        let h = harness(Grants::all());

        let err = h
            .service
            .get_manifests(&caller("alice"), &ManifestQuery::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
