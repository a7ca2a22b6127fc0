//! In-memory collaborators for unit tests

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use keel_common::crd::{
    AppProject, AppProjectSpec, Application, ApplicationDestination, ApplicationSource,
    ApplicationSpec,
};
use kube::api::ObjectMeta;

use crate::error::{Error, Result};
use crate::rbac::{PermissionOracle, UserIdentity};
use crate::store::{ApplicationCache, ApplicationStore, ProjectStore};

/// Versioned Application store that enforces optimistic concurrency.
///
/// Doubles as an always-current [`ApplicationCache`].
#[derive(Default)]
pub struct InMemoryStore {
    apps: Mutex<BTreeMap<(String, String), Application>>,
    version: AtomicU64,
    writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an Application as-is, assigning a fresh version
    pub fn seed(&self, mut app: Application) -> Application {
        app.metadata.resource_version = Some(self.next_version());
        self.apps
            .lock()
            .unwrap()
            .insert(key(&app), app.clone());
        app
    }

    /// Current stored copy
    pub fn current(&self, namespace: &str, name: &str) -> Option<Application> {
        self.apps
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Accepted writes since creation (seeding excluded)
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

fn key(app: &Application) -> (String, String) {
    (app.namespace().to_string(), app.name().to_string())
}

#[async_trait]
impl ApplicationStore for InMemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Application> {
        self.current(namespace, name)
            .ok_or_else(|| Error::app_not_found(name))
    }

    async fn create(&self, app: &Application) -> Result<Application> {
        let mut apps = self.apps.lock().unwrap();
        if apps.contains_key(&key(app)) {
            return Err(Error::AlreadyExists(app.name().to_string()));
        }
        let mut created = app.clone();
        created.metadata.resource_version = Some(self.next_version());
        apps.insert(key(app), created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn update(&self, app: &Application) -> Result<Application> {
        let mut apps = self.apps.lock().unwrap();
        let stored = apps
            .get(&key(app))
            .ok_or_else(|| Error::app_not_found(app.name()))?;
        if stored.resource_version() != app.resource_version() {
            return Err(Error::Conflict(format!(
                "the object has been modified; please apply your changes to the latest version ({})",
                app.name()
            )));
        }
        let mut updated = app.clone();
        updated.metadata.resource_version = Some(self.next_version());
        apps.insert(key(app), updated.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<Application> {
        let mut apps = self.apps.lock().unwrap();
        let k = (namespace.to_string(), name.to_string());
        let stored = apps.get(&k).ok_or_else(|| Error::app_not_found(name))?;
        let mut doc = serde_json::to_value(stored).map_err(|e| Error::internal(e.to_string()))?;
        json_patch::merge(&mut doc, patch);
        let mut patched: Application =
            serde_json::from_value(doc).map_err(|e| Error::invalid(e.to_string()))?;
        patched.metadata.resource_version = Some(self.next_version());
        apps.insert(k, patched.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(patched)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.apps
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::app_not_found(name))
    }
}

impl ApplicationCache for InMemoryStore {
    fn get(&self, namespace: &str, name: &str) -> Option<Application> {
        self.current(namespace, name)
    }

    fn list(&self) -> Vec<Application> {
        self.apps.lock().unwrap().values().cloned().collect()
    }

    fn last_synced_version(&self) -> String {
        self.version.load(Ordering::SeqCst).to_string()
    }
}

/// Fixed set of projects
#[derive(Default)]
pub struct StaticProjects(BTreeMap<String, AppProject>);

impl StaticProjects {
    pub fn new(projects: impl IntoIterator<Item = AppProject>) -> Self {
        Self(
            projects
                .into_iter()
                .map(|p| (p.name().to_string(), p))
                .collect(),
        )
    }
}

#[async_trait]
impl ProjectStore for StaticProjects {
    async fn get(&self, name: &str) -> Result<AppProject> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("appprojects.keel.dev \"{name}\" not found")))
    }
}

/// Oracle granting `action` on `object` from an explicit list, or everything
#[derive(Default)]
pub struct Grants {
    all: bool,
    granted: Mutex<HashSet<(String, String, String)>>,
}

impl Grants {
    pub fn all() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn allow(self, resource: &str, action: &str, object: &str) -> Self {
        self.granted.lock().unwrap().insert((
            resource.to_string(),
            action.to_string(),
            object.to_string(),
        ));
        self
    }

    pub fn revoke(&self, resource: &str, action: &str, object: &str) {
        self.granted.lock().unwrap().remove(&(
            resource.to_string(),
            action.to_string(),
            object.to_string(),
        ));
    }
}

#[async_trait]
impl PermissionOracle for Grants {
    async fn enforce(&self, _caller: &UserIdentity, resource: &str, action: &str, object: &str) -> bool {
        self.all
            || self.granted.lock().unwrap().contains(&(
                resource.to_string(),
                action.to_string(),
                object.to_string(),
            ))
    }
}

pub fn caller(name: &str) -> UserIdentity {
    UserIdentity::new(name, vec![])
}

pub fn source(repo_url: &str, target_revision: &str) -> ApplicationSource {
    ApplicationSource {
        repo_url: repo_url.to_string(),
        path: Some("guestbook".to_string()),
        target_revision: target_revision.to_string(),
        ..Default::default()
    }
}

/// Single-source Application deploying to the local cluster
pub fn app_in(namespace: &str, name: &str, project: &str) -> Application {
    Application::new(
        namespace,
        name,
        ApplicationSpec {
            source: Some(source("https://github.com/acme/guestbook", "main")),
            destination: ApplicationDestination {
                server: Some(keel_common::IN_CLUSTER_SERVER.to_string()),
                namespace: Some("guestbook".to_string()),
                name: None,
            },
            project: project.to_string(),
            ..Default::default()
        },
    )
}

/// Project permitting any repository and destination
pub fn project(name: &str) -> AppProject {
    AppProject {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("keel".to_string()),
            ..Default::default()
        },
        spec: AppProjectSpec {
            source_repos: vec!["*".to_string()],
            destinations: vec![ApplicationDestination {
                server: Some("*".to_string()),
                namespace: Some("*".to_string()),
                name: Some("*".to_string()),
            }],
            ..Default::default()
        },
    }
}
