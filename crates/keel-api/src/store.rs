//! Store seams: the versioned Application store, its local cache, and projects
//!
//! Writes go to the API server through [`ApplicationStore`] and carry the
//! object's version token; a stale token is rejected with
//! [`Error::Conflict`]. Reads on hot paths go through [`ApplicationCache`],
//! a local mirror that lags the store by an unspecified amount.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use keel_common::crd::{AppProject, Application};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client};

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Field manager recorded on server-side writes
pub const FIELD_MANAGER: &str = "keel-api-server";

/// Versioned Application store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    /// Read the latest version of an Application
    async fn get(&self, namespace: &str, name: &str) -> Result<Application>;

    /// Create an Application; fails with `AlreadyExists` if it exists
    async fn create(&self, app: &Application) -> Result<Application>;

    /// Replace an Application; fails with `Conflict` on a stale version
    async fn update(&self, app: &Application) -> Result<Application>;

    /// Apply a JSON merge patch
    async fn patch(&self, namespace: &str, name: &str, patch: &serde_json::Value)
        -> Result<Application>;

    /// Delete an Application
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Local, eventually consistent mirror of the Application store
#[cfg_attr(test, automock)]
pub trait ApplicationCache: Send + Sync {
    /// Cached copy of an Application
    fn get(&self, namespace: &str, name: &str) -> Option<Application>;

    /// Every cached Application
    fn list(&self) -> Vec<Application>;

    /// Highest resource version the cache has observed
    fn last_synced_version(&self) -> String;
}

/// Project lookup
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Resolve a project by name; `NotFound` when it does not exist
    async fn get(&self, name: &str) -> Result<AppProject>;
}

/// [`ApplicationStore`] backed by the Kubernetes API
pub struct KubeApplicationStore {
    client: Client,
}

impl KubeApplicationStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Application> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ApplicationStore for KubeApplicationStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Application> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn create(&self, app: &Application) -> Result<Application> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self.api(app.namespace()).create(&pp, app).await?)
    }

    async fn update(&self, app: &Application) -> Result<Application> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self
            .api(app.namespace())
            .replace(app.name(), &pp, app)
            .await?)
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<Application> {
        let pp = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self
            .api(namespace)
            .patch(name, &pp, &Patch::Merge(patch))
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}

/// [`ApplicationCache`] over a kube-runtime reflector store
#[derive(Clone)]
pub struct ReflectorCache {
    store: Store<Application>,
    last_synced: Arc<AtomicU64>,
}

impl ReflectorCache {
    /// Wrap a reflector store
    pub fn new(store: Store<Application>) -> Self {
        Self {
            store,
            last_synced: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared handles to every cached Application
    pub fn snapshot(&self) -> Vec<Arc<Application>> {
        self.store.state()
    }

    /// Record that the feed delivered `app`
    pub fn observe(&self, app: &Application) {
        if let Some(version) = app.version_number() {
            self.last_synced.fetch_max(version, Ordering::AcqRel);
        }
    }
}

impl ApplicationCache for ReflectorCache {
    fn get(&self, namespace: &str, name: &str) -> Option<Application> {
        self.store
            .get(&ObjectRef::new(name).within(namespace))
            .map(|app| (*app).clone())
    }

    fn list(&self) -> Vec<Application> {
        self.store
            .state()
            .iter()
            .map(|app| (**app).clone())
            .collect()
    }

    fn last_synced_version(&self) -> String {
        self.last_synced.load(Ordering::Acquire).to_string()
    }
}

/// [`ProjectStore`] backed by AppProject objects in the control namespace
pub struct KubeProjectStore {
    api: Api<AppProject>,
}

impl KubeProjectStore {
    /// Create a store reading projects from `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ProjectStore for KubeProjectStore {
    async fn get(&self, name: &str) -> Result<AppProject> {
        self.api.get(name).await.map_err(Error::from)
    }
}
