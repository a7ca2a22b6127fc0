//! Destination clusters and the client used to act on their live objects
//!
//! [`ClusterStore`] resolves an Application destination to a registered
//! cluster. [`DownstreamClient`] reads and mutates arbitrary objects in that
//! cluster by group/version/kind, with dry-run and status-subresource support.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::{Pod, Secret};
use keel_common::crd::ApplicationDestination;
use keel_common::kube_utils::{api_resource_for, build_api_resource, client_from_kubeconfig};
use keel_common::resource_tree::ResourceRef;
use keel_common::{CLUSTER_SECRET_LABEL, CLUSTER_SECRET_TYPE, IN_CLUSTER_NAME, IN_CLUSTER_SERVER};
use kube::api::{
    DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams, PostParams,
    PropagationPolicy as KubePropagationPolicy,
};
use kube::discovery::ApiResource;
use kube::{Api, Client};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};
use crate::store::FIELD_MANAGER;

/// Lines buffered per pod log stream before the reader waits
const LOG_LINE_BUFFER: usize = 256;

/// A registered destination cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    /// Display name
    pub name: String,
    /// API server URL
    pub server: String,
    /// Kubeconfig for reaching the cluster; `None` for the local cluster
    pub kubeconfig: Option<String>,
}

impl Cluster {
    /// The cluster this server runs in
    pub fn in_cluster() -> Self {
        Self {
            name: IN_CLUSTER_NAME.to_string(),
            server: IN_CLUSTER_SERVER.to_string(),
            kubeconfig: None,
        }
    }
}

/// Resolves Application destinations to clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Find the cluster a destination points at
    async fn resolve(&self, destination: &ApplicationDestination) -> Result<Cluster>;
}

/// Patch encodings accepted by [`DownstreamClient::patch`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchType {
    /// RFC 6902 JSON patch
    Json,
    /// RFC 7386 JSON merge patch
    Merge,
    /// Kubernetes strategic merge patch
    Strategic,
}

impl PatchType {
    /// Parse a patch content type
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "application/json-patch+json" | "json" => Some(Self::Json),
            "application/merge-patch+json" | "merge" => Some(Self::Merge),
            "application/strategic-merge-patch+json" | "strategic" => Some(Self::Strategic),
            _ => None,
        }
    }
}

/// How dependents of a deleted object are handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropagationPolicy {
    /// Leave dependents in place
    Orphan,
    /// Delete dependents asynchronously
    Background,
    /// Delete dependents before the owner
    Foreground,
}

/// Options for deleting a live object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Dependent handling
    pub propagation_policy: PropagationPolicy,
    /// Grace period override
    pub grace_period_seconds: Option<u32>,
}

/// Options for reading container logs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Container to read; the pod's only container when `None`
    pub container: Option<String>,
    /// Only lines newer than this many seconds
    pub since_seconds: Option<i64>,
    /// Only the last N lines
    pub tail_lines: Option<i64>,
    /// Keep the stream open for new lines
    pub follow: bool,
    /// Read the previous container instance
    pub previous: bool,
}

/// Client for live objects in destination clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DownstreamClient: Send + Sync {
    /// Read a live object
    async fn get(&self, cluster: &Cluster, target: &ResourceRef) -> Result<DynamicObject>;

    /// Create an object, optionally as a server-side dry run
    async fn create(
        &self,
        cluster: &Cluster,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject>;

    /// Patch a live object, or its status subresource when `status` is set
    async fn patch(
        &self,
        cluster: &Cluster,
        target: &ResourceRef,
        patch_type: PatchType,
        patch: &serde_json::Value,
        status: bool,
    ) -> Result<DynamicObject>;

    /// Delete a live object
    async fn delete(
        &self,
        cluster: &Cluster,
        target: &ResourceRef,
        options: &DeleteOptions,
    ) -> Result<()>;

    /// Stream a container's log lines, each prefixed with its RFC 3339 timestamp
    async fn pod_logs(
        &self,
        cluster: &Cluster,
        namespace: &str,
        pod: &str,
        options: &LogOptions,
    ) -> Result<BoxStream<'static, std::io::Result<String>>>;
}

/// [`ClusterStore`] reading cluster Secrets from the control namespace
pub struct KubeClusterStore {
    secrets: Api<Secret>,
}

impl KubeClusterStore {
    /// Create a store reading Secrets from `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            secrets: Api::namespaced(client, namespace),
        }
    }
}

fn secret_field(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn resolve(&self, destination: &ApplicationDestination) -> Result<Cluster> {
        let server = destination.server.as_deref().unwrap_or_default();
        let name = destination.name.as_deref().unwrap_or_default();

        if !server.is_empty() && !name.is_empty() {
            return Err(Error::invalid(format!(
                "application destination can't have both name and server defined: {name} {server}"
            )));
        }
        if server.is_empty() && name.is_empty() {
            return Err(Error::invalid(
                "application destination must have either name or server defined",
            ));
        }
        if server == IN_CLUSTER_SERVER || name == IN_CLUSTER_NAME {
            return Ok(Cluster::in_cluster());
        }

        let lp = ListParams::default()
            .labels(&format!("{CLUSTER_SECRET_LABEL}={CLUSTER_SECRET_TYPE}"));
        let secrets = self.secrets.list(&lp).await?;
        secrets
            .items
            .iter()
            .map(|s| Cluster {
                name: secret_field(s, "name").unwrap_or_default(),
                server: secret_field(s, "server").unwrap_or_default(),
                kubeconfig: secret_field(s, "config"),
            })
            .find(|c| {
                if name.is_empty() {
                    c.server == server
                } else {
                    c.name == name
                }
            })
            .ok_or_else(|| {
                if name.is_empty() {
                    Error::NotFound(format!("there are no clusters with this URL: {server}"))
                } else {
                    Error::NotFound(format!("there are no clusters with this name: {name}"))
                }
            })
    }
}

/// [`DownstreamClient`] using kube-rs dynamic objects
pub struct KubeDownstreamClient {
    local: Client,
    remotes: DashMap<String, Client>,
}

impl KubeDownstreamClient {
    /// Create a client; `local` serves the in-cluster destination
    pub fn new(local: Client) -> Self {
        Self {
            local,
            remotes: DashMap::new(),
        }
    }

    async fn client_for(&self, cluster: &Cluster) -> Result<Client> {
        let Some(kubeconfig) = cluster.kubeconfig.as_deref() else {
            return Ok(self.local.clone());
        };
        if let Some(client) = self.remotes.get(&cluster.server) {
            return Ok(client.clone());
        }
        debug!(cluster = %cluster.name, "Building client for destination cluster");
        let client = client_from_kubeconfig(kubeconfig)
            .await
            .map_err(|e| Error::upstream(format!("cluster {}", cluster.server), e))?;
        self.remotes.insert(cluster.server.clone(), client.clone());
        Ok(client)
    }

    async fn api(
        &self,
        cluster: &Cluster,
        ar: &ApiResource,
        namespace: &str,
    ) -> Result<Api<DynamicObject>> {
        let client = self.client_for(cluster).await?;
        Ok(if namespace.is_empty() {
            Api::all_with(client, ar)
        } else {
            Api::namespaced_with(client, namespace, ar)
        })
    }
}

fn target_resource(target: &ResourceRef) -> ApiResource {
    api_resource_for(&target.group, &target.version, &target.kind)
}

#[async_trait]
impl DownstreamClient for KubeDownstreamClient {
    async fn get(&self, cluster: &Cluster, target: &ResourceRef) -> Result<DynamicObject> {
        let api = self
            .api(cluster, &target_resource(target), &target.namespace)
            .await?;
        Ok(api.get(&target.name).await?)
    }

    async fn create(
        &self,
        cluster: &Cluster,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| Error::invalid("object is missing apiVersion and kind"))?;
        let ar = build_api_resource(&types.api_version, &types.kind);
        let namespace = object.metadata.namespace.as_deref().unwrap_or_default();
        let api = self.api(cluster, &ar, namespace).await?;
        let pp = PostParams {
            dry_run,
            field_manager: Some(FIELD_MANAGER.to_string()),
        };
        Ok(api.create(&pp, object).await?)
    }

    async fn patch(
        &self,
        cluster: &Cluster,
        target: &ResourceRef,
        patch_type: PatchType,
        patch: &serde_json::Value,
        status: bool,
    ) -> Result<DynamicObject> {
        let api = self
            .api(cluster, &target_resource(target), &target.namespace)
            .await?;
        let pp = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let patch = match patch_type {
            PatchType::Merge => Patch::Merge(patch.clone()),
            PatchType::Strategic => Patch::Strategic(patch.clone()),
            PatchType::Json => Patch::Json(
                serde_json::from_value::<json_patch::Patch>(patch.clone())
                    .map_err(|e| Error::invalid(format!("invalid JSON patch: {e}")))?,
            ),
        };
        let result = if status {
            api.patch_status(&target.name, &pp, &patch).await
        } else {
            api.patch(&target.name, &pp, &patch).await
        };
        Ok(result?)
    }

    async fn delete(
        &self,
        cluster: &Cluster,
        target: &ResourceRef,
        options: &DeleteOptions,
    ) -> Result<()> {
        let api = self
            .api(cluster, &target_resource(target), &target.namespace)
            .await?;
        let dp = DeleteParams {
            propagation_policy: Some(match options.propagation_policy {
                PropagationPolicy::Orphan => KubePropagationPolicy::Orphan,
                PropagationPolicy::Background => KubePropagationPolicy::Background,
                PropagationPolicy::Foreground => KubePropagationPolicy::Foreground,
            }),
            grace_period_seconds: options.grace_period_seconds,
            ..Default::default()
        };
        api.delete(&target.name, &dp).await?;
        Ok(())
    }

    async fn pod_logs(
        &self,
        cluster: &Cluster,
        namespace: &str,
        pod: &str,
        options: &LogOptions,
    ) -> Result<BoxStream<'static, std::io::Result<String>>> {
        let client = self.client_for(cluster).await?;
        let api: Api<Pod> = Api::namespaced(client, namespace);
        let lp = LogParams {
            container: options.container.clone(),
            follow: options.follow,
            previous: options.previous,
            since_seconds: options.since_seconds,
            tail_lines: options.tail_lines,
            timestamps: true,
            ..Default::default()
        };
        let pod = pod.to_string();
        let (tx, rx) = tokio::sync::mpsc::channel(LOG_LINE_BUFFER);

        // The log reader borrows the Api handle, so both live in the forwarding task.
        tokio::spawn(async move {
            let reader = match api.log_stream(&pod, &lp).await {
                Ok(reader) => reader,
                Err(e) => {
                    let _ = tx.send(Err(std::io::Error::other(e))).await;
                    return;
                }
            };
            let mut lines = Box::pin(reader.lines());
            while let Some(line) = lines.next().await {
                let failed = line.is_err();
                if tx.send(line).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}
