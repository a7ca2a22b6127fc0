//! Live Application streams built on the NotificationBus
//!
//! Two consumers: the watch stream (snapshot, then tail) and the blocking
//! refresh-and-wait used by `get` with a refresh request.

use std::collections::HashSet;
use std::sync::Arc;

use keel_common::crd::Application;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::access::AccessGate;
use crate::broadcast::{ApplicationEvent, EventType, NotificationBus, Subscription};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::rbac::{actions, UserIdentity};
use crate::request::ApplicationQuery;
use crate::selector::LabelSelector;
use crate::state_cache::{infer_resource_health, AppStateCache};
use crate::store::ApplicationCache;

/// Static part of a watch filter; authorization is checked separately per event
#[derive(Clone, Debug)]
struct WatchFilter {
    selector: LabelSelector,
    min_version: u64,
    name: Option<String>,
    namespace: String,
    projects: HashSet<String>,
}

impl WatchFilter {
    fn from_query(query: &ApplicationQuery, config: &ServerConfig) -> Result<Self> {
        Ok(Self {
            selector: LabelSelector::parse(&query.selector)?,
            min_version: query.resource_version.parse().unwrap_or(0),
            name: query.name.clone().filter(|n| !n.is_empty()),
            namespace: config.namespace_or_default(&query.app_namespace).to_string(),
            projects: query.projects.iter().cloned().collect(),
        })
    }

    fn matches(&self, app: &Application) -> bool {
        if !self.projects.is_empty() && !self.projects.contains(app.effective_project()) {
            return false;
        }
        if app.version_number().is_some_and(|v| v < self.min_version) {
            return false;
        }
        if let Some(name) = &self.name {
            if app.name() != name || app.namespace() != self.namespace {
                return false;
            }
        }
        self.selector.matches(&app.labels())
    }
}

/// Serves watch streams
#[derive(Clone)]
pub struct Watcher {
    cache: Arc<dyn ApplicationCache>,
    state: Arc<dyn AppStateCache>,
    bus: NotificationBus,
    gate: AccessGate,
    config: Arc<ServerConfig>,
}

impl Watcher {
    /// Create a watcher
    pub fn new(
        cache: Arc<dyn ApplicationCache>,
        state: Arc<dyn AppStateCache>,
        bus: NotificationBus,
        gate: AccessGate,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            cache,
            state,
            bus,
            gate,
            config,
        }
    }

    /// Stream Applications matching `query` that `caller` may read.
    ///
    /// Without a resource version, or for a single named Application, the
    /// current matches are sent first as `Added`, sorted by qualified name.
    /// The stream ends when `cancel` fires or the receiver is dropped.
    pub fn watch(
        &self,
        caller: UserIdentity,
        query: &ApplicationQuery,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<ApplicationEvent>> {
        let filter = WatchFilter::from_query(query, &self.config)?;

        // Subscribe before taking the snapshot so nothing falls in between
        let predicate_filter = filter.clone();
        let subscription = self.bus.subscribe(move |app| predicate_filter.matches(app));

        let snapshot = if query.resource_version.is_empty() || filter.name.is_some() {
            let mut apps: Vec<Application> = self
                .cache
                .list()
                .into_iter()
                .filter(|app| filter.matches(app))
                .collect();
            apps.sort_by_key(Application::qualified_name);
            apps
        } else {
            Vec::new()
        };

        let (tx, rx) = mpsc::channel(self.config.watch_buffer_size.max(1));
        let watcher = self.clone();
        tokio::spawn(async move {
            watcher.run(caller, snapshot, subscription, tx, cancel).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn run(
        &self,
        caller: UserIdentity,
        snapshot: Vec<Application>,
        mut subscription: Subscription,
        tx: mpsc::Sender<ApplicationEvent>,
        cancel: CancellationToken,
    ) {
        for app in snapshot {
            if !self
                .send_if_permitted(&caller, ApplicationEvent::new(EventType::Added, app), &tx)
                .await
            {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = subscription.recv() => match event {
                    Some(event) => {
                        if !self.send_if_permitted(&caller, event, &tx).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        subscription.unsubscribe();
        debug!(user = %caller.username, "watch stream closed");
    }

    // Returns false once the receiver is gone
    async fn send_if_permitted(
        &self,
        caller: &UserIdentity,
        mut event: ApplicationEvent,
        tx: &mpsc::Sender<ApplicationEvent>,
    ) -> bool {
        let app = &event.application;
        if !self.config.is_namespace_enabled(app.namespace()) {
            return true;
        }
        if self.gate.enforce_app(caller, actions::GET, app).await.is_err() {
            return true;
        }

        let instance = app.instance_name(&self.config.namespace);
        if let Ok(Some(tree)) = self.state.resource_tree(&instance).await {
            infer_resource_health(&mut event.application, &tree);
        }

        if tx.send(event).await.is_err() {
            warn!(user = %caller.username, "unable to send stream message, receiver is gone");
            return false;
        }
        true
    }
}

/// Block until the subscription delivers a refreshed copy newer than `baseline`.
///
/// Events still carrying the refresh annotation are skipped.
pub async fn wait_for_refresh(
    subscription: &mut Subscription,
    baseline: u64,
    cancel: &CancellationToken,
) -> Result<Application> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::precondition("application refresh deadline exceeded"));
            }
            event = subscription.recv() => {
                let Some(event) = event else {
                    return Err(Error::precondition("application refresh deadline exceeded"));
                };
                let app = event.application;
                let newer = app.version_number().is_some_and(|v| v > baseline);
                if newer && app.refresh_requested().is_none() {
                    return Ok(app);
                }
            }
        }
    }
}
