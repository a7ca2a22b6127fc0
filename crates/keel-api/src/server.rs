//! Kube-backed wiring of the ApplicationService
//!
//! A reflector over Applications fills the read cache; every event it
//! delivers is also published on the NotificationBus so watchers and
//! refresh waiters see exactly what the cache sees.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{Stream, StreamExt, TryStreamExt};
use keel_common::crd::Application;
use kube::runtime::reflector;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::KubeAuditSink;
use crate::broadcast::{ApplicationEvent, EventType, NotificationBus};
use crate::cluster::{KubeClusterStore, KubeDownstreamClient};
use crate::config::ServerConfig;
use crate::rbac::PermissionOracle;
use crate::repo::ManifestService;
use crate::script::ScriptEngine;
use crate::service::{ApplicationService, Collaborators};
use crate::state_cache::AppStateCache;
use crate::store::{KubeApplicationStore, KubeProjectStore, ReflectorCache};

/// Collaborators that live outside the Kubernetes API
#[derive(Clone)]
pub struct Backends {
    /// RBAC decisions
    pub oracle: Arc<dyn PermissionOracle>,
    /// Repository server
    pub manifests: Arc<dyn ManifestService>,
    /// Resource action scripts
    pub scripts: Arc<dyn ScriptEngine>,
    /// Controller state
    pub state: Arc<dyn AppStateCache>,
}

/// A running ApplicationService and the handle that stops its cache feed
pub struct ApplicationServer {
    /// The operation surface
    pub service: ApplicationService,
    /// Cancel to stop the Application reflector
    pub shutdown: CancellationToken,
}

impl ApplicationServer {
    /// Build the kube-backed stores and start the Application reflector.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(client: Client, config: ServerConfig, backends: Backends) -> Self {
        let api: Api<Application> = if config.application_namespaces.is_empty() {
            Api::namespaced(client.clone(), &config.namespace)
        } else {
            Api::all(client.clone())
        };
        let (reader, writer) = reflector::store();
        let cache = ReflectorCache::new(reader);
        let bus = NotificationBus::new(config.watch_buffer_size);

        let events = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer);
        let shutdown = CancellationToken::new();
        tokio::spawn(feed(events, cache.clone(), bus.clone(), shutdown.clone()));

        let deps = Collaborators {
            store: Arc::new(KubeApplicationStore::new(client.clone())),
            cache: Arc::new(cache),
            projects: Arc::new(KubeProjectStore::new(client.clone(), &config.namespace)),
            oracle: backends.oracle,
            clusters: Arc::new(KubeClusterStore::new(client.clone(), &config.namespace)),
            downstream: Arc::new(KubeDownstreamClient::new(client.clone())),
            manifests: backends.manifests,
            scripts: backends.scripts,
            state: backends.state,
            audit: Arc::new(KubeAuditSink::new(client, &config.controller_name)),
        };
        info!(
            namespace = %config.namespace,
            application_namespaces = ?config.application_namespaces,
            "starting application server"
        );

        Self {
            service: ApplicationService::new(config, deps, bus),
            shutdown,
        }
    }
}

type Key = (String, String);

fn key_of(app: &Application) -> Key {
    (app.namespace().to_string(), app.name().to_string())
}

/// Tracks which Applications watchers have been told about
#[derive(Default)]
struct FeedState {
    known: HashSet<Key>,
    relist: Option<Relist>,
}

/// Cache contents when a relist began, and the keys relisted since
struct Relist {
    previous: Vec<Arc<Application>>,
    seen: HashSet<Key>,
}

impl FeedState {
    fn handle(&mut self, event: Event<Application>, cache: &ReflectorCache, bus: &NotificationBus) {
        match event {
            // The store still holds the pre-relist state until InitDone
            Event::Init => {
                self.relist = Some(Relist {
                    previous: cache.snapshot(),
                    seen: HashSet::new(),
                })
            }
            Event::InitApply(app) => {
                if let Some(relist) = self.relist.as_mut() {
                    relist.seen.insert(key_of(&app));
                }
                self.apply(app, cache, bus);
            }
            Event::InitDone => {
                // Anything not seen during the relist was deleted while disconnected
                let Some(relist) = self.relist.take() else {
                    return;
                };
                for app in relist.previous {
                    let key = key_of(&app);
                    if !relist.seen.contains(&key) && self.known.remove(&key) {
                        bus.publish(ApplicationEvent::new(EventType::Deleted, (*app).clone()));
                    }
                }
            }
            Event::Apply(app) => self.apply(app, cache, bus),
            Event::Delete(app) => {
                self.known.remove(&key_of(&app));
                bus.publish(ApplicationEvent::new(EventType::Deleted, app));
            }
        }
    }

    fn apply(&mut self, app: Application, cache: &ReflectorCache, bus: &NotificationBus) {
        cache.observe(&app);
        let type_ = if self.known.insert(key_of(&app)) {
            EventType::Added
        } else {
            EventType::Modified
        };
        bus.publish(ApplicationEvent::new(type_, app));
    }
}

/// Drive the reflector stream until it ends or `shutdown` fires
async fn feed<S>(events: S, cache: ReflectorCache, bus: NotificationBus, shutdown: CancellationToken)
where
    S: Stream<Item = Result<Event<Application>, watcher::Error>> + Send,
{
    let mut events = events.boxed();
    let mut state = FeedState::default();

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = events.try_next() => next,
        };
        match next {
            Ok(Some(event)) => state.handle(event, &cache, &bus),
            Ok(None) => break,
            // Backoff is applied by the stream; errors are transient
            Err(e) => warn!(error = %e, "application watch error"),
        }
    }
    debug!("application feed stopped");
}
