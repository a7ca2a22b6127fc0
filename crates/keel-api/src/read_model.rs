//! ReadModelSynchronizer: best-effort read-after-write over the local cache

use std::sync::Arc;
use std::time::Duration;

use keel_common::crd::Application;
use tokio::time::Instant;
use tracing::warn;

use crate::store::ApplicationCache;

/// How long a write waits for the cache to catch up
pub const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll interval while waiting
pub const CACHE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Pause taken when the written version cannot be compared
const UNPARSABLE_VERSION_PAUSE: Duration = Duration::from_millis(50);

/// Waits until the cache reflects a write
#[derive(Clone)]
pub struct ReadModelSynchronizer {
    cache: Arc<dyn ApplicationCache>,
    timeout: Duration,
    interval: Duration,
}

impl ReadModelSynchronizer {
    /// Create a synchronizer with the default deadline and poll interval
    pub fn new(cache: Arc<dyn ApplicationCache>) -> Self {
        Self {
            cache,
            timeout: CACHE_SYNC_TIMEOUT,
            interval: CACHE_POLL_INTERVAL,
        }
    }

    /// Override the deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Block until the cached copy of `app` is at least as new as `app`.
    ///
    /// Returns `true` when the cache caught up. A timeout is logged, not
    /// returned as an error.
    pub async fn wait_for(&self, app: &Application) -> bool {
        let Some(min_version) = app.version_number() else {
            warn!(
                application = %app.qualified_name(),
                resource_version = ?app.resource_version(),
                "waitSync failed: could not parse resource version"
            );
            tokio::time::sleep(UNPARSABLE_VERSION_PAUSE).await;
            return false;
        };

        let deadline = Instant::now() + self.timeout;
        loop {
            let current = self
                .cache
                .get(app.namespace(), app.name())
                .and_then(|cached| cached.version_number());
            if current.is_some_and(|v| v >= min_version) {
                return true;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.interval).await;
        }

        warn!(application = %app.qualified_name(), "waitSync failed: timed out");
        false
    }
}
