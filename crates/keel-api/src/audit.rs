//! Audit trail for user-initiated changes
//!
//! Every mutation made through the API is recorded as a Kubernetes Event on
//! the Application (and, for resource-level changes, on the live resource),
//! visible via `kubectl describe` and `kubectl get events`.
//!
//! Recording is **fire-and-forget**: failures are logged as warnings and never
//! propagate. A failed audit write must never fail the user's request.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use keel_common::crd::Application;
use keel_common::kube_utils::api_version_of;
use keel_common::resource_tree::ResourceRef;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Initiator recorded when the caller has no username
pub const UNKNOWN_USER: &str = "Unknown user";

/// Sink for audit events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record `"<initiator> <message>"` on the referenced object
    async fn record(&self, object: &ObjectReference, reason: &str, message: &str, initiator: &str);
}

/// Production sink wrapping `kube::runtime::events::Recorder`
pub struct KubeAuditSink {
    recorder: Recorder,
}

impl KubeAuditSink {
    /// Create a sink reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl AuditSink for KubeAuditSink {
    async fn record(&self, object: &ObjectReference, reason: &str, message: &str, initiator: &str) {
        let initiator = if initiator.is_empty() {
            UNKNOWN_USER
        } else {
            initiator
        };
        let event = Event {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note: Some(format!("{initiator} {message}")),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, object).await {
            warn!(reason, error = %e, "Failed to record audit event");
        }
    }
}

/// Sink that discards everything
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(
        &self,
        _object: &ObjectReference,
        _reason: &str,
        _message: &str,
        _initiator: &str,
    ) {
    }
}

/// Reference to an Application for audit events
pub fn app_reference(app: &Application) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!(
            "{}/{}",
            keel_common::KEEL_GROUP,
            keel_common::KEEL_VERSION
        )),
        kind: Some(keel_common::crd::APPLICATION_KIND.to_string()),
        name: app.metadata.name.clone(),
        namespace: app.metadata.namespace.clone(),
        uid: app.metadata.uid.clone(),
        resource_version: app.metadata.resource_version.clone(),
        ..Default::default()
    }
}

/// Reference to a live resource for audit events
pub fn resource_reference(resource: &ResourceRef) -> ObjectReference {
    ObjectReference {
        api_version: Some(api_version_of(&resource.group, &resource.version)),
        kind: Some(resource.kind.clone()),
        name: Some(resource.name.clone()),
        namespace: (!resource.namespace.is_empty()).then(|| resource.namespace.clone()),
        uid: (!resource.uid.is_empty()).then(|| resource.uid.clone()),
        ..Default::default()
    }
}

/// Well-known audit reasons.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Application created
    pub const RESOURCE_CREATED: &str = "ResourceCreated";
    /// Application or live resource modified
    pub const RESOURCE_UPDATED: &str = "ResourceUpdated";
    /// Application or live resource deleted
    pub const RESOURCE_DELETED: &str = "ResourceDeleted";
    /// Sync or rollback queued
    pub const OPERATION_STARTED: &str = "OperationStarted";
    /// Running operation asked to terminate
    pub const OPERATION_TERMINATED: &str = "OperationTerminated";
    /// Resource action executed
    pub const RESOURCE_ACTION_RAN: &str = "ResourceActionRan";
}
