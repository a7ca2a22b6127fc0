//! Resource definitions served and consumed by Keel
//!
//! `Application` is written by hand (it carries a top-level `operation`
//! field); `AppProject` is a regular `CustomResource`.

mod application;
mod project;

pub use application::{
    rbac_name, Application, ApplicationCondition, ApplicationDestination, ApplicationSource,
    ApplicationSpec, ApplicationStatus, Backoff, HealthStatus, HealthStatusCode, Info, Operation,
    OperationInitiator, OperationPhase, OperationState, RefreshType, ResourceStatus,
    RetryStrategy, RevisionHistory, SyncOperation, SyncOperationResource, SyncPolicy,
    SyncPolicyAutomated, SyncStatus, SyncStrategy, SyncStrategyApply, SyncStrategyHook,
    APPLICATION_KIND, BACKGROUND_FINALIZER, CONDITION_COMPARISON_ERROR,
    CONDITION_INVALID_SPEC_ERROR, FOREGROUND_FINALIZER, RESOURCES_FINALIZER,
};
pub use project::{AppProject, AppProjectSpec, GroupKind, SignatureKey};
