//! ConcurrencyMutator: compare-and-swap writes against the versioned store
//!
//! Every write reads the latest version, applies a delta, and writes it back
//! with the version token it read. A stale token is rejected by the store;
//! the delta is then re-applied to a fresh read, up to a fixed ceiling.

use std::sync::Arc;
use std::time::Duration;

use keel_common::crd::{Application, Operation, OperationPhase};
use keel_common::retry::{retry_on_conflict, RetryConfig, RetryError};
use tracing::warn;

use crate::audit::{app_reference, reasons, AuditSink};
use crate::error::{Error, Result};
use crate::rbac::UserIdentity;
use crate::read_model::ReadModelSynchronizer;
use crate::store::ApplicationStore;

/// Pause between conflicting terminate attempts
pub const TERMINATE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Attempts made by every conflict loop
pub const MAX_CONFLICT_ATTEMPTS: u32 = 10;

/// How labels and annotations of the desired state combine with the stored ones
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    /// Key-wise merge, desired values win
    Merge,
    /// Desired maps replace the stored ones
    Replace,
}

/// Applies deltas to Applications with bounded conflict retries
#[derive(Clone)]
pub struct ConcurrencyMutator {
    store: Arc<dyn ApplicationStore>,
    read_model: ReadModelSynchronizer,
    audit: Arc<dyn AuditSink>,
}

impl ConcurrencyMutator {
    /// Create a mutator
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        read_model: ReadModelSynchronizer,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            read_model,
            audit,
        }
    }

    /// Read-model synchronizer used after writes
    pub fn read_model(&self) -> &ReadModelSynchronizer {
        &self.read_model
    }

    /// Re-read, apply, write until the write is accepted.
    ///
    /// `first` is used for the first attempt when the caller already holds a
    /// copy. Errors returned by `apply` abort the loop unchanged.
    pub async fn compare_and_swap<F>(
        &self,
        namespace: &str,
        name: &str,
        first: Option<Application>,
        config: &RetryConfig,
        exhausted: &str,
        apply: F,
    ) -> Result<Application>
    where
        F: Fn(&mut Application) -> Result<()>,
    {
        let store = &self.store;
        let apply = &apply;
        let mut first = first;

        let result = retry_on_conflict(config, name, Error::is_conflict, move |attempt| {
            let seed = if attempt == 0 { first.take() } else { None };
            async move {
                let mut current = match seed {
                    Some(app) => app,
                    None => store.get(namespace, name).await?,
                };
                apply(&mut current)?;
                store.update(&current).await
            }
        })
        .await;

        match result {
            Ok(app) => Ok(app),
            Err(RetryError::Exhausted { .. }) => Err(Error::ConflictExhausted(exhausted.to_string())),
            Err(RetryError::Failed(e)) => Err(e),
        }
    }

    /// Write `desired`'s spec, labels, annotations and finalizers onto `current`
    pub async fn update(
        &self,
        caller: &UserIdentity,
        current: Application,
        desired: &Application,
        mode: MergeMode,
    ) -> Result<Application> {
        let namespace = current.namespace().to_string();
        let name = current.name().to_string();

        let updated = self
            .compare_and_swap(
                &namespace,
                &name,
                Some(current),
                &RetryConfig::conflicts(),
                "Failed to update application. Too many conflicts",
                |app| {
                    apply_desired(app, desired, mode);
                    Ok(())
                },
            )
            .await?;

        self.audit
            .record(
                &app_reference(&updated),
                reasons::RESOURCE_UPDATED,
                "updated application spec",
                &caller.username,
            )
            .await;
        self.read_model.wait_for(&updated).await;
        Ok(updated)
    }

    /// Queue an operation; fails if one is already queued
    pub async fn attach_operation(
        &self,
        namespace: &str,
        name: &str,
        operation: Operation,
    ) -> Result<Application> {
        if operation.sync.is_none() {
            return Err(Error::invalid("Operation unspecified"));
        }

        let updated = self
            .compare_and_swap(
                namespace,
                name,
                None,
                &RetryConfig::conflicts(),
                "Failed to set operation. Too many conflicts",
                |app| {
                    if app.operation.is_some() {
                        return Err(Error::precondition("another operation is already in progress"));
                    }
                    app.operation = Some(operation.clone());
                    app.status.operation_state = None;
                    Ok(())
                },
            )
            .await?;

        self.read_model.wait_for(&updated).await;
        Ok(updated)
    }

    /// Move the in-flight operation to the terminating phase
    pub async fn terminate(&self, caller: &UserIdentity, current: Application) -> Result<Application> {
        let namespace = current.namespace().to_string();
        let name = current.name().to_string();

        let updated = self
            .compare_and_swap(
                &namespace,
                &name,
                Some(current),
                &RetryConfig::fixed(MAX_CONFLICT_ATTEMPTS, TERMINATE_RETRY_DELAY),
                "Failed to terminate app. Too many conflicts",
                |app| {
                    let in_progress = app.operation.is_some();
                    match app.status.operation_state.as_mut() {
                        Some(state) if in_progress => {
                            state.phase = OperationPhase::Terminating;
                            Ok(())
                        }
                        _ => Err(Error::invalid(
                            "Unable to terminate operation. No operation is in progress",
                        )),
                    }
                },
            )
            .await
            .inspect_err(|e| {
                if matches!(e, Error::ConflictExhausted(_)) {
                    warn!(application = %name, "failed to terminate operation due to update conflicts");
                }
            })?;

        self.read_model.wait_for(&updated).await;
        self.audit
            .record(
                &app_reference(&updated),
                reasons::OPERATION_TERMINATED,
                "terminated running operation",
                &caller.username,
            )
            .await;
        Ok(updated)
    }
}

fn apply_desired(app: &mut Application, desired: &Application, mode: MergeMode) {
    app.spec = desired.spec.clone();
    match mode {
        MergeMode::Merge => {
            let mut labels = app.labels();
            labels.extend(desired.labels());
            let mut annotations = app.annotations();
            annotations.extend(desired.annotations());
            app.metadata.labels = Some(labels);
            app.metadata.annotations = Some(annotations);
        }
        MergeMode::Replace => {
            app.metadata.labels = desired.metadata.labels.clone();
            app.metadata.annotations = desired.metadata.annotations.clone();
        }
    }
    app.metadata.finalizers = desired.metadata.finalizers.clone();
}
