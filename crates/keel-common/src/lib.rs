//! Common types for Keel: resource types, policy evaluation, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod glob;
pub mod kube_utils;
pub mod lock;
pub mod resource_tree;
pub mod retry;
pub mod sync_window;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Keel resources
pub const KEEL_GROUP: &str = "keel.dev";

/// API version served for Keel resources
pub const KEEL_VERSION: &str = "v1alpha1";

/// Default control-plane namespace
pub const DEFAULT_CONTROL_NAMESPACE: &str = "keel";

/// Project an Application belongs to when `spec.project` is empty
pub const DEFAULT_PROJECT: &str = "default";

/// Annotation requesting that the controller refresh an Application
pub const REFRESH_ANNOTATION: &str = "keel.dev/refresh";

/// Label identifying Secrets that register a destination cluster
pub const CLUSTER_SECRET_LABEL: &str = "keel.dev/secret-type";

/// Value of [`CLUSTER_SECRET_LABEL`] for cluster Secrets
pub const CLUSTER_SECRET_TYPE: &str = "cluster";

/// Server URL of the cluster Keel itself runs in
pub const IN_CLUSTER_SERVER: &str = "https://kubernetes.default.svc";

/// Name of the cluster Keel itself runs in
pub const IN_CLUSTER_NAME: &str = "in-cluster";
