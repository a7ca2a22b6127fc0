//! Error types for the Application API
//!
//! Every operation fails with one of the kinds below. Authorization failures
//! are deliberately opaque: [`Error::PermissionDenied`] never carries detail
//! about whether the Application exists or which project it belongs to.

use std::fmt::Display;

use thiserror::Error;

/// Result type for Application API operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for Application API operations
#[derive(Debug, Error)]
pub enum Error {
    /// Caller lacks rights, or the target cannot be revealed
    #[error("permission denied")]
    PermissionDenied,

    /// Target does not exist (only returned once the caller declared a project)
    #[error("{0}")]
    NotFound(String),

    /// Malformed request
    #[error("{0}")]
    InvalidArgument(String),

    /// Request is well-formed but blocked by policy or state
    #[error("{0}")]
    FailedPrecondition(String),

    /// Optimistic-write retry ceiling was exceeded
    #[error("{0}")]
    ConflictExhausted(String),

    /// Write was rejected because the version token was stale
    #[error("conflict: {0}")]
    Conflict(String),

    /// Create was rejected because the object already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Downstream cluster, manifest service or store failure
    #[error("{context}: {message}")]
    Upstream {
        /// What was being attempted
        context: String,
        /// Underlying failure
        message: String,
    },

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error for a named Application
    pub fn app_not_found(name: &str) -> Self {
        Self::NotFound(format!("applications.keel.dev \"{name}\" not found"))
    }

    /// Create an invalid-argument error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a failed-precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    /// Create an upstream error with context
    pub fn upstream(context: impl Into<String>, err: impl Display) -> Self {
        Self::Upstream {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Prefix the failure with the operation that was being attempted.
    ///
    /// The kind is preserved. [`Error::PermissionDenied`] passes through
    /// untouched so denials never carry detail.
    pub fn context(self, context: impl Into<String>) -> Self {
        let context = context.into();
        let wrap = |msg: String| format!("{context}: {msg}");
        match self {
            Self::PermissionDenied => Self::PermissionDenied,
            Self::NotFound(msg) => Self::NotFound(wrap(msg)),
            Self::InvalidArgument(msg) => Self::InvalidArgument(wrap(msg)),
            Self::FailedPrecondition(msg) => Self::FailedPrecondition(wrap(msg)),
            Self::ConflictExhausted(msg) => Self::ConflictExhausted(wrap(msg)),
            Self::Conflict(msg) => Self::Conflict(wrap(msg)),
            Self::AlreadyExists(msg) => Self::AlreadyExists(wrap(msg)),
            Self::Upstream { context: inner, message } => Self::Upstream {
                message: format!("{inner}: {message}"),
                context,
            },
            Self::Internal(msg) => Self::Internal(wrap(msg)),
        }
    }

    /// Whether the store rejected a write because of a stale version
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether the target does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the target already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists(ae.message)
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict(ae.message),
            other => Self::upstream("kubernetes API", other),
        }
    }
}

impl From<keel_common::Error> for Error {
    fn from(err: keel_common::Error) -> Self {
        match err {
            keel_common::Error::Kube { source } => source.into(),
            keel_common::Error::Validation { message, .. } => Self::InvalidArgument(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::PermissionDenied => tonic::Status::permission_denied(message),
            Error::NotFound(_) => tonic::Status::not_found(message),
            Error::InvalidArgument(_) => tonic::Status::invalid_argument(message),
            Error::FailedPrecondition(_) => tonic::Status::failed_precondition(message),
            Error::ConflictExhausted(_) => tonic::Status::internal(message),
            Error::Conflict(_) => tonic::Status::aborted(message),
            Error::AlreadyExists(_) => tonic::Status::already_exists(message),
            Error::Upstream { .. } => tonic::Status::unavailable(message),
            Error::Internal(_) => tonic::Status::internal(message),
        }
    }
}
