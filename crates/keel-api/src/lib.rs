//! Keel Application API
//!
//! The control-plane service for `Application` resources: CRUD with
//! project-scoped RBAC, sync and rollback, live resource access, resource
//! actions, pod logs and change watches.
//!
//! # Architecture
//!
//! ```text
//! caller ──► ApplicationService ──► AccessGate ──► PermissionOracle (Cedar)
//!                 │
//!                 ├── reads ──► ApplicationCache ◄── reflector ──► NotificationBus
//!                 └── writes ─► ConcurrencyMutator ──► ApplicationStore
//!                                     └── ReadModelSynchronizer
//! ```
//!
//! Embedding processes install logging with
//! `keel_common::telemetry::init_telemetry(config.telemetry())` and then call
//! [`ApplicationServer::start`].

#![deny(missing_docs)]

pub mod access;
pub mod audit;
pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod error;
pub mod mutation;
pub mod pod_logs;
pub mod rbac;
pub mod read_model;
pub mod repo;
pub mod request;
pub mod resource_action;
pub mod resources;
pub mod script;
pub mod selector;
pub mod server;
pub mod service;
pub mod state_cache;
pub mod store;
pub mod sync;
pub mod watch;

#[cfg(test)]
mod testing;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use rbac::UserIdentity;
pub use server::{ApplicationServer, Backends};
pub use service::{ApplicationService, Collaborators};
