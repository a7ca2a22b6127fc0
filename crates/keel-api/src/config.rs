//! Server configuration loaded from the environment
//!
//! All settings have defaults. Values that are present but malformed are a
//! startup error rather than being silently replaced by the default.

use std::collections::HashMap;

use keel_common::telemetry::TelemetryConfig;
use keel_common::DEFAULT_CONTROL_NAMESPACE;
use thiserror::Error;

/// Default per-subscriber buffer for watch and refresh subscriptions
pub const DEFAULT_WATCH_BUFFER_SIZE: usize = 1000;

/// Default maximum number of pods in a single log request
pub const DEFAULT_MAX_POD_LOGS: usize = 10;

/// Default name used for audit events and tracing
pub const DEFAULT_COMPONENT_NAME: &str = "keel-api-server";

/// Configuration loading error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A value could not be parsed
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        /// Environment variable name
        key: &'static str,
        /// Offending value
        value: String,
        /// What was expected
        reason: &'static str,
    },
}

/// Application API server configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Control-plane namespace
    pub namespace: String,
    /// Additional namespaces (globs) in which Applications are served
    pub application_namespaces: Vec<String>,
    /// Per-subscriber NotificationBus capacity
    pub watch_buffer_size: usize,
    /// Maximum number of pods in one log request
    pub max_pod_logs_to_render: usize,
    /// Whether the `Replace=true` sync option is accepted
    pub sync_with_replace_allowed: bool,
    /// Whether resource-level rights are checked separately from Application rights
    pub fine_grained_inheritance: bool,
    /// Reporting component for audit events
    pub controller_name: String,
    /// Service name for tracing
    pub service_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_CONTROL_NAMESPACE.to_string(),
            application_namespaces: Vec::new(),
            watch_buffer_size: DEFAULT_WATCH_BUFFER_SIZE,
            max_pod_logs_to_render: DEFAULT_MAX_POD_LOGS,
            sync_with_replace_allowed: true,
            fine_grained_inheritance: false,
            controller_name: DEFAULT_COMPONENT_NAME.to_string(),
            service_name: DEFAULT_COMPONENT_NAME.to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let kv: HashMap<String, String> = std::env::vars().collect();
        Self::from_kv(&kv)
    }

    /// Load configuration from a key/value map
    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let namespace = non_empty(kv.get("KEEL_NAMESPACE")).unwrap_or(defaults.namespace);
        let application_namespaces = kv
            .get("KEEL_APPLICATION_NAMESPACES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let watch_buffer_size = parse_usize(
            kv.get("KEEL_WATCH_API_BUFFER_SIZE"),
            defaults.watch_buffer_size,
            "KEEL_WATCH_API_BUFFER_SIZE",
        )?;
        if watch_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                key: "KEEL_WATCH_API_BUFFER_SIZE",
                value: "0".to_string(),
                reason: "must be >= 1",
            });
        }

        let max_pod_logs_to_render = parse_usize(
            kv.get("KEEL_MAX_POD_LOGS_TO_RENDER"),
            defaults.max_pod_logs_to_render,
            "KEEL_MAX_POD_LOGS_TO_RENDER",
        )?;
        let sync_with_replace_allowed = parse_bool(
            kv.get("KEEL_SYNC_WITH_REPLACE_ALLOWED"),
            defaults.sync_with_replace_allowed,
            "KEEL_SYNC_WITH_REPLACE_ALLOWED",
        )?;
        let fine_grained_inheritance = parse_bool(
            kv.get("KEEL_FINE_GRAINED_INHERITANCE"),
            defaults.fine_grained_inheritance,
            "KEEL_FINE_GRAINED_INHERITANCE",
        )?;

        Ok(Self {
            namespace,
            application_namespaces,
            watch_buffer_size,
            max_pod_logs_to_render,
            sync_with_replace_allowed,
            fine_grained_inheritance,
            controller_name: non_empty(kv.get("KEEL_CONTROLLER_NAME"))
                .unwrap_or(defaults.controller_name),
            service_name: non_empty(kv.get("KEEL_SERVICE_NAME")).unwrap_or(defaults.service_name),
        })
    }

    /// Namespace to use when a request leaves it empty
    pub fn namespace_or_default<'a>(&'a self, namespace: &'a str) -> &'a str {
        if namespace.is_empty() {
            &self.namespace
        } else {
            namespace
        }
    }

    /// Whether Applications in `namespace` are served
    pub fn is_namespace_enabled(&self, namespace: &str) -> bool {
        namespace == self.namespace
            || keel_common::glob::any_matches(&self.application_namespaces, namespace)
    }

    /// Telemetry settings for this server; exporter and format come from the environment
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig::from_env(self.service_name.clone())
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, ConfigError> {
    match non_empty(value) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
            key,
            value: v,
            reason: "expected a non-negative integer",
        }),
    }
}

fn parse_bool(value: Option<&String>, default: bool, key: &'static str) -> Result<bool, ConfigError> {
    match non_empty(value) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: v,
                reason: "expected a boolean",
            }),
        },
    }
}
