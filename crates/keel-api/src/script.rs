//! Resource action script engine seam
//!
//! Actions are scripts attached to resource kinds (e.g. "restart" for a
//! Deployment). The engine discovers which actions apply to a live object and
//! executes one, returning the objects it wants created or patched. It never
//! touches the cluster itself.

use async_trait::async_trait;
use kube::api::DynamicObject;

#[cfg(test)]
use mockall::automock;

use crate::error::Result;

/// An action a script offers for a live object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceActionDefinition {
    /// Action name, unique per kind
    pub name: String,
    /// Parameters the action accepts
    pub params: Vec<ResourceActionParam>,
    /// Whether the action is currently unavailable for this object
    pub disabled: bool,
    /// UI icon class
    pub icon_class: Option<String>,
    /// UI display name
    pub display_name: Option<String>,
}

/// A named action parameter
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceActionParam {
    /// Parameter name
    pub name: String,
    /// Value supplied by the caller
    pub value: String,
    /// Declared type
    pub type_: Option<String>,
    /// Default value
    pub default: Option<String>,
}

/// What to do with an impacted resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImpactOperation {
    /// Create a new object
    Create,
    /// Patch the existing object towards the returned value
    Patch,
}

/// One mutation proposed by an action
#[derive(Clone, Debug)]
pub struct ImpactedResource {
    /// Desired object value
    pub object: DynamicObject,
    /// How to apply it
    pub operation: ImpactOperation,
}

/// Discovers and executes resource action scripts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Actions applicable to the live object
    async fn discover(&self, live: &DynamicObject) -> Result<Vec<ResourceActionDefinition>>;

    /// Run an action, returning the ordered mutations it proposes
    async fn execute(
        &self,
        live: &DynamicObject,
        action: &ResourceActionDefinition,
        params: &[ResourceActionParam],
    ) -> Result<Vec<ImpactedResource>>;
}
