//! Resource provider trait definition.
//!
//! A provider owns one resource type and is the only component that
//! talks to the outside world.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ProviderError;

/// Result of a provider operation.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Outputs reported by a provider after create or update.
pub type Outputs = Map<String, Value>;

/// Interface implemented once per resource type.
///
/// Properties passed to a provider are fully resolved: every reference
/// has already been replaced by a physical id or output value.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Type tag handled by this provider.
    fn resource_type(&self) -> &'static str;

    /// Creates the resource and returns its physical id and outputs.
    async fn create(&self, properties: &Value) -> ProviderResult<(String, Outputs)>;

    /// Updates the resource in place and returns its new outputs.
    async fn update(&self, physical_id: &str, properties: &Value) -> ProviderResult<Outputs>;

    /// Deletes the resource.
    async fn delete(&self, physical_id: &str) -> ProviderResult<()>;

    /// Returns true if moving from `old` to `new` cannot be done in place.
    ///
    /// Both arguments are unresolved property mappings.
    fn is_replacement_required(&self, old: &Value, new: &Value) -> bool;

    /// Checks unresolved properties before any plan is made.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    fn validate(&self, _properties: &Value) -> std::result::Result<(), String> {
        Ok(())
    }
}
