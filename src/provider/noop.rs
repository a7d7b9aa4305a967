//! In-process provider that performs no external side effects.
//!
//! Useful for modelling resources whose only purpose is to carry values
//! between other resources, and for exercising plans end to end.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::traits::{Outputs, ProviderResult, ResourceProvider};

/// Type tag of the no-op provider.
pub const NOOP_TYPE: &str = "noop";

/// Property whose change forces replacement.
const TRIGGERS_KEY: &str = "triggers";

/// Provider for the `noop` resource type.
#[derive(Debug, Default)]
pub struct NoopProvider;

impl NoopProvider {
    /// Creates a new no-op provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Outputs echo the properties, plus the physical id under `id`.
    fn outputs(physical_id: &str, properties: &Value) -> Outputs {
        let mut outputs = properties.as_object().cloned().unwrap_or_default();
        outputs.insert("id".to_string(), Value::String(physical_id.to_string()));
        outputs
    }
}

#[async_trait]
impl ResourceProvider for NoopProvider {
    fn resource_type(&self) -> &'static str {
        NOOP_TYPE
    }

    async fn create(&self, properties: &Value) -> ProviderResult<(String, Outputs)> {
        let physical_id = Uuid::new_v4().to_string();
        debug!("noop: created {}", physical_id);
        let outputs = Self::outputs(&physical_id, properties);
        Ok((physical_id, outputs))
    }

    async fn update(&self, physical_id: &str, properties: &Value) -> ProviderResult<Outputs> {
        debug!("noop: updated {}", physical_id);
        Ok(Self::outputs(physical_id, properties))
    }

    async fn delete(&self, physical_id: &str) -> ProviderResult<()> {
        debug!("noop: deleted {}", physical_id);
        Ok(())
    }

    fn is_replacement_required(&self, old: &Value, new: &Value) -> bool {
        old.get(TRIGGERS_KEY) != new.get(TRIGGERS_KEY)
    }

    fn validate(&self, properties: &Value) -> Result<(), String> {
        if properties.get("id").is_some() {
            return Err(String::from("'id' is reserved for the physical id output"));
        }
        Ok(())
    }
}
