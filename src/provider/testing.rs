//! Scriptable provider used by engine tests.
//!
//! Behaviour is driven by properties:
//! - `name`: physical id to assign (defaults to a counter)
//! - `fail`: `"fatal"` or `"retryable"` makes create and update fail
//! - `fail_times`: with `fail: retryable`, succeed after this many failures
//! - `delay_ms`: sleep before answering
//! - `immutable`: changing it requires replacement

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::traits::{Outputs, ProviderResult, ResourceProvider};
use crate::error::ProviderError;

pub const SCRIPTED_TYPE: &str = "scripted";

#[derive(Debug, Default)]
pub struct ScriptedProvider {
    calls: Mutex<Vec<String>>,
    attempts: Mutex<HashMap<String, u64>>,
    failing_deletes: HashSet<String>,
    missing: HashSet<String>,
    next_id: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete of this physical id fails fatally.
    pub fn failing_delete(mut self, physical_id: &str) -> Self {
        self.failing_deletes.insert(physical_id.to_string());
        self
    }

    /// Delete of this physical id reports NotFound.
    pub fn missing(mut self, physical_id: &str) -> Self {
        self.missing.insert(physical_id.to_string());
        self
    }

    /// Calls made so far, as `op:id`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn behave(&self, key: &str, properties: &Value) -> ProviderResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(ms) = properties.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        match properties.get("fail").and_then(Value::as_str) {
            Some("fatal") => Err(ProviderError::fatal(format!("{key} rejected"))),
            Some("retryable") => {
                let fail_times = properties
                    .get("fail_times")
                    .and_then(Value::as_u64)
                    .unwrap_or(u64::MAX);
                if attempt <= fail_times {
                    Err(ProviderError::retryable(format!("{key} throttled")))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ResourceProvider for ScriptedProvider {
    fn resource_type(&self) -> &'static str {
        SCRIPTED_TYPE
    }

    async fn create(&self, properties: &Value) -> ProviderResult<(String, Outputs)> {
        let physical_id = properties
            .get("name")
            .and_then(Value::as_str)
            .map_or_else(
                || format!("res-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
                str::to_string,
            );
        self.record(format!("create:{physical_id}"));
        self.behave(&physical_id, properties).await?;

        let mut outputs = properties.as_object().cloned().unwrap_or_default();
        outputs.insert("arn".to_string(), Value::String(format!("arn:{physical_id}")));
        Ok((physical_id, outputs))
    }

    async fn update(&self, physical_id: &str, properties: &Value) -> ProviderResult<Outputs> {
        self.record(format!("update:{physical_id}"));
        self.behave(physical_id, properties).await?;

        let mut outputs = properties.as_object().cloned().unwrap_or_default();
        outputs.insert("arn".to_string(), Value::String(format!("arn:{physical_id}")));
        Ok(outputs)
    }

    async fn delete(&self, physical_id: &str) -> ProviderResult<()> {
        self.record(format!("delete:{physical_id}"));
        if self.failing_deletes.contains(physical_id) {
            return Err(ProviderError::fatal(format!("{physical_id} is in use")));
        }
        if self.missing.contains(physical_id) {
            return Err(ProviderError::not_found(format!("{physical_id} not found")));
        }
        Ok(())
    }

    fn is_replacement_required(&self, old: &Value, new: &Value) -> bool {
        old.get("immutable") != new.get("immutable")
    }
}
