//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;
use std::time::Duration;

use super::lease::Lease;
use super::types::DeploymentState;
use crate::error::Result;

/// Trait for state storage backends.
///
/// Mutating operations take the caller's [`Lease`] and fail with
/// `StateError::LeaseLost` unless it is still the current, unexpired one.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the deployment state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<DeploymentState>>;

    /// Saves the deployment state atomically and increments its serial.
    async fn save(&self, state: &mut DeploymentState, lease: &Lease) -> Result<()>;

    /// Deletes the deployment state.
    async fn delete(&self, lease: &Lease) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the lease, taking over an expired one.
    ///
    /// Fails with `StateError::AlreadyLocked` if another live lease exists.
    async fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<Lease>;

    /// Extends the caller's lease by `ttl` from now.
    async fn renew_lease(&self, lease: &mut Lease, ttl: Duration) -> Result<()>;

    /// Releases the lease if it is still held by the caller.
    async fn release_lease(&self, lease: &Lease) -> Result<()>;

    /// Removes whatever lease exists, regardless of holder.
    async fn break_lease(&self) -> Result<()>;

    /// Gets the current lease, live or expired, if any.
    async fn lease_info(&self) -> Result<Option<Lease>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
