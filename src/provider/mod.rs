//! Resource providers.
//!
//! This module contains the provider trait, the registry that maps type
//! tags to providers, and the built-in providers:
//! - `noop`: in-process resources with no side effects
//! - `file`: plain files under the project root

mod traits;
mod registry;
mod noop;
mod file;

#[cfg(test)]
pub(crate) mod testing;

pub use traits::{Outputs, ProviderResult, ResourceProvider};
#[cfg(test)]
pub use traits::MockResourceProvider;
pub use registry::ProviderRegistry;
pub use noop::{NoopProvider, NOOP_TYPE};
pub use file::{FileProvider, FILE_TYPE};
