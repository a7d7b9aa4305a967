//! State management module for the Keelson engine.
//!
//! This module provides persistent state storage for tracking applied
//! resources, their physical ids and outputs, and deployment history.

mod store;
mod local;
mod lease;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use lease::{Lease, generate_holder_id};
pub use types::{
    DeploymentHistoryEntry, DeploymentOperation, DeploymentState, MAX_HISTORY, ResourceState,
    ResourceStatus, STATE_VERSION,
};
