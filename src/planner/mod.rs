//! Planning and execution of deployment changes.
//!
//! The diff engine compares the resource graph against recorded state and
//! produces a [`ChangeSet`]. The scheduler orders those changes into
//! batches, [`Plan`] wraps them with guardrail checks, and the
//! [`ExecutionEngine`] applies a plan through the registered providers.

mod changeset;
mod diff;
mod executor;
mod plan;
mod report;
mod retry;
mod scheduler;

pub use changeset::{ChangeKey, ChangeOp, ChangeRecord, ChangeSet, PropertyChange, PropertyChangeKind};
pub use diff::{DiffEngine, summarize};
pub use executor::{ExecutionEngine, ExecutionOptions};
pub use plan::Plan;
pub use report::{BlockedNode, ExecutionReport, FailedNode, FailureReport, RecordResult, RecordStatus};
pub use retry::{Attempted, RetryPolicy};
pub use scheduler::{Schedule, schedule};
