// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Keelson
//!
//! A declarative, idempotent deployment convergence engine.
//!
//! ## Overview
//!
//! Keelson reads a spec of named resources, works out how they depend on
//! each other and converges real resources onto it:
//!
//! - Dependencies come from explicit `depends_on` lists and from references
//!   between resource properties
//! - Only the difference against the last applied state is executed
//! - Independent changes run in parallel, dependent ones strictly in order
//! - A failure blocks only the resources downstream of it
//!
//! ## Architecture
//!
//! 1. **Graph**: the deploy spec becomes a validated DAG of resource nodes
//! 2. **Diff**: the graph is compared with recorded state into a change set
//! 3. **Schedule**: changes are layered into dependency-respecting batches
//! 4. **Execute**: batches run through providers; state is saved after each
//!
//! ## Modules
//!
//! - [`config`]: Spec parsing, validation and hashing
//! - [`graph`]: Resource graph construction and reference resolution
//! - [`planner`]: Diff, scheduling, plans and plan execution
//! - [`provider`]: Provider trait, registry and built-in providers
//! - [`state`]: State storage and leases
//! - [`reconciler`]: End-to-end plan, apply and destroy runs
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!   environment: dev
//!
//! resources:
//!   network:
//!     type: noop
//!     properties:
//!       cidr: 10.0.0.0/16
//!   web:
//!     type: noop
//!     properties:
//!       network: { ref: network.id }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeploySpec};
pub use error::{KeelsonError, Result};
pub use graph::{GraphBuilder, ResourceGraph};
pub use planner::{DiffEngine, ExecutionEngine, Plan};
pub use provider::{ProviderRegistry, ResourceProvider};
pub use reconciler::{Reconciler, RunOutcome};
pub use state::{DeploymentState, LocalStateStore, StateStore};
