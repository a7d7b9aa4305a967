//! Resource graph construction.
//!
//! This module turns the declarative resource definitions into a DAG:
//! - Parsing `{ ref }` mappings and `${...}` interpolation
//! - Inferring dependencies from references
//! - Rejecting dangling references and cycles

mod node;
mod dag;
mod builder;
pub mod reference;

pub use node::ResourceNode;
pub use dag::ResourceGraph;
pub use builder::GraphBuilder;
pub use reference::Reference;
