//! Configuration module for the Keelson engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `keelson.deploy.yaml`
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    DeploySpec, ExecutionConfig, GuardrailsConfig, ProjectConfig, ResourceSpec, RetryConfig,
    StateBackend, StateConfig,
};
pub use parser::{ConfigParser, find_config_file, DEFAULT_CONFIG_FILES};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
