//! Configuration parser for loading deployment specs.
//!
//! This module handles loading the deploy spec from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, KeelsonError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::spec::DeploySpec;

/// Configuration parser for loading deployment specs.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a spec from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeploySpec> {
        let path = path.as_ref();
        info!("Loading deploy spec from: {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                return KeelsonError::Config(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            KeelsonError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a spec from a YAML string.
    ///
    /// Parse errors carry `source:line:column` when serde_yaml knows the
    /// position. An empty document is rejected rather than read as a spec
    /// without a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is empty or invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeploySpec> {
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        let source_name = source.map(|p| p.display().to_string());

        if content.lines().all(|line| {
            let line = line.trim();
            line.is_empty() || line.starts_with('#') || line == "---"
        }) {
            return Err(KeelsonError::Config(ConfigError::ParseError {
                message: String::from("deploy spec is empty"),
                location: source_name,
            }));
        }

        let spec: DeploySpec = serde_yaml::from_str(content).map_err(|e| {
            let location = match (source_name.as_deref(), e.location()) {
                (Some(name), Some(at)) => Some(format!("{name}:{}:{}", at.line(), at.column())),
                (None, Some(at)) => Some(format!("line {}, column {}", at.line(), at.column())),
                (name, None) => name.map(str::to_string),
            };
            KeelsonError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed deploy spec for {} ({} resources)",
            spec.qualified_name(),
            spec.resources.len()
        );
        Ok(spec)
    }

    /// Loads a spec with environment variable overrides.
    ///
    /// Recognised variables: `KEELSON_PROJECT_NAME`,
    /// `KEELSON_PROJECT_ENVIRONMENT`, `KEELSON_STATE_PATH` and
    /// `KEELSON_CONCURRENCY`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeploySpec> {
        let mut spec = self.load_file(path)?;
        Self::apply_env_overrides(&mut spec, |key| std::env::var(key).ok());
        Ok(spec)
    }

    /// Applies overrides looked up through `lookup`.
    fn apply_env_overrides(spec: &mut DeploySpec, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("KEELSON_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            spec.project.name = name;
        }

        if let Some(env) = lookup("KEELSON_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            spec.project.environment = env;
        }

        if let Some(path) = lookup("KEELSON_STATE_PATH") {
            debug!("Overriding state.path from environment");
            spec.state.path = Some(path);
        }

        if let Some(raw) = lookup("KEELSON_CONCURRENCY") {
            match raw.parse::<usize>() {
                Ok(concurrency) => {
                    debug!("Overriding execution.concurrency from environment");
                    spec.execution.concurrency = concurrency;
                }
                Err(_) => warn!("Ignoring invalid KEELSON_CONCURRENCY value: {raw}"),
            }
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                KeelsonError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "keelson.deploy.yaml",
    "keelson.deploy.yml",
    "deploy.yaml",
    "deploy.yml",
];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(KeelsonError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
";
        let spec = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(spec.project.name, "test-project");
        assert_eq!(spec.project.environment, "dev");
        assert!(spec.resources.is_empty());
        assert_eq!(spec.execution.concurrency, 4);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: web-stack
  environment: prod

state:
  backend: local
  path: .state

execution:
  concurrency: 8
  retry:
    max_attempts: 5
    initial_backoff_ms: 100

guardrails:
  max_deletes: 2

resources:
  network:
    type: noop
    properties:
      cidr: 10.0.0.0/16
      subnets:
        - 10.0.1.0/24
        - 10.0.2.0/24
  service:
    type: noop
    depends_on: [network]
    protect: true
    properties:
      network_id: { ref: network }
      banner: "cidr ${network.cidr}"
"#;
        let spec = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(spec.project.environment, "prod");
        assert_eq!(spec.state.path.as_deref(), Some(".state"));
        assert_eq!(spec.execution.concurrency, 8);
        assert_eq!(spec.execution.retry.max_attempts, 5);
        assert_eq!(spec.execution.retry.max_backoff_ms, 30_000);
        assert_eq!(spec.guardrails.unwrap().max_deletes, Some(2));
        assert_eq!(spec.resources.len(), 2);

        let service = &spec.resources["service"];
        assert!(service.protect);
        assert_eq!(service.depends_on, vec!["network"]);
        assert_eq!(service.properties["network_id"]["ref"], "network");
        assert_eq!(
            spec.resources["network"].properties["subnets"][1],
            "10.0.2.0/24"
        );
    }

    #[test]
    fn test_missing_properties_default_to_empty_object() {
        let yaml = r#"
project:
  name: p
resources:
  marker:
    type: noop
"#;
        let spec = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(spec.resources["marker"].properties, serde_json::json!({}));
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let result = ConfigParser::new().parse_yaml("project: [", None);
        assert!(matches!(
            result,
            Err(KeelsonError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_empty_spec_is_rejected() {
        let err = ConfigParser::new()
            .parse_yaml("# nothing here\n---\n\n", Some(Path::new("deploy.yaml")))
            .unwrap_err();
        match err {
            KeelsonError::Config(ConfigError::ParseError { message, location }) => {
                assert_eq!(message, "deploy spec is empty");
                assert_eq!(location.as_deref(), Some("deploy.yaml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_error_reports_position() {
        let yaml = "project:\n  name: p\nresources:\n  web:\n    type: [noop\n";
        let err = ConfigParser::new()
            .parse_yaml(yaml, Some(Path::new("deploy.yaml")))
            .unwrap_err();
        match err {
            KeelsonError::Config(ConfigError::ParseError { location, .. }) => {
                let location = location.unwrap();
                assert!(location.starts_with("deploy.yaml:"), "{location}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_file_strips_bom_and_reports_missing_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("keelson.deploy.yaml");
        std::fs::write(&path, "\u{feff}project:\n  name: bom\n").unwrap();

        let parser = ConfigParser::new();
        assert_eq!(parser.load_file(&path).unwrap().project.name, "bom");

        let missing = parser.load_file(temp.path().join("absent.yaml"));
        assert!(matches!(
            missing,
            Err(KeelsonError::Config(ConfigError::FileNotFound { .. }))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let yaml = "project:\n  name: original\n";
        let mut spec = ConfigParser::new().parse_yaml(yaml, None).unwrap();

        let vars: HashMap<&str, &str> = HashMap::from([
            ("KEELSON_PROJECT_NAME", "renamed"),
            ("KEELSON_PROJECT_ENVIRONMENT", "staging"),
            ("KEELSON_CONCURRENCY", "not-a-number"),
        ]);
        ConfigParser::apply_env_overrides(&mut spec, |k| vars.get(k).map(|v| (*v).to_string()));

        assert_eq!(spec.project.name, "renamed");
        assert_eq!(spec.project.environment, "staging");
        assert_eq!(spec.execution.concurrency, 4);
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("keelson.deploy.yaml"), "project:\n  name: x\n").unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, temp.path().join("keelson.deploy.yaml"));
    }
}
