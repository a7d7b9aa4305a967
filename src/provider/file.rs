//! Provider managing plain files under a project root.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::traits::{Outputs, ProviderResult, ResourceProvider};
use crate::error::ProviderError;

/// Type tag of the file provider.
pub const FILE_TYPE: &str = "file";

/// Provider for the `file` resource type.
///
/// The physical id of a file resource is its path relative to the root.
#[derive(Debug, Clone)]
pub struct FileProvider {
    root: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProperties {
    path: String,
    #[serde(default)]
    content: String,
}

impl FileProvider {
    /// Creates a provider writing under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves a relative path against the root, rejecting escapes.
    fn resolve(&self, relative: &str) -> ProviderResult<PathBuf> {
        check_relative(relative).map_err(ProviderError::fatal)?;
        Ok(self.root.join(relative))
    }

    async fn write(&self, properties: &FileProperties) -> ProviderResult<Outputs> {
        let target = self.resolve(&properties.path)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let mut file = tokio::fs::File::create(&target).await.map_err(io_error)?;
        file.write_all(properties.content.as_bytes())
            .await
            .map_err(io_error)?;
        file.sync_all().await.map_err(io_error)?;

        debug!("file: wrote {}", target.display());
        Ok(outputs(&properties.path, &properties.content))
    }
}

#[async_trait]
impl ResourceProvider for FileProvider {
    fn resource_type(&self) -> &'static str {
        FILE_TYPE
    }

    async fn create(&self, properties: &Value) -> ProviderResult<(String, Outputs)> {
        let props: FileProperties = serde_json::from_value(properties.clone())?;
        let outputs = self.write(&props).await?;
        Ok((props.path, outputs))
    }

    async fn update(&self, physical_id: &str, properties: &Value) -> ProviderResult<Outputs> {
        let props: FileProperties = serde_json::from_value(properties.clone())?;
        if props.path != physical_id {
            return Err(ProviderError::fatal(format!(
                "cannot move '{physical_id}' to '{}' in place",
                props.path
            )));
        }
        self.write(&props).await
    }

    async fn delete(&self, physical_id: &str) -> ProviderResult<()> {
        let target = self.resolve(physical_id)?;
        tokio::fs::remove_file(&target).await.map_err(io_error)?;
        debug!("file: removed {}", target.display());
        Ok(())
    }

    fn is_replacement_required(&self, old: &Value, new: &Value) -> bool {
        old.get("path") != new.get("path")
    }

    fn validate(&self, properties: &Value) -> Result<(), String> {
        match properties.get("path") {
            Some(Value::String(path)) => check_relative(path),
            // A reference is resolved later; its shape is all we can check.
            Some(Value::Object(_)) => Ok(()),
            Some(_) => Err(String::from("'path' must be a string")),
            None => Err(String::from("'path' is required")),
        }
    }
}

fn check_relative(path: &str) -> Result<(), String> {
    let candidate = Path::new(path);
    if path.is_empty() {
        return Err(String::from("'path' cannot be empty"));
    }
    if candidate.is_absolute() {
        return Err(format!("'{path}' must be relative to the project root"));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(format!("'{path}' must not leave the project root"));
    }
    Ok(())
}

fn outputs(path: &str, content: &str) -> Outputs {
    let mut outputs = Outputs::new();
    outputs.insert("path".to_string(), Value::String(path.to_string()));
    outputs.insert(
        "sha256".to_string(),
        Value::String(hex::encode(Sha256::digest(content.as_bytes()))),
    );
    outputs.insert("size".to_string(), Value::from(content.len()));
    outputs
}

fn io_error(err: std::io::Error) -> ProviderError {
    match err.kind() {
        ErrorKind::NotFound => ProviderError::not_found(err.to_string()),
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            ProviderError::retryable(err.to_string())
        }
        _ => ProviderError::fatal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_writes_file() {
        let dir = TempDir::new().unwrap();
        let provider = FileProvider::new(dir.path());

        let (id, outputs) = provider
            .create(&json!({"path": "conf/app.env", "content": "PORT=80\n"}))
            .await
            .unwrap();

        assert_eq!(id, "conf/app.env");
        assert_eq!(outputs["size"], 8);
        let written = std::fs::read_to_string(dir.path().join("conf/app.env")).unwrap();
        assert_eq!(written, "PORT=80\n");
    }

    #[tokio::test]
    async fn test_update_rewrites_content() {
        let dir = TempDir::new().unwrap();
        let provider = FileProvider::new(dir.path());
        let (id, first) = provider
            .create(&json!({"path": "a.txt", "content": "one"}))
            .await
            .unwrap();

        let second = provider
            .update(&id, &json!({"path": "a.txt", "content": "two"}))
            .await
            .unwrap();

        assert_ne!(first["sha256"], second["sha256"]);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "two");
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let provider = FileProvider::new(dir.path());

        let err = provider.delete("missing.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let provider = FileProvider::new(dir.path());

        let err = provider
            .create(&json!({"path": "../outside.txt", "content": ""}))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(provider.validate(&json!({"path": "/etc/passwd"})).is_err());
        assert!(provider.validate(&json!({"content": "x"})).is_err());
        assert!(provider.validate(&json!({"path": {"ref": "dir.path"}})).is_ok());
    }

    #[test]
    fn test_replacement_on_path_change() {
        let provider = FileProvider::new(".");
        assert!(provider.is_replacement_required(&json!({"path": "a"}), &json!({"path": "b"})));
        assert!(!provider.is_replacement_required(
            &json!({"path": "a", "content": "1"}),
            &json!({"path": "a", "content": "2"})
        ));
    }
}
