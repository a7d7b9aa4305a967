//! Local file-based state storage backend.
//!
//! State lives in `state.json` and the lease in `state.lock`, both under
//! one directory (`.keelson` by default). Writes go through a temp file,
//! fsync and rename so a reader never sees a partial snapshot.
//!
//! A lease file is only ever created with `create_new`. Removing one for
//! another holder requires the `state.lock.takeover` marker, so two runs
//! racing for the same expired lease cannot both win.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StateConfig;
use crate::error::{KeelsonError, Result, StateError};

use super::lease::Lease;
use super::store::StateStore;
use super::types::{DeploymentState, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".keelson";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lease file name.
const LOCK_FILE: &str = "state.lock";

/// Marker held while a lease file is checked and removed.
const TAKEOVER_FILE: &str = "state.lock.takeover";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lease file.
    lock_path: PathBuf,
    /// Path to the takeover marker.
    takeover_path: PathBuf,
}

/// Removes a temp file unless the write it belongs to completed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    const fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed
            && let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove temp file {}: {e}", self.path.display());
        }
    }
}

impl LocalStateStore {
    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);
        let takeover_path = base_dir.join(TAKEOVER_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            takeover_path,
        }
    }

    /// Creates a store for a project rooted at `project_root`.
    ///
    /// A relative `state.path` is resolved against the project root.
    #[must_use]
    pub fn from_config(config: &StateConfig, project_root: &Path) -> Self {
        let dir = config
            .path
            .as_deref()
            .map_or_else(|| project_root.join(STATE_DIR), |p| project_root.join(p));
        Self::with_base_dir(dir)
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(storage_error("create state directory"))?;
        }
        Ok(())
    }

    /// Writes `content` to `target` through a temp file, fsync and rename.
    async fn write_atomic(&self, target: &Path, content: &[u8]) -> Result<()> {
        self.ensure_dir().await?;

        let file_name = target
            .file_name()
            .map_or_else(|| String::from("state"), |n| n.to_string_lossy().to_string());
        let temp_path = self
            .base_dir
            .join(format!(".{file_name}.{}.tmp", &Uuid::new_v4().to_string()[..8]));
        let mut guard = TempFileGuard::new(temp_path.clone());

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(storage_error("create temp file"))?;
        file.write_all(content)
            .await
            .map_err(storage_error("write temp file"))?;
        file.sync_all()
            .await
            .map_err(storage_error("sync temp file"))?;
        drop(file);

        fs::rename(&temp_path, target)
            .await
            .map_err(storage_error("rename temp file"))?;
        guard.disarm();

        Ok(())
    }

    /// Reads the lease file if it exists.
    async fn read_lease(&self) -> Result<Option<Lease>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error("read lease file")(e)),
        };

        let lease: Lease = serde_json::from_str(&content).map_err(|e| {
            KeelsonError::State(StateError::Corrupted {
                message: format!("Failed to parse lease file: {e}"),
            })
        })?;

        Ok(Some(lease))
    }

    /// Fails with `LeaseLost` unless `lease` is the current, live lease.
    async fn verify_lease(&self, lease: &Lease) -> Result<()> {
        match self.read_lease().await? {
            Some(current) if current.lease_id == lease.lease_id && !current.is_expired() => Ok(()),
            _ => Err(KeelsonError::State(StateError::LeaseLost {
                lease_id: lease.lease_id.clone(),
            })),
        }
    }

    /// Creates the lease file only if it does not exist yet.
    async fn create_lease_file(&self, lease: &Lease) -> Result<bool> {
        let content = serde_json::to_vec_pretty(lease)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lease: {e}")))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(KeelsonError::State(StateError::LockFailed {
                    message: format!("Failed to create lease file: {e}"),
                }));
            }
        };

        file.write_all(&content).await.map_err(|e| {
            KeelsonError::State(StateError::LockFailed {
                message: format!("Failed to write lease file: {e}"),
            })
        })?;
        file.sync_all().await.map_err(|e| {
            KeelsonError::State(StateError::LockFailed {
                message: format!("Failed to sync lease file: {e}"),
            })
        })?;

        Ok(true)
    }

    /// Removes the lease file if it still holds `lease_id`.
    ///
    /// Returns false if the file is absent or holds another lease.
    async fn remove_lease_if(&self, lease_id: &str) -> Result<bool> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.takeover_path)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(KeelsonError::State(StateError::LockFailed {
                    message: format!(
                        "another run is replacing the lease; if this persists remove {} with 'state unlock --force'",
                        self.takeover_path.display()
                    ),
                }));
            }
            Err(e) => {
                return Err(KeelsonError::State(StateError::LockFailed {
                    message: format!("Failed to create takeover marker: {e}"),
                }));
            }
        }

        let removed = match self.read_lease().await {
            Ok(Some(current)) if current.lease_id == lease_id => {
                self.delete_lease_file().await.map(|()| true)
            }
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        };

        if let Err(e) = fs::remove_file(&self.takeover_path).await
            && e.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove takeover marker: {e}");
        }
        removed
    }

    /// Deletes the lease file.
    async fn delete_lease_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeelsonError::State(StateError::LockFailed {
                message: format!("Failed to delete lease file: {e}"),
            })),
        }
    }
}

fn storage_error(action: &'static str) -> impl Fn(std::io::Error) -> KeelsonError {
    move |e| KeelsonError::State(StateError::storage(format!("Failed to {action}: {e}")))
}

fn already_locked(existing: &Lease) -> KeelsonError {
    KeelsonError::State(StateError::AlreadyLocked {
        holder: existing.holder.clone(),
        since: existing.acquired_at.to_rfc3339(),
        expires_at: existing.expires_at.to_rfc3339(),
    })
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<DeploymentState>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(None);
            }
            Err(e) => return Err(storage_error("read state file")(e)),
        };

        info!("Loading state from: {}", self.state_path.display());

        let raw: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
            KeelsonError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        let found = raw
            .get("version")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if found != STATE_VERSION {
            return Err(KeelsonError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: found.to_string(),
            }));
        }

        let state: DeploymentState = serde_json::from_value(raw).map_err(|e| {
            KeelsonError::State(StateError::Corrupted {
                message: format!("Invalid state file: {e}"),
            })
        })?;

        Ok(Some(state))
    }

    async fn save(&self, state: &mut DeploymentState, lease: &Lease) -> Result<()> {
        self.verify_lease(lease).await?;

        state.serial += 1;
        state.last_updated = chrono::Utc::now();

        let written = match serde_json::to_vec_pretty(state) {
            Ok(content) => self.write_atomic(&self.state_path, &content).await,
            Err(e) => Err(StateError::serialization(format!("Failed to serialize state: {e}")).into()),
        };

        if let Err(e) = written {
            state.serial -= 1;
            return Err(e);
        }

        debug!("State saved (serial {})", state.serial);
        Ok(())
    }

    async fn delete(&self, lease: &Lease) -> Result<()> {
        self.verify_lease(lease).await?;

        match fs::remove_file(&self.state_path).await {
            Ok(()) => {
                info!("Deleted state file: {}", self.state_path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("delete state file")(e)),
        }
    }

    async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.state_path).await.unwrap_or(false))
    }

    async fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<Lease> {
        self.ensure_dir().await?;

        let lease = Lease::new(holder, ttl);
        if self.create_lease_file(&lease).await? {
            info!("Acquired state lease {} (expires in {}s)", lease.lease_id, ttl.as_secs());
            return Ok(lease);
        }

        match self.read_lease().await? {
            Some(existing) if !existing.is_expired() => return Err(already_locked(&existing)),
            Some(existing) => {
                warn!(
                    "Taking over expired lease {} held by {}",
                    existing.lease_id, existing.holder
                );
                self.remove_lease_if(&existing.lease_id).await?;
            }
            None => {}
        }

        if self.create_lease_file(&lease).await? {
            info!("Acquired state lease {} (expires in {}s)", lease.lease_id, ttl.as_secs());
            return Ok(lease);
        }

        // Another run won the race for the expired lease.
        match self.read_lease().await? {
            Some(existing) => Err(already_locked(&existing)),
            None => Err(KeelsonError::State(StateError::LockFailed {
                message: String::from("lease file disappeared during acquisition"),
            })),
        }
    }

    async fn renew_lease(&self, lease: &mut Lease, ttl: Duration) -> Result<()> {
        self.verify_lease(lease).await?;

        let mut renewed = lease.clone();
        renewed.extend(ttl);
        let content = serde_json::to_vec_pretty(&renewed)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lease: {e}")))?;
        self.write_atomic(&self.lock_path, &content).await?;

        *lease = renewed;
        debug!("Renewed state lease {} ({}s left)", lease.lease_id, lease.remaining_secs());
        Ok(())
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        if self.remove_lease_if(&lease.lease_id).await? {
            info!("Released state lease: {}", lease.lease_id);
        } else {
            debug!("Lease {} no longer held; nothing to release", lease.lease_id);
        }
        Ok(())
    }

    async fn break_lease(&self) -> Result<()> {
        if let Some(existing) = self.read_lease().await? {
            warn!("Breaking lease {} held by {}", existing.lease_id, existing.holder);
        }
        match fs::remove_file(&self.takeover_path).await {
            Ok(()) => warn!("Removed stale takeover marker"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(storage_error("remove takeover marker")(e)),
        }
        self.delete_lease_file().await
    }

    async fn lease_info(&self) -> Result<Option<Lease>> {
        self.read_lease().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
