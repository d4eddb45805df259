//! Per-operation context handed to every manager call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ArmatureConfig;

/// Subdirectory of the storage root holding isolated installs.
pub const COMPONENTS_DIR: &str = "components";

/// Explicit environment for a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerContext {
    pub storage_root: PathBuf,
    /// Upper bound for the fetch step and for the dependency step, each.
    pub fetch_timeout: Duration,
    /// Number of superseded installs kept on disk as rollback targets.
    pub retain_previous: usize,
}

impl ManagerContext {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            fetch_timeout: Duration::from_secs(crate::config::DEFAULT_FETCH_TIMEOUT_SECS),
            retain_previous: crate::config::DEFAULT_RETAIN_PREVIOUS,
        }
    }

    pub fn from_config(config: &ArmatureConfig) -> Self {
        Self {
            storage_root: config.storage_root(),
            fetch_timeout: config.fetch_timeout(),
            retain_previous: config.storage.retain_previous,
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_retain_previous(mut self, retain: usize) -> Self {
        self.retain_previous = retain;
        self
    }

    pub fn components_dir(&self) -> PathBuf {
        self.storage_root.join(COMPONENTS_DIR)
    }

    /// True if `path` lies strictly inside the components directory.
    pub fn owns(&self, path: &Path) -> bool {
        let root = self.components_dir();
        path != root
            && path.starts_with(&root)
            && path
                .strip_prefix(&root)
                .is_ok_and(super::isolation::is_contained)
    }
}
