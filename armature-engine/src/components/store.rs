//! Durable registry of installed components.
//!
//! The registry is a single TOML document at `<storage_root>/registry.toml`.
//! Writers serialize through an exclusive lock on `registry.lock` and replace
//! the document atomically (temp file, fsync, rename), so readers always see
//! either the old or the new state. Readers do not take the lock.

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::error::{ComponentError, Result};

const REGISTRY_FILE: &str = "registry.toml";
const LOCK_FILE: &str = "registry.lock";
const SCHEMA_VERSION: u32 = 1;

/// Lifecycle status of a registry record.
///
/// `Installing` only ever exists on in-memory candidates; a persisted record
/// with that status is reported by validation as a leftover transitional state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Installing,
    Installed,
    Failed,
    Uninstalled,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Failed => "failed",
            Self::Uninstalled => "uninstalled",
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A superseded install retained on disk as a rollback target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorInstall {
    pub version: String,
    pub source: String,
    pub install_path: PathBuf,
    pub installed_at: String,
    #[serde(default)]
    pub metadata: toml::Table,
}

/// One component's registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub name: String,
    pub source: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<PathBuf>,
    pub status: ComponentStatus,
    pub installed_at: String,
    /// Bumped on every committed change; used for compare-and-commit.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub metadata: toml::Table,
    /// Superseded installs, newest last.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous: Vec<PriorInstall>,
}

impl ComponentRecord {
    pub fn is_installed(&self) -> bool {
        self.status == ComponentStatus::Installed
    }

    /// Convert the current install into a rollback entry, if it has a path.
    pub fn to_prior(&self) -> Option<PriorInstall> {
        self.install_path.as_ref().map(|path| PriorInstall {
            version: self.version.clone(),
            source: self.source.clone(),
            install_path: path.clone(),
            installed_at: self.installed_at.clone(),
            metadata: self.metadata.clone(),
        })
    }

    /// Every install path this record references, current and retained.
    pub fn referenced_paths(&self) -> impl Iterator<Item = &Path> {
        self.install_path
            .as_deref()
            .into_iter()
            .chain(self.previous.iter().map(|p| p.install_path.as_path()))
    }

    fn check(&self, key: &str) -> std::result::Result<(), String> {
        if key != self.name {
            return Err(format!("entry '{key}' holds a record named '{}'", self.name));
        }
        if self.name.is_empty() || self.source.is_empty() || self.version.is_empty() {
            return Err(format!("entry '{key}' has an empty name, source or version"));
        }
        if self.status == ComponentStatus::Installed && self.install_path.is_none() {
            return Err(format!("entry '{key}' is installed but has no install path"));
        }
        Ok(())
    }
}

/// The whole persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryData {
    #[serde(default = "default_schema")]
    pub schema: u32,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentRecord>,
}

fn default_schema() -> u32 {
    SCHEMA_VERSION
}

impl Default for RegistryData {
    fn default() -> Self {
        Self {
            schema: SCHEMA_VERSION,
            components: BTreeMap::new(),
        }
    }
}

impl RegistryData {
    pub fn get(&self, name: &str) -> Option<&ComponentRecord> {
        self.components.get(name)
    }

    /// Insert or replace `record`, bumping its revision past the stored one.
    pub fn put(&mut self, mut record: ComponentRecord) -> u64 {
        let current = self.components.get(&record.name).map_or(0, |r| r.revision);
        record.revision = current + 1;
        let revision = record.revision;
        self.components.insert(record.name.clone(), record);
        revision
    }

    pub fn remove(&mut self, name: &str) -> Option<ComponentRecord> {
        self.components.remove(name)
    }

    /// Structural validation applied to every read.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.schema != SCHEMA_VERSION {
            return Err(format!("unsupported schema version {}", self.schema));
        }
        let mut seen = BTreeSet::new();
        for (key, record) in &self.components {
            record.check(key)?;
            for path in record.referenced_paths() {
                if !seen.insert(path.to_path_buf()) {
                    return Err(format!(
                        "install path {} is referenced more than once",
                        path.display()
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Handle on the registry document under a storage root.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    root: PathBuf,
}

impl RegistryStore {
    /// Open the registry under `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Read the current committed state.
    ///
    /// A missing document reads as an empty registry.
    ///
    /// # Errors
    ///
    /// Returns `RegistryCorruption` if the document cannot be parsed or fails
    /// structural validation.
    pub fn snapshot(&self) -> Result<RegistryData> {
        let path = self.path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryData::default());
            }
            Err(e) => return Err(e.into()),
        };
        let data: RegistryData =
            toml::from_str(&content).map_err(|e| ComponentError::RegistryCorruption {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        data.validate()
            .map_err(|reason| ComponentError::RegistryCorruption { path, reason })?;
        Ok(data)
    }

    pub fn find(&self, name: &str) -> Result<Option<ComponentRecord>> {
        Ok(self.snapshot()?.components.remove(name))
    }

    /// All records, ordered by name.
    pub fn all(&self) -> Result<Vec<ComponentRecord>> {
        Ok(self.snapshot()?.components.into_values().collect())
    }

    pub fn is_installed(&self, name: &str) -> Result<bool> {
        Ok(self
            .snapshot()?
            .get(name)
            .is_some_and(ComponentRecord::is_installed))
    }

    pub fn installed_count(&self) -> Result<usize> {
        Ok(self
            .snapshot()?
            .components
            .values()
            .filter(|r| r.is_installed())
            .count())
    }

    /// Insert or replace a record. Returns the committed revision.
    pub fn upsert(&self, record: ComponentRecord) -> Result<u64> {
        self.transact(|data| Ok(data.put(record)))
    }

    /// Delete a record outright. Returns whether it existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        self.transact(|data| Ok(data.remove(name).is_some()))
    }

    /// Run `f` against the latest state under the writer lock and commit the
    /// result atomically. Nothing is written when `f` fails or leaves the
    /// state unchanged.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or an error if the lock, the read or the
    /// atomic replacement fails.
    pub fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RegistryData) -> Result<T>,
    {
        let _lock = self.acquire_lock()?;
        let before = self.snapshot()?;
        let mut after = before.clone();
        let value = f(&mut after)?;
        if after != before {
            after.validate().map_err(|reason| ComponentError::RegistryCorruption {
                path: self.path(),
                reason: format!("refusing to commit: {reason}"),
            })?;
            self.write_atomic(&after)?;
            debug!("registry committed ({} record(s))", after.components.len());
        }
        Ok(value)
    }

    fn acquire_lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn write_atomic(&self, data: &RegistryData) -> Result<()> {
        let path = self.path();
        let content =
            toml::to_string_pretty(data).map_err(|source| ComponentError::TomlSerialize {
                path: path.display().to_string(),
                source,
            })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| ComponentError::Io(e.error))?;

        // Make the rename itself durable.
        if let Ok(dir) = File::open(&self.root) {
            dir.sync_all().ok();
        }
        Ok(())
    }
}
