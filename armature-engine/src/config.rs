//! Configuration loading and management for Armature.
//!
//! The configuration is stored in TOML format and defines:
//! - Storage settings (root directory, retention of prior installs, fetch timeout)
//! - The component catalog mapping short names to source coordinates
//! - Update check settings

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::components::resolver::{Identifier, is_valid_component_name};

pub const DEFAULT_RETAIN_PREVIOUS: usize = 1;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 120;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Storage root. Use "auto" for the XDG data directory.
    #[serde(default = "default_root")]
    pub root: String,

    /// Superseded installs kept on disk for rollback.
    #[serde(default = "default_retain_previous")]
    pub retain_previous: usize,

    /// Timeout in seconds for fetching a component and for installing its dependencies.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

fn default_root() -> String {
    "auto".to_string()
}

const fn default_retain_previous() -> usize {
    DEFAULT_RETAIN_PREVIOUS
}

const fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            retain_previous: default_retain_previous(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

/// Update check configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdatesConfig {
    /// Whether background update checks run at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Treat every run as a test context, which suppresses update checks.
    #[serde(default)]
    pub test_mode: bool,
}

const fn default_enabled() -> bool {
    true
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            test_mode: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArmatureConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    /// Short component name to source coordinate.
    #[serde(default)]
    pub catalog: BTreeMap<String, String>,

    #[serde(default)]
    pub updates: UpdatesConfig,
}

impl ArmatureConfig {
    /// Load and validate configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ArmatureConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate catalog entries and storage settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.fetch_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "storage.fetch_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.storage.root.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.root must not be empty".to_string(),
            ));
        }

        for (name, coordinate) in &self.catalog {
            if !is_valid_component_name(name) {
                return Err(ConfigError::ValidationError(format!(
                    "catalog name '{name}' is not a valid component name"
                )));
            }
            match Identifier::parse(coordinate) {
                Ok(Identifier::Coordinate { pin: None, .. }) => {}
                Ok(_) => {
                    return Err(ConfigError::ValidationError(format!(
                        "catalog entry '{name}' must be an unpinned source coordinate, got '{coordinate}'"
                    )));
                }
                Err(e) => {
                    return Err(ConfigError::ValidationError(format!(
                        "catalog entry '{name}': {e}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve the storage root.
    ///
    /// If `root` is "auto", uses `data_dir` when given, falling back to
    /// `./.armature` when no data directory can be determined.
    pub fn resolve_storage_root(&self, data_dir: Option<&Path>) -> PathBuf {
        if self.storage.root == "auto" {
            match data_dir {
                Some(dir) => dir.to_path_buf(),
                None => PathBuf::from(".armature"),
            }
        } else {
            PathBuf::from(&self.storage.root)
        }
    }

    /// Storage root using the platform's XDG data directory for "auto".
    pub fn storage_root(&self) -> PathBuf {
        let dirs = directories::ProjectDirs::from("ai", "govcraft", "armature");
        self.resolve_storage_root(dirs.as_ref().map(|d| d.data_dir()))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.storage.fetch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() -> Result<(), Box<dyn std::error::Error>> {
        let config = ArmatureConfig::parse("")?;
        assert_eq!(config.storage.root, "auto");
        assert_eq!(config.storage.retain_previous, 1);
        assert_eq!(config.storage.fetch_timeout_secs, 120);
        assert!(config.catalog.is_empty());
        assert!(config.updates.enabled);
        assert!(!config.updates.test_mode);
        Ok(())
    }

    #[test]
    fn test_parse_full_config() -> Result<(), Box<dyn std::error::Error>> {
        let toml = r#"
[storage]
root = "/var/lib/armature"
retain_previous = 3
fetch_timeout_secs = 30

[catalog]
weather = "acme/weather"
notes = "https://git.example.com/tools/notes.git"
mirror = "/srv/mirror/mirror"

[updates]
enabled = false
test_mode = true
        "#;

        let config = ArmatureConfig::parse(toml)?;
        assert_eq!(config.storage_root(), PathBuf::from("/var/lib/armature"));
        assert_eq!(config.storage.retain_previous, 3);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(30));
        assert_eq!(config.catalog.len(), 3);
        assert_eq!(
            config.catalog.get("weather").map(String::as_str),
            Some("acme/weather")
        );
        assert!(!config.updates.enabled);
        assert!(config.updates.test_mode);
        Ok(())
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let result = ArmatureConfig::parse("[storage]\nfetch_timeout_secs = 0\n");
        let Err(err) = result else {
            panic!("expected zero timeout to be rejected");
        };
        assert!(err.to_string().contains("fetch_timeout_secs"));
    }

    #[test]
    fn test_rejects_invalid_catalog_entries() {
        for toml in [
            "[catalog]\nWeather = \"acme/weather\"\n",
            "[catalog]\nweather = \"not a coordinate\"\n",
            "[catalog]\nweather = \"acme/weather@1.0.0\"\n",
            "[catalog]\nweather = \"other\"\n",
        ] {
            assert!(
                matches!(
                    ArmatureConfig::parse(toml),
                    Err(ConfigError::ValidationError(_))
                ),
                "{toml:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_resolve_storage_root() {
        let config = ArmatureConfig::default();
        assert_eq!(
            config.resolve_storage_root(Some(Path::new("/home/u/.local/share/armature"))),
            PathBuf::from("/home/u/.local/share/armature")
        );
        assert_eq!(config.resolve_storage_root(None), PathBuf::from(".armature"));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            ArmatureConfig::parse("[storage\nroot = 1"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
