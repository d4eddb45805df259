//! The `component.toml` manifest shipped at the root of every component source.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::isolation::DependencySpec;
use super::resolver::is_valid_component_name;

/// File name of the manifest inside a component source tree.
pub const MANIFEST_FILE: &str = "component.toml";

/// Errors reading a component manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest not found at {}", .0.display())]
    Missing(PathBuf),

    #[error("failed to read manifest at {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse manifest at {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

/// Update priority declared by a component release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePriority {
    #[default]
    Normal,
    Breaking,
    Security,
}

impl UpdatePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Breaking => "breaking",
            Self::Security => "security",
        }
    }
}

impl fmt::Display for UpdatePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed component manifest.
///
/// `commands` stays loosely typed: a malformed command entry must not prevent
/// the rest of the component from binding, so entries are validated one by one
/// by the command binder.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ComponentManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<UpdatePriority>,
    #[serde(default)]
    pub commands: Vec<toml::Value>,
    #[serde(default)]
    pub dependencies: DependencySpec,
    #[serde(default)]
    pub metadata: toml::Table,
}

impl ComponentManifest {
    /// Load and validate the manifest found in `dir`.
    pub fn load(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManifestError::Missing(path));
            }
            Err(source) => return Err(ManifestError::Read { path, source }),
        };
        let manifest = Self::parse(&content).map_err(|e| match e {
            ManifestError::Parse { source, .. } => ManifestError::Parse { path, source },
            other => other,
        })?;
        Ok(manifest)
    }

    /// Parse and validate manifest text.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let manifest: ComponentManifest =
            toml::from_str(content).map_err(|source| ManifestError::Parse {
                path: PathBuf::from(MANIFEST_FILE),
                source,
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if !is_valid_component_name(&self.name) {
            return Err(ManifestError::Invalid(format!(
                "component name '{}' is not a valid identifier",
                self.name
            )));
        }
        if self.version.trim().is_empty() {
            return Err(ManifestError::Invalid("version must not be empty".to_string()));
        }
        Ok(())
    }

    /// Build the opaque metadata table persisted with the registry record.
    ///
    /// Free-form `[metadata]` keys never shadow `description`, `commands` or
    /// `priority`.
    pub fn to_metadata(&self) -> toml::Table {
        let mut table = self.metadata.clone();
        table.insert(
            "description".to_string(),
            toml::Value::String(self.description.clone()),
        );
        table.insert(
            "commands".to_string(),
            toml::Value::Array(self.commands.clone()),
        );
        if let Some(priority) = self.priority {
            table.insert(
                "priority".to_string(),
                toml::Value::String(priority.as_str().to_string()),
            );
        }
        table
    }

    /// Entry points of well-formed command declarations, relative to the source root.
    pub fn command_entries(&self) -> impl Iterator<Item = &str> {
        self.commands
            .iter()
            .filter_map(|command| command.get("entry").and_then(toml::Value::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::isolation::DependencyStrategy;

    #[test]
    fn test_parse_full_manifest() {
        let toml = r#"
name = "weather"
version = "1.3.0"
description = "Forecasts for the terminal"
priority = "security"

[[commands]]
name = "forecast"
summary = "Show the forecast"
entry = "bin/forecast"

[dependencies]
strategy = "pip"
packages = ["requests==2.31.0"]

[metadata]
homepage = "https://example.com/weather"
        "#;

        let manifest = match ComponentManifest::parse(toml) {
            Ok(manifest) => manifest,
            Err(e) => panic!("Should parse valid manifest: {e}"),
        };
        assert_eq!(manifest.name, "weather");
        assert_eq!(manifest.priority, Some(UpdatePriority::Security));
        assert_eq!(manifest.dependencies.strategy, DependencyStrategy::Pip);
        assert_eq!(manifest.command_entries().collect::<Vec<_>>(), vec!["bin/forecast"]);
    }

    #[test]
    fn test_minimal_manifest_defaults() {
        let manifest = match ComponentManifest::parse("name = \"notes\"\nversion = \"0.1.0\"\n") {
            Ok(manifest) => manifest,
            Err(e) => panic!("Should parse minimal manifest: {e}"),
        };
        assert!(manifest.priority.is_none());
        assert!(manifest.commands.is_empty());
        assert_eq!(manifest.dependencies.strategy, DependencyStrategy::None);
    }

    #[test]
    fn test_rejects_invalid_name() {
        let result = ComponentManifest::parse("name = \"Not Valid\"\nversion = \"1.0.0\"\n");
        assert!(matches!(result, Err(ManifestError::Invalid(_))));
    }

    #[test]
    fn test_metadata_keeps_reserved_keys() {
        let toml = r#"
name = "weather"
version = "1.0.0"
description = "real"

[metadata]
description = "shadowed"
feature = true
        "#;
        let Ok(manifest) = ComponentManifest::parse(toml) else {
            panic!("Should parse manifest");
        };
        let metadata = manifest.to_metadata();
        assert_eq!(
            metadata.get("description").and_then(toml::Value::as_str),
            Some("real")
        );
        assert_eq!(metadata.get("feature").and_then(toml::Value::as_bool), Some(true));
        assert!(metadata.get("commands").is_some());
    }

    #[test]
    fn test_load_missing_manifest() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("Failed to create temp dir");
        };
        assert!(matches!(
            ComponentManifest::load(dir.path()),
            Err(ManifestError::Missing(_))
        ));
    }
}
