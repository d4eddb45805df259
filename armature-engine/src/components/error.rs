//! Error types for component lifecycle operations.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during component lifecycle operations.
///
/// Fetch, dependency, isolation and verification failures are only returned
/// after the installer has purged everything it allocated, so callers never
/// have to clean up the filesystem themselves.
#[derive(Debug, Error)]
pub enum ComponentError {
    /// Identifier does not match the accepted grammar. Raised before any I/O.
    #[error("Invalid component identifier '{identifier}': {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    /// Source unreachable, version not found, or fetch timed out.
    #[error("Failed to fetch '{name}': {reason}")]
    Fetch { name: String, reason: String },

    /// The component's own dependency installation failed inside its isolated path.
    #[error("Dependency installation failed for '{name}': {reason}")]
    Dependency { name: String, reason: String },

    /// Path allocation, collision, permission or containment failure.
    #[error("Isolation error at {}: {reason}", .path.display())]
    Isolation { path: PathBuf, reason: String },

    /// Another writer committed a change to the same component first.
    #[error("Component '{name}' was modified concurrently; this operation lost the race")]
    ConcurrentModification { name: String },

    /// Rollback requested with no retained prior install on disk.
    #[error("No rollback target available for '{name}'")]
    NoRollbackTarget { name: String },

    /// A persisted record failed structural validation on read.
    #[error("Registry at {} is corrupt: {reason}", .path.display())]
    RegistryCorruption { path: PathBuf, reason: String },

    /// Operation requires an installed component.
    #[error("Component '{name}' is not installed")]
    NotInstalled { name: String },

    /// A freshly built install did not pass verification.
    #[error("Verification of '{name}' failed: {reason}")]
    Verification { name: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize TOML at {path}: {source}")]
    TomlSerialize {
        path: String,
        source: toml::ser::Error,
    },
}

/// Lifecycle stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Fetch,
    Dependencies,
    Isolation,
    Verification,
    Commit,
    Rollback,
    Registry,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::Fetch => "fetch",
            Self::Dependencies => "dependencies",
            Self::Isolation => "isolation",
            Self::Verification => "verification",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Registry => "registry",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ComponentError {
    /// The stage that failed, for user-facing reporting.
    pub fn stage(&self) -> Stage {
        match self {
            Self::InvalidIdentifier { .. } | Self::NotInstalled { .. } => Stage::Resolve,
            Self::Fetch { .. } => Stage::Fetch,
            Self::Dependency { .. } => Stage::Dependencies,
            Self::Isolation { .. } => Stage::Isolation,
            Self::Verification { .. } => Stage::Verification,
            Self::ConcurrentModification { .. } => Stage::Commit,
            Self::NoRollbackTarget { .. } => Stage::Rollback,
            Self::RegistryCorruption { .. } | Self::Io(_) | Self::TomlSerialize { .. } => {
                Stage::Registry
            }
        }
    }

    pub(crate) fn fetch(name: &str, reason: impl Into<String>) -> Self {
        Self::Fetch {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn isolation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Isolation {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for component operations.
pub type Result<T> = std::result::Result<T, ComponentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ComponentError::NoRollbackTarget {
            name: "weather".to_string(),
        };
        assert_eq!(err.to_string(), "No rollback target available for 'weather'");

        let err = ComponentError::InvalidIdentifier {
            identifier: "Bad Name".to_string(),
            reason: "contains whitespace".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid component identifier 'Bad Name': contains whitespace"
        );

        let err = ComponentError::isolation("/tmp/components/weather", "already allocated");
        assert_eq!(
            err.to_string(),
            "Isolation error at /tmp/components/weather: already allocated"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ComponentError = io_err.into();
        assert!(matches!(err, ComponentError::Io(_)));
        assert_eq!(err.stage(), Stage::Registry);
    }

    #[test]
    fn test_stage_reporting() {
        assert_eq!(ComponentError::fetch("weather", "timed out").stage(), Stage::Fetch);
        assert_eq!(
            ComponentError::ConcurrentModification {
                name: "weather".to_string()
            }
            .stage(),
            Stage::Commit
        );
        assert_eq!(
            ComponentError::Dependency {
                name: "weather".to_string(),
                reason: "pip exited with 1".to_string()
            }
            .stage()
            .to_string(),
            "dependencies"
        );
    }
}
