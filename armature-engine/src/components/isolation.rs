//! Isolation layout, dependency strategies and the isolation descriptor.
//!
//! Every install lives in its own directory:
//!
//! ```text
//! <storage_root>/components/<name>/<version>-<nonce>/
//! ├── src/              fetched source tree (contains component.toml)
//! ├── deps/             the component's private dependency tree
//! └── isolation.toml    descriptor written once the install succeeded
//! ```
//!
//! Dependency installers are always pointed at `deps/` through explicit
//! arguments and environment, never at a shared location.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Component, Path};
use std::process::Stdio;
use walkdir::WalkDir;

use super::error::{ComponentError, Result};

pub const SOURCE_DIR: &str = "src";
pub const DEPS_DIR: &str = "deps";
pub const DESCRIPTOR_FILE: &str = "isolation.toml";

/// Environment variable pointing a component's own tooling at its private dependency tree.
pub const DEPS_DIR_ENV: &str = "ARMATURE_DEPS_DIR";
/// Environment variable naming the component's isolated install directory.
pub const COMPONENT_DIR_ENV: &str = "ARMATURE_COMPONENT_DIR";

/// How a component's dependencies are installed into `deps/`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyStrategy {
    #[default]
    None,
    Pip,
    Npm,
    Cargo,
    Command,
}

impl DependencyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pip => "pip",
            Self::Npm => "npm",
            Self::Cargo => "cargo",
            Self::Command => "command",
        }
    }
}

impl fmt::Display for DependencyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `[dependencies]` table of a component manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    #[serde(default)]
    pub strategy: DependencyStrategy,
    #[serde(default)]
    pub packages: Vec<String>,
    /// Argument vector for `strategy = "command"`, run from the source root.
    #[serde(default)]
    pub command: Vec<String>,
}

/// Record of how an install was isolated, written to `isolation.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationDescriptor {
    pub component: String,
    pub version: String,
    pub source: String,
    pub reference: String,
    pub strategy: DependencyStrategy,
    pub dependency_dir: String,
    pub content_hash: String,
    pub created_at: String,
}

impl IsolationDescriptor {
    pub fn load(install_path: &Path) -> Result<Self> {
        let path = install_path.join(DESCRIPTOR_FILE);
        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content).map_err(|e| {
            ComponentError::isolation(&path, format!("unreadable isolation descriptor: {e}"))
        })
    }

    pub fn save(&self, install_path: &Path) -> Result<()> {
        let path = install_path.join(DESCRIPTOR_FILE);
        let content = toml::to_string_pretty(self).map_err(|source| {
            ComponentError::TomlSerialize {
                path: path.display().to_string(),
                source,
            }
        })?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

/// Build the dependency installation command for `spec`, or `None` when
/// there is nothing to install.
///
/// Package arguments beginning with `-` are rejected: they could redirect the
/// package manager away from the private dependency tree.
pub fn dependency_command(
    spec: &DependencySpec,
    install_path: &Path,
) -> std::result::Result<Option<tokio::process::Command>, String> {
    if let Some(flag) = spec.packages.iter().find(|p| p.starts_with('-')) {
        return Err(format!("package argument '{flag}' looks like a flag"));
    }

    let source_dir = install_path.join(SOURCE_DIR);
    let deps_dir = install_path.join(DEPS_DIR);

    let mut command = match spec.strategy {
        DependencyStrategy::None => return Ok(None),
        DependencyStrategy::Command => {
            let Some((program, args)) = spec.command.split_first() else {
                return Err("strategy 'command' requires a non-empty command".to_string());
            };
            let mut command = tokio::process::Command::new(program);
            command.args(args);
            command
        }
        _ if spec.packages.is_empty() => return Ok(None),
        DependencyStrategy::Pip => {
            let mut command = tokio::process::Command::new("python3");
            command
                .args(["-m", "pip", "install", "--disable-pip-version-check", "--no-input"])
                .arg("--target")
                .arg(&deps_dir)
                .args(&spec.packages)
                .env("PYTHONNOUSERSITE", "1");
            command
        }
        DependencyStrategy::Npm => {
            let mut command = tokio::process::Command::new("npm");
            command
                .args(["install", "--no-save", "--no-package-lock", "--prefix"])
                .arg(&deps_dir)
                .args(&spec.packages);
            command
        }
        DependencyStrategy::Cargo => {
            let mut command = tokio::process::Command::new("cargo");
            command
                .args(["install", "--locked", "--root"])
                .arg(&deps_dir)
                .args(&spec.packages)
                .env("CARGO_HOME", deps_dir.join("cargo-home"))
                .env("CARGO_TARGET_DIR", deps_dir.join("target"));
            command
        }
    };

    command
        .current_dir(&source_dir)
        .env(DEPS_DIR_ENV, &deps_dir)
        .env(COMPONENT_DIR_ENV, install_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(Some(command))
}

/// SHA-256 over a directory tree: sorted relative paths, file contents and
/// symlink targets. Links are hashed, never followed.
pub fn content_hash(dir: &Path) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let file_type = entry.file_type();
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        if file_type.is_file() {
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(std::fs::read(entry.path())?);
        } else if file_type.is_symlink() {
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([1u8]);
            hasher.update(std::fs::read_link(entry.path())?.to_string_lossy().as_bytes());
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// True when `relative` stays inside the directory it is joined onto.
pub fn is_contained(relative: &Path) -> bool {
    !relative.as_os_str().is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
