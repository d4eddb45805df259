//! Remote access to component sources: listing version tags and fetching a ref.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tracing::debug;
use walkdir::WalkDir;

use super::error::{ComponentError, Result};
use super::manifest::ComponentManifest;

/// A published tag of a component source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTag {
    pub name: String,
    /// When the tag was published, if the source exposes it.
    pub timestamp: Option<DateTime<Utc>>,
}

impl VersionTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: None,
        }
    }
}

/// Read-only access to a component source.
///
/// Implementations never write outside the destination directory they are
/// handed, and never touch local registry state.
#[async_trait]
pub trait ComponentSource: Send + Sync + std::fmt::Debug {
    /// List the tags published at `coordinate`.
    async fn list_tags(&self, coordinate: &str) -> Result<Vec<VersionTag>>;

    /// Fetch `reference` of `coordinate` into `dest`, which exists and is empty.
    async fn fetch(&self, coordinate: &str, reference: &str, dest: &Path) -> Result<()>;

    /// Read the manifest at `reference` without installing anything.
    async fn read_manifest(&self, coordinate: &str, reference: &str) -> Result<ComponentManifest> {
        let scratch = tempfile::tempdir()?;
        self.fetch(coordinate, reference, scratch.path()).await?;
        ComponentManifest::load(scratch.path())
            .map_err(|e| ComponentError::fetch(coordinate, e.to_string()))
    }
}

/// True for `file://` coordinates and absolute filesystem paths.
pub fn is_local_coordinate(coordinate: &str) -> bool {
    coordinate.starts_with("file://") || Path::new(coordinate).is_absolute()
}

fn local_path(coordinate: &str) -> PathBuf {
    PathBuf::from(coordinate.strip_prefix("file://").unwrap_or(coordinate))
}

/// Git-hosted sources, driven through the `git` executable.
#[derive(Debug, Clone, Default)]
pub struct GitSource;

impl GitSource {
    async fn git(&self, coordinate: &str, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ComponentError::fetch(coordinate, format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ComponentError::fetch(
                coordinate,
                format!("git {} failed: {}", args.first().unwrap_or(&""), stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ComponentSource for GitSource {
    async fn list_tags(&self, coordinate: &str) -> Result<Vec<VersionTag>> {
        let stdout = self
            .git(coordinate, &["ls-remote", "--tags", "--refs", coordinate])
            .await?;
        Ok(parse_ls_remote(&stdout))
    }

    async fn fetch(&self, coordinate: &str, reference: &str, dest: &Path) -> Result<()> {
        let dest_str = dest.to_string_lossy().into_owned();
        debug!("git clone {coordinate} ({reference}) into {}", dest.display());
        self.git(
            coordinate,
            &[
                "clone",
                "--quiet",
                "--depth",
                "1",
                "--branch",
                reference,
                coordinate,
                dest_str.as_str(),
            ],
        )
        .await?;

        // Installs are plain source trees; git metadata is not part of them.
        let git_dir = dest.join(".git");
        if git_dir.exists() {
            tokio::fs::remove_dir_all(&git_dir).await?;
        }
        Ok(())
    }
}

fn parse_ls_remote(stdout: &str) -> Vec<VersionTag> {
    stdout
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .filter_map(|reference| reference.strip_prefix("refs/tags/"))
        .map(VersionTag::new)
        .collect()
}

/// A local mirror: one subdirectory per tag, each holding a complete source tree.
///
/// Tag timestamps are the subdirectories' modification times.
#[derive(Debug, Clone, Default)]
pub struct DirectorySource;

#[async_trait]
impl ComponentSource for DirectorySource {
    async fn list_tags(&self, coordinate: &str) -> Result<Vec<VersionTag>> {
        let root = local_path(coordinate);
        let entries = std::fs::read_dir(&root).map_err(|e| {
            ComponentError::fetch(coordinate, format!("cannot read {}: {e}", root.display()))
        })?;

        let mut tags = Vec::new();
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let timestamp = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from);
            tags.push(VersionTag {
                name: entry.file_name().to_string_lossy().into_owned(),
                timestamp,
            });
        }
        Ok(tags)
    }

    async fn fetch(&self, coordinate: &str, reference: &str, dest: &Path) -> Result<()> {
        // A reference names exactly one version directory of the mirror.
        let mut parts = Path::new(reference).components();
        if !matches!(
            (parts.next(), parts.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(ComponentError::fetch(
                coordinate,
                format!("invalid version reference '{reference}'"),
            ));
        }
        let from = local_path(coordinate).join(reference);
        if !from.is_dir() {
            return Err(ComponentError::fetch(
                coordinate,
                format!("version '{reference}' not found"),
            ));
        }
        copy_tree(&from, dest)
            .map_err(|e| ComponentError::fetch(coordinate, format!("copy failed: {e}")))
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Recreate the link itself, as a git checkout would.
#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(std::fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::metadata(from)?.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("cannot copy directory link {}", from.display()),
        ));
    }
    std::fs::copy(from, to).map(|_| ())
}

/// Routes local coordinates to [`DirectorySource`] and everything else to [`GitSource`].
#[derive(Debug, Clone, Default)]
pub struct RoutedSource {
    git: GitSource,
    local: DirectorySource,
}

impl RoutedSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(&self, coordinate: &str) -> &dyn ComponentSource {
        if is_local_coordinate(coordinate) {
            &self.local
        } else {
            &self.git
        }
    }
}

#[async_trait]
impl ComponentSource for RoutedSource {
    async fn list_tags(&self, coordinate: &str) -> Result<Vec<VersionTag>> {
        self.route(coordinate).list_tags(coordinate).await
    }

    async fn fetch(&self, coordinate: &str, reference: &str, dest: &Path) -> Result<()> {
        self.route(coordinate).fetch(coordinate, reference, dest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ls_remote() {
        let stdout = "\
1111111111111111111111111111111111111111\trefs/tags/v1.0.0
2222222222222222222222222222222222222222\trefs/tags/v1.1.0
3333333333333333333333333333333333333333\trefs/heads/main
";
        let tags = parse_ls_remote(stdout);
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["v1.0.0", "v1.1.0"]);
    }

    #[test]
    fn test_local_coordinates() {
        assert!(is_local_coordinate("file:///srv/mirror/weather"));
        assert!(is_local_coordinate("/srv/mirror/weather"));
        assert!(!is_local_coordinate("https://github.com/acme/weather"));
        assert!(!is_local_coordinate("acme/weather"));
    }

    #[tokio::test]
    async fn test_directory_source_lists_and_fetches() {
        let Ok(mirror) = tempfile::tempdir() else {
            panic!("Failed to create temp dir");
        };
        let version_dir = mirror.path().join("1.0.0");
        if let Err(e) = std::fs::create_dir_all(version_dir.join("bin")) {
            panic!("Failed to create mirror: {e}");
        }
        if let Err(e) = std::fs::write(
            version_dir.join("component.toml"),
            "name = \"weather\"\nversion = \"1.0.0\"\n",
        ) {
            panic!("Failed to write manifest: {e}");
        }

        let source = DirectorySource;
        let coordinate = format!("file://{}", mirror.path().display());
        let tags = match source.list_tags(&coordinate).await {
            Ok(tags) => tags,
            Err(e) => panic!("list_tags failed: {e}"),
        };
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "1.0.0");
        assert!(tags[0].timestamp.is_some());

        match source.read_manifest(&coordinate, "1.0.0").await {
            Ok(manifest) => assert_eq!(manifest.name, "weather"),
            Err(e) => panic!("read_manifest failed: {e}"),
        }

        let Ok(dest) = tempfile::tempdir() else {
            panic!("Failed to create temp dir");
        };
        assert!(source.fetch(&coordinate, "9.9.9", dest.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_directory_source_refuses_escaping_references() {
        let Ok(root) = tempfile::tempdir() else {
            panic!("Failed to create temp dir");
        };
        let mirror = root.path().join("weather");
        if let Err(e) = std::fs::create_dir_all(&mirror) {
            panic!("Failed to create mirror: {e}");
        }
        if let Err(e) = std::fs::write(root.path().join("secret"), "outside the mirror") {
            panic!("Failed to write file: {e}");
        }

        let Ok(dest) = tempfile::tempdir() else {
            panic!("Failed to create temp dir");
        };
        let coordinate = format!("file://{}", mirror.display());
        for reference in ["..", ".", "../weather", "1.0.0/.."] {
            assert!(
                DirectorySource
                    .fetch(&coordinate, reference, dest.path())
                    .await
                    .is_err(),
                "{reference:?} should be refused"
            );
        }
        assert!(!dest.path().join("secret").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_directory_source_preserves_symlinks() {
        let Ok(mirror) = tempfile::tempdir() else {
            panic!("Failed to create temp dir");
        };
        let version_dir = mirror.path().join("1.0.0");
        if let Err(e) = std::fs::create_dir_all(version_dir.join("bin")) {
            panic!("Failed to create mirror: {e}");
        }
        if let Err(e) = std::fs::write(version_dir.join("bin/run"), "echo hi") {
            panic!("Failed to write file: {e}");
        }
        if let Err(e) = std::os::unix::fs::symlink("bin/run", version_dir.join("run")) {
            panic!("Failed to create link: {e}");
        }

        let Ok(dest) = tempfile::tempdir() else {
            panic!("Failed to create temp dir");
        };
        let coordinate = format!("file://{}", mirror.path().display());
        if let Err(e) = DirectorySource.fetch(&coordinate, "1.0.0", dest.path()).await {
            panic!("fetch failed: {e}");
        }
        match std::fs::read_link(dest.path().join("run")) {
            Ok(target) => assert_eq!(target, Path::new("bin/run")),
            Err(e) => panic!("expected a symlink: {e}"),
        }
    }
}
