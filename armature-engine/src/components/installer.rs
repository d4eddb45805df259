//! Fetching a component into a fresh isolated directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::context::ManagerContext;
use super::error::{ComponentError, Result};
use super::isolation::{
    self, DEPS_DIR, IsolationDescriptor, SOURCE_DIR, content_hash, dependency_command,
};
use super::manifest::ComponentManifest;
use super::resolver::ResolvedTarget;
use super::source::ComponentSource;

/// Lines of a failed dependency installer's stderr kept in the error.
const STDERR_TAIL_LINES: usize = 10;

/// Times a vanished per-name directory is recreated while allocating.
const ALLOCATE_ATTEMPTS: usize = 5;

/// A fully built, not yet committed install.
#[derive(Debug, Clone)]
pub struct InstallArtifact {
    pub name: String,
    pub version: String,
    pub source: String,
    pub reference: String,
    pub install_path: PathBuf,
    pub manifest: ComponentManifest,
    pub descriptor: IsolationDescriptor,
}

/// Builds installs in private directories and removes them again.
#[derive(Debug, Clone)]
pub struct IsolatedInstaller {
    source: Arc<dyn ComponentSource>,
}

impl IsolatedInstaller {
    pub fn new(source: Arc<dyn ComponentSource>) -> Self {
        Self { source }
    }

    /// Install `target` into a newly allocated directory.
    ///
    /// # Process
    ///
    /// 1. Allocate `<root>/components/<name>/<version>-<nonce>`
    /// 2. Fetch the source tree into `src/`
    /// 3. Load the manifest and check its name
    /// 4. Install dependencies into `deps/`
    /// 5. Write the isolation descriptor
    ///
    /// # Errors
    ///
    /// Returns `Fetch`, `Dependency` or `Isolation`. The allocated directory
    /// has already been removed when an error is returned.
    pub async fn install(
        &self,
        ctx: &ManagerContext,
        target: &ResolvedTarget,
    ) -> Result<InstallArtifact> {
        let install_path = allocate(ctx, target)?;
        info!(
            "Installing {} {} into {}",
            target.name,
            target.version,
            install_path.display()
        );

        match self.populate(ctx, target, &install_path).await {
            Ok(artifact) => Ok(artifact),
            Err(e) => {
                if let Err(purge_err) = self.purge_path(ctx, &install_path) {
                    warn!(
                        "Failed to remove {} after a failed install: {purge_err}",
                        install_path.display()
                    );
                }
                Err(e)
            }
        }
    }

    async fn populate(
        &self,
        ctx: &ManagerContext,
        target: &ResolvedTarget,
        install_path: &Path,
    ) -> Result<InstallArtifact> {
        let source_dir = install_path.join(SOURCE_DIR);

        tokio::time::timeout(
            ctx.fetch_timeout,
            self.source
                .fetch(&target.source, &target.reference, &source_dir),
        )
        .await
        .map_err(|_| {
            ComponentError::fetch(
                &target.name,
                format!("fetch timed out after {}s", ctx.fetch_timeout.as_secs()),
            )
        })??;
        debug!("Fetched {} ({})", target.source, target.reference);

        let manifest = ComponentManifest::load(&source_dir)
            .map_err(|e| ComponentError::fetch(&target.name, e.to_string()))?;
        if manifest.name != target.name {
            return Err(ComponentError::fetch(
                &target.name,
                format!(
                    "manifest declares name '{}' but '{}' was requested",
                    manifest.name, target.name
                ),
            ));
        }

        install_dependencies(ctx, &target.name, &manifest, install_path).await?;

        let hash = content_hash(&source_dir).map_err(|e| {
            ComponentError::isolation(&source_dir, format!("cannot hash source tree: {e}"))
        })?;
        let descriptor = IsolationDescriptor {
            component: target.name.clone(),
            version: target.version.clone(),
            source: target.source.clone(),
            reference: target.reference.clone(),
            strategy: manifest.dependencies.strategy,
            dependency_dir: DEPS_DIR.to_string(),
            content_hash: hash,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        descriptor.save(install_path)?;

        Ok(InstallArtifact {
            name: target.name.clone(),
            version: target.version.clone(),
            source: target.source.clone(),
            reference: target.reference.clone(),
            install_path: install_path.to_path_buf(),
            manifest,
            descriptor,
        })
    }

    /// Delete an artifact's directory tree.
    pub fn purge(&self, ctx: &ManagerContext, artifact: &InstallArtifact) -> Result<()> {
        self.purge_path(ctx, &artifact.install_path)
    }

    /// Delete an install directory. A missing path is not an error.
    ///
    /// # Errors
    ///
    /// Returns `Isolation` if `path` is not inside the components directory,
    /// or an I/O error if removal fails.
    pub fn purge_path(&self, ctx: &ManagerContext, path: &Path) -> Result<()> {
        if !ctx.owns(path) {
            return Err(ComponentError::isolation(
                path,
                "refusing to purge a path outside the components directory",
            ));
        }
        match std::fs::remove_dir_all(path) {
            Ok(()) => debug!("Purged {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Drop the per-name directory once its last install is gone.
        if let Some(parent) = path.parent()
            && parent != ctx.components_dir()
            && ctx.owns(parent)
        {
            let _ = std::fs::remove_dir(parent);
        }
        Ok(())
    }

    /// Check that an install directory is intact.
    ///
    /// Returns the manifest on success, or the first problem found.
    pub fn verify(
        &self,
        install_path: &Path,
        expected_name: &str,
    ) -> std::result::Result<ComponentManifest, String> {
        verify_install(install_path, expected_name)
    }
}

/// Allocate a never-before-used install directory with empty `src/` and `deps/`.
fn allocate(ctx: &ManagerContext, target: &ResolvedTarget) -> Result<PathBuf> {
    let parent = ctx.components_dir().join(&target.name);
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let dir_name = format!("{}-{}", path_safe(&target.version), &nonce[..8]);
    let install_path = parent.join(dir_name);

    create_install_dir(&install_path).map_err(|e| {
        ComponentError::isolation(&install_path, format!("cannot allocate install path: {e}"))
    })?;
    for sub in [SOURCE_DIR, DEPS_DIR] {
        if let Err(e) = std::fs::create_dir(install_path.join(sub)) {
            let _ = std::fs::remove_dir_all(&install_path);
            return Err(ComponentError::isolation(
                &install_path,
                format!("cannot create {sub}/: {e}"),
            ));
        }
    }
    Ok(install_path)
}

/// Create `install_path` non-recursively, recreating its per-name parent as
/// needed. A concurrent purge may remove an emptied parent at any point, so a
/// missing parent is retried a bounded number of times.
fn create_install_dir(install_path: &Path) -> std::io::Result<()> {
    let mut attempts = 0;
    loop {
        // Non-recursive: an existing directory is a collision, never reused.
        match std::fs::create_dir(install_path) {
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound && attempts < ALLOCATE_ATTEMPTS =>
            {
                attempts += 1;
                if let Some(parent) = install_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            result => return result,
        }
    }
}

fn path_safe(version: &str) -> String {
    version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn install_dependencies(
    ctx: &ManagerContext,
    name: &str,
    manifest: &ComponentManifest,
    install_path: &Path,
) -> Result<()> {
    let command = dependency_command(&manifest.dependencies, install_path)
        .map_err(|reason| ComponentError::isolation(install_path, reason))?;
    let Some(mut command) = command else {
        return Ok(());
    };

    info!(
        "Installing {} dependencies for {name}",
        manifest.dependencies.strategy
    );
    let dependency = |reason: String| ComponentError::Dependency {
        name: name.to_string(),
        reason,
    };

    let output = tokio::time::timeout(ctx.fetch_timeout, command.output())
        .await
        .map_err(|_| {
            dependency(format!(
                "timed out after {}s",
                ctx.fetch_timeout.as_secs()
            ))
        })?
        .map_err(|e| dependency(format!("failed to start installer: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
        return Err(dependency(format!("installer exited with {}: {tail}", output.status)));
    }
    Ok(())
}

pub(crate) fn verify_install(
    install_path: &Path,
    expected_name: &str,
) -> std::result::Result<ComponentManifest, String> {
    let source_dir = install_path.join(SOURCE_DIR);
    let manifest = ComponentManifest::load(&source_dir).map_err(|e| e.to_string())?;
    if manifest.name != expected_name {
        return Err(format!(
            "manifest names '{}' instead of '{expected_name}'",
            manifest.name
        ));
    }

    let descriptor = IsolationDescriptor::load(install_path)
        .map_err(|e| format!("isolation descriptor unreadable: {e}"))?;
    let hash = content_hash(&source_dir).map_err(|e| format!("cannot hash source tree: {e}"))?;
    if hash != descriptor.content_hash {
        return Err("source tree does not match its recorded content hash".to_string());
    }

    for entry in manifest.command_entries() {
        let relative = Path::new(entry);
        if !isolation::is_contained(relative) {
            return Err(format!("command entry '{entry}' escapes the install directory"));
        }
        if !source_dir.join(relative).is_file() {
            return Err(format!("command entry '{entry}' does not exist"));
        }
    }
    Ok(manifest)
}
