//! Component lifecycle: install, update, uninstall, rollback.
//!
//! Every mutation follows the same shape: build the new install in a fresh
//! directory without holding any lock, verify it, then commit the registry
//! change in one locked transaction that first checks the record's revision
//! is still the one observed when the operation started. Losing that check
//! purges the new directory and reports `ConcurrentModification`.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use super::binder::{BindReport, CommandBinder};
use super::context::ManagerContext;
use super::error::{ComponentError, Result};
use super::installer::{InstallArtifact, IsolatedInstaller, verify_install};
use super::resolver::{ManifestResolver, ResolvedTarget};
use super::store::{ComponentRecord, ComponentStatus, PriorInstall, RegistryStore};

/// Result of a successful install or update.
#[derive(Debug, Clone)]
pub struct LifecycleReport {
    pub record: ComponentRecord,
    /// Version that was installed before, if any.
    pub previous_version: Option<String>,
    pub bound: BindReport,
}

/// What `install` or `update` ended up doing.
#[derive(Debug, Clone)]
pub enum InstallOutcome {
    Installed(LifecycleReport),
    Updated(LifecycleReport),
    /// The installed version already is the resolved one. Nothing changed.
    UpToDate(ComponentRecord),
}

impl InstallOutcome {
    pub fn record(&self) -> &ComponentRecord {
        match self {
            Self::Installed(report) | Self::Updated(report) => &report.record,
            Self::UpToDate(record) => record,
        }
    }
}

/// A problem found by [`ComponentManager::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ValidationIssue {
    /// A recorded install no longer verifies.
    Broken {
        name: String,
        path: Option<PathBuf>,
        reason: String,
    },
    /// A record persisted in a status that should never be observable.
    Transitional { name: String, status: String },
    /// An install directory that no record owns.
    Orphan { path: PathBuf },
}

/// A verified rollback target and the record revision it was chosen against.
#[derive(Debug)]
struct RollbackPlan {
    observed: u64,
    record: ComponentRecord,
}

/// Orchestrates the registry, resolver, installer and binder.
#[derive(Debug)]
pub struct ComponentManager {
    store: RegistryStore,
    resolver: ManifestResolver,
    installer: IsolatedInstaller,
    binder: Arc<Mutex<CommandBinder>>,
}

impl ComponentManager {
    pub fn new(
        store: RegistryStore,
        resolver: ManifestResolver,
        installer: IsolatedInstaller,
    ) -> Self {
        Self {
            store,
            resolver,
            installer,
            binder: Arc::new(Mutex::new(CommandBinder::new())),
        }
    }

    /// Share an existing dispatch table instead of a private one.
    pub fn with_binder(mut self, binder: Arc<Mutex<CommandBinder>>) -> Self {
        self.binder = binder;
        self
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn resolver(&self) -> &ManifestResolver {
        &self.resolver
    }

    pub fn binder(&self) -> Arc<Mutex<CommandBinder>> {
        Arc::clone(&self.binder)
    }

    fn dispatch(&self) -> MutexGuard<'_, CommandBinder> {
        match self.binder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Install a component by identifier.
    ///
    /// An identifier naming an already installed component is handled as an
    /// update to the resolved version.
    ///
    /// # Errors
    ///
    /// - `InvalidIdentifier` / `Fetch` from resolution
    /// - `Fetch`, `Dependency`, `Isolation` from the installer
    /// - `Verification` if the new install does not verify
    /// - `ConcurrentModification` if another writer committed first
    ///
    /// On every error the registry is unchanged and no new directory remains.
    pub async fn install(&self, ctx: &ManagerContext, identifier: &str) -> Result<InstallOutcome> {
        let target = self.resolver.resolve(identifier).await?;
        let existing = self.store.find(&target.name)?;
        if let Some(current) = existing.as_ref().filter(|r| r.is_installed()) {
            info!(
                "{} is already installed at {}; updating",
                current.name, current.version
            );
            return self.update_to(ctx, target).await;
        }

        let observed = existing.as_ref().map(|r| r.revision);
        let artifact = self.build(ctx, &target).await?;
        let (record, pruned) = self.commit(ctx, &artifact, observed)?;
        self.retire(ctx, pruned);
        info!("Installed {} {}", record.name, record.version);

        let bound = self.dispatch().bind(&record);
        Ok(InstallOutcome::Installed(LifecycleReport {
            record,
            previous_version: None,
            bound,
        }))
    }

    /// Update an installed component to the latest version of its recorded source.
    ///
    /// # Errors
    ///
    /// `NotInstalled` if `name` has no installed record; otherwise as [`install`](Self::install).
    pub async fn update(&self, ctx: &ManagerContext, name: &str) -> Result<InstallOutcome> {
        let current = self.installed_record(name)?;
        let target = self
            .resolver
            .resolve_latest(&current.name, &current.source)
            .await?;
        self.update_to(ctx, target).await
    }

    /// Update every installed component, continuing past individual failures.
    pub async fn update_all(
        &self,
        ctx: &ManagerContext,
    ) -> Result<Vec<(String, Result<InstallOutcome>)>> {
        let mut outcomes = Vec::new();
        for record in self.store.all()?.into_iter().filter(|r| r.is_installed()) {
            let outcome = self.update(ctx, &record.name).await;
            if let Err(e) = &outcome {
                warn!("Update of {} failed at {}: {e}", record.name, e.stage());
            }
            outcomes.push((record.name, outcome));
        }
        Ok(outcomes)
    }

    /// Replace the installed version of `target.name` with `target`.
    pub async fn update_to(
        &self,
        ctx: &ManagerContext,
        target: ResolvedTarget,
    ) -> Result<InstallOutcome> {
        let current = self.installed_record(&target.name)?;
        if current.version == target.version {
            info!("{} is up to date ({})", current.name, current.version);
            return Ok(InstallOutcome::UpToDate(current));
        }

        let artifact = self.build(ctx, &target).await?;
        let (record, pruned) = self.commit(ctx, &artifact, Some(current.revision))?;
        self.retire(ctx, pruned);
        info!(
            "Updated {} {} -> {}",
            record.name, current.version, record.version
        );

        let bound = self.dispatch().bind(&record);
        Ok(InstallOutcome::Updated(LifecycleReport {
            record,
            previous_version: Some(current.version),
            bound,
        }))
    }

    /// Uninstall a component. Returns `false` if there was nothing to uninstall.
    ///
    /// The record is kept with status `uninstalled` so its retained history
    /// stays available to [`rollback`](Self::rollback).
    pub fn uninstall(&self, ctx: &ManagerContext, name: &str) -> Result<bool> {
        let removed = self.store.transact(|data| {
            let Some(record) = data.get(name).cloned() else {
                return Ok(None);
            };
            if record.status == ComponentStatus::Uninstalled {
                return Ok(None);
            }
            let path = record.install_path.clone();
            data.put(ComponentRecord {
                status: ComponentStatus::Uninstalled,
                install_path: None,
                ..record
            });
            Ok(Some(path))
        })?;

        let Some(path) = removed else {
            return Ok(false);
        };
        if let Some(path) = path
            && let Err(e) = self.installer.purge_path(ctx, &path)
        {
            warn!("Failed to purge {}: {e}", path.display());
        }
        self.dispatch().unbind(name);
        info!("Uninstalled {name}");
        Ok(true)
    }

    /// Re-activate the most recent retained install of `name`.
    ///
    /// The currently installed version, if any, becomes the newest retained
    /// entry. Retained entries whose directories have disappeared are dropped.
    ///
    /// # Errors
    ///
    /// `NoRollbackTarget` if no retained install still verifies on disk;
    /// `ConcurrentModification` if the record changed while the target was
    /// being verified.
    pub fn rollback(&self, ctx: &ManagerContext, name: &str) -> Result<ComponentRecord> {
        let plan = self.plan_rollback(ctx, name)?;
        let record = self.commit_rollback(plan)?;
        info!("Rolled back {} to {}", record.name, record.version);
        self.dispatch().bind(&record);
        Ok(record)
    }

    /// Pick and verify the rollback target without holding the registry lock.
    fn plan_rollback(&self, ctx: &ManagerContext, name: &str) -> Result<RollbackPlan> {
        let no_target = || ComponentError::NoRollbackTarget {
            name: name.to_string(),
        };

        let current = self.store.find(name)?.ok_or_else(no_target)?;
        let mut previous: Vec<PriorInstall> = current
            .previous
            .iter()
            .filter(|p| ctx.owns(&p.install_path) && p.install_path.is_dir())
            .cloned()
            .collect();
        let index = previous
            .iter()
            .rposition(|p| verify_install(&p.install_path, name).is_ok())
            .ok_or_else(no_target)?;
        let restored = previous.remove(index);

        if current.is_installed()
            && let Some(prior) = current.to_prior()
        {
            previous.push(prior);
        }

        Ok(RollbackPlan {
            observed: current.revision,
            record: ComponentRecord {
                name: current.name.clone(),
                source: restored.source,
                version: restored.version,
                install_path: Some(restored.install_path),
                status: ComponentStatus::Installed,
                installed_at: restored.installed_at,
                revision: 0,
                metadata: restored.metadata,
                previous,
            },
        })
    }

    /// Store a planned rollback if the record is unchanged since planning.
    fn commit_rollback(&self, plan: RollbackPlan) -> Result<ComponentRecord> {
        let RollbackPlan { observed, record } = plan;
        self.store.transact(|data| {
            if data.get(&record.name).map(|r| r.revision) != Some(observed) {
                return Err(ComponentError::ConcurrentModification {
                    name: record.name.clone(),
                });
            }
            let revision = data.put(record.clone());
            Ok(ComponentRecord { revision, ..record })
        })
    }

    /// All records, ordered by name.
    pub fn list(&self) -> Result<Vec<ComponentRecord>> {
        self.store.all()
    }

    pub fn is_installed(&self, name: &str) -> Result<bool> {
        self.store.is_installed(name)
    }

    /// Report installs that no longer verify, records left in a transitional
    /// status, and install directories no record owns. Repairs nothing.
    pub fn validate(&self, ctx: &ManagerContext) -> Result<Vec<ValidationIssue>> {
        let records = self.store.all()?;
        let mut issues = Vec::new();
        let mut owned = BTreeSet::new();

        for record in &records {
            owned.extend(record.referenced_paths().map(Path::to_path_buf));
            match record.status {
                ComponentStatus::Installing | ComponentStatus::Failed => {
                    issues.push(ValidationIssue::Transitional {
                        name: record.name.clone(),
                        status: record.status.to_string(),
                    });
                }
                ComponentStatus::Installed => {
                    let path = record.install_path.clone();
                    let verdict = match path.as_deref() {
                        Some(path) => verify_install(path, &record.name).err(),
                        None => Some("no install path recorded".to_string()),
                    };
                    if let Some(reason) = verdict {
                        issues.push(ValidationIssue::Broken {
                            name: record.name.clone(),
                            path,
                            reason,
                        });
                    }
                }
                ComponentStatus::Uninstalled => {}
            }
            for prior in &record.previous {
                if !prior.install_path.is_dir() {
                    issues.push(ValidationIssue::Broken {
                        name: record.name.clone(),
                        path: Some(prior.install_path.clone()),
                        reason: format!("retained install of {} is missing", prior.version),
                    });
                }
            }
        }

        for path in install_dirs(&ctx.components_dir())? {
            if !owned.contains(&path) {
                issues.push(ValidationIssue::Orphan { path });
            }
        }
        Ok(issues)
    }

    /// Bind the commands of every installed component.
    pub fn bind_installed(&self) -> Result<Vec<BindReport>> {
        let records = self.store.all()?;
        let mut binder = self.dispatch();
        Ok(records
            .iter()
            .filter(|r| r.is_installed())
            .map(|r| binder.bind(r))
            .collect())
    }

    fn installed_record(&self, name: &str) -> Result<ComponentRecord> {
        self.store
            .find(name)?
            .filter(ComponentRecord::is_installed)
            .ok_or_else(|| ComponentError::NotInstalled {
                name: name.to_string(),
            })
    }

    /// Install into a fresh directory and verify it. Nothing remains on error.
    async fn build(&self, ctx: &ManagerContext, target: &ResolvedTarget) -> Result<InstallArtifact> {
        let artifact = self.installer.install(ctx, target).await?;
        if let Err(reason) = self.installer.verify(&artifact.install_path, &artifact.name) {
            self.discard(ctx, &artifact);
            return Err(ComponentError::Verification {
                name: artifact.name,
                reason,
            });
        }
        Ok(artifact)
    }

    /// Purge installs that fell out of the retention window.
    fn retire(&self, ctx: &ManagerContext, pruned: Vec<PathBuf>) {
        for path in pruned {
            if let Err(e) = self.installer.purge_path(ctx, &path) {
                warn!("Failed to purge superseded install {}: {e}", path.display());
            }
        }
    }

    fn discard(&self, ctx: &ManagerContext, artifact: &InstallArtifact) {
        if let Err(e) = self.installer.purge(ctx, artifact) {
            warn!(
                "Failed to purge {}: {e}",
                artifact.install_path.display()
            );
        }
    }

    /// Commit `artifact` as the installed version if the record's revision is
    /// still `observed`. Returns the committed record and the retained
    /// installs that fell out of the retention window.
    fn commit(
        &self,
        ctx: &ManagerContext,
        artifact: &InstallArtifact,
        observed: Option<u64>,
    ) -> Result<(ComponentRecord, Vec<PathBuf>)> {
        let name = artifact.name.as_str();
        let committed = self.store.transact(|data| {
            let current = data.get(name);
            if current.map(|r| r.revision) != observed {
                return Err(ComponentError::ConcurrentModification {
                    name: name.to_string(),
                });
            }

            let mut previous = current.map(|r| r.previous.clone()).unwrap_or_default();
            if let Some(prior) = current
                .filter(|r| r.is_installed())
                .and_then(ComponentRecord::to_prior)
            {
                previous.push(prior);
            }
            let excess = previous.len().saturating_sub(ctx.retain_previous);
            let pruned: Vec<PathBuf> = previous
                .drain(..excess)
                .map(|p| p.install_path)
                .collect();

            let record = ComponentRecord {
                name: artifact.name.clone(),
                source: artifact.source.clone(),
                version: artifact.version.clone(),
                install_path: Some(artifact.install_path.clone()),
                status: ComponentStatus::Installed,
                installed_at: chrono::Utc::now().to_rfc3339(),
                revision: 0,
                metadata: artifact.manifest.to_metadata(),
                previous,
            };
            let revision = data.put(record.clone());
            Ok((ComponentRecord { revision, ..record }, pruned))
        });

        if let Err(e) = &committed {
            warn!("Commit of {name} failed: {e}");
            self.discard(ctx, artifact);
        }
        committed
    }
}

/// Install directories (`components/<name>/<dir>`) present on disk.
fn install_dirs(components_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let names = match std::fs::read_dir(components_dir) {
        Ok(names) => names,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e.into()),
    };
    for name in names {
        let name = name?;
        if !name.file_type()?.is_dir() {
            continue;
        }
        for install in std::fs::read_dir(name.path())? {
            let install = install?;
            if install.file_type()?.is_dir() {
                dirs.push(install.path());
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}
