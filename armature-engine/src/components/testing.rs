//! Test doubles shared by the component tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Barrier;

use super::context::ManagerContext;
use super::error::{ComponentError, Result};
use super::installer::IsolatedInstaller;
use super::manager::ComponentManager;
use super::resolver::{ManifestResolver, ResolvedTarget, normalize_version};
use super::source::{ComponentSource, VersionTag};
use super::store::RegistryStore;

#[derive(Debug, Clone)]
struct FixtureVersion {
    timestamp: DateTime<Utc>,
    files: BTreeMap<String, String>,
}

/// In-memory component source keyed by the last segment of the coordinate.
#[derive(Debug, Default)]
pub struct FixtureSource {
    components: Mutex<BTreeMap<String, BTreeMap<String, FixtureVersion>>>,
    fail_fetch: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
    barrier: Mutex<Option<Arc<Barrier>>>,
    lookups: AtomicUsize,
    published: AtomicUsize,
}

fn component_key(coordinate: &str) -> String {
    let last = coordinate
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(coordinate);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}

impl FixtureSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish `tag` of `name` with the given manifest and extra files.
    pub fn add_version(&self, name: &str, tag: &str, manifest: &str, files: &[(&str, &str)]) {
        let mut contents: BTreeMap<String, String> = files
            .iter()
            .map(|(path, body)| (path.to_string(), body.to_string()))
            .collect();
        contents.insert("component.toml".to_string(), manifest.to_string());

        // Later publications get later timestamps.
        let sequence = self.published.fetch_add(1, Ordering::SeqCst) as i64;
        let timestamp = Utc::now() + ChronoDuration::seconds(sequence);
        if let Ok(mut components) = self.components.lock() {
            components.entry(name.to_string()).or_default().insert(
                tag.to_string(),
                FixtureVersion {
                    timestamp,
                    files: contents,
                },
            );
        }
    }

    /// Publish a release with one command, `run`, and an optional priority.
    pub fn add_release(&self, name: &str, tag: &str, priority: Option<&str>) {
        let version = normalize_version(tag);
        let priority = priority
            .map(|p| format!("priority = \"{p}\"\n"))
            .unwrap_or_default();
        let manifest = format!(
            "name = \"{name}\"\nversion = \"{version}\"\ndescription = \"{name} component\"\n{priority}\n[[commands]]\nname = \"run\"\nsummary = \"Run {name}\"\nentry = \"bin/run\"\n"
        );
        let script = format!("#!/bin/sh\necho {name} {version}\n");
        self.add_version(name, tag, &manifest, &[("bin/run", script.as_str())]);
    }

    pub fn add_component_version(&self, name: &str, tag: &str) {
        self.add_release(name, tag, None);
    }

    pub fn remove_component(&self, name: &str) {
        if let Ok(mut components) = self.components.lock() {
            components.remove(name);
        }
    }

    /// Make every fetch write a partial tree and then fail.
    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.fetch_delay.lock() {
            *slot = Some(delay);
        }
    }

    /// Make every fetch wait on `barrier` before writing anything.
    pub fn set_barrier(&self, barrier: Arc<Barrier>) {
        if let Ok(mut slot) = self.barrier.lock() {
            *slot = Some(barrier);
        }
    }

    /// Number of tag listings served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn version(&self, coordinate: &str, reference: &str) -> Option<FixtureVersion> {
        let components = self.components.lock().ok()?;
        components
            .get(&component_key(coordinate))?
            .get(reference)
            .cloned()
    }
}

#[async_trait]
impl ComponentSource for FixtureSource {
    async fn list_tags(&self, coordinate: &str) -> Result<Vec<VersionTag>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let components = self
            .components
            .lock()
            .map_err(|_| ComponentError::fetch(coordinate, "fixture poisoned"))?;
        let versions = components
            .get(&component_key(coordinate))
            .ok_or_else(|| ComponentError::fetch(coordinate, "repository not found"))?;
        Ok(versions
            .iter()
            .map(|(tag, version)| VersionTag {
                name: tag.clone(),
                timestamp: Some(version.timestamp),
            })
            .collect())
    }

    async fn fetch(&self, coordinate: &str, reference: &str, dest: &Path) -> Result<()> {
        let barrier = self.barrier.lock().ok().and_then(|slot| slot.clone());
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        let delay = self.fetch_delay.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_fetch.load(Ordering::SeqCst) {
            std::fs::write(dest.join("partial"), "half a download")?;
            return Err(ComponentError::fetch(coordinate, "connection reset"));
        }

        let version = self
            .version(coordinate, reference)
            .ok_or_else(|| ComponentError::fetch(coordinate, format!("no ref '{reference}'")))?;
        for (relative, body) in &version.files {
            let path = dest.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, body)?;
        }
        Ok(())
    }
}

/// A resolved target for `name` at `tag`, as the GitHub shorthand would produce.
pub fn target(name: &str, tag: &str) -> ResolvedTarget {
    ResolvedTarget {
        name: name.to_string(),
        source: format!("https://github.com/acme/{name}"),
        reference: tag.to_string(),
        version: normalize_version(tag),
        pinned: true,
    }
}

/// A manager over a temporary storage root and a fixture source.
pub struct TestHarness {
    pub ctx: ManagerContext,
    pub source: Arc<FixtureSource>,
    pub manager: ComponentManager,
    _root: TempDir,
}

/// Build a harness whose catalog knows `weather`, `notes` and `spotify`.
pub fn harness() -> TestHarness {
    let Ok(root) = TempDir::new() else {
        panic!("Failed to create temp dir");
    };
    let ctx = ManagerContext::new(root.path())
        .with_fetch_timeout(Duration::from_secs(5))
        .with_retain_previous(1);
    let source = FixtureSource::new();

    let catalog: BTreeMap<String, String> = ["weather", "notes", "spotify"]
        .into_iter()
        .map(|name| (name.to_string(), format!("acme/{name}")))
        .collect();
    let resolver = ManifestResolver::new(source.clone(), catalog, Duration::from_secs(5));
    let installer = IsolatedInstaller::new(source.clone());
    let Ok(store) = RegistryStore::open(root.path()) else {
        panic!("Failed to open registry");
    };

    TestHarness {
        ctx,
        source,
        manager: ComponentManager::new(store, resolver, installer),
        _root: root,
    }
}
