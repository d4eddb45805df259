//! Update detection.
//!
//! Checking for updates touches the network, so it only happens for a person
//! at an interactive terminal: never under automation, never in a test
//! context, and never when nothing is installed. The check itself is
//! read-only.

use serde::Serialize;
use std::io::IsTerminal;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::Result;
use super::manifest::UpdatePriority;
use super::resolver::{ManifestResolver, is_newer};
use super::store::RegistryStore;

/// Environment variables whose presence marks an automated run.
pub const AUTOMATION_SIGNALS: &[&str] = &[
    "CI",
    "CONTINUOUS_INTEGRATION",
    "BUILD_NUMBER",
    "RUN_ID",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "CIRCLECI",
    "TRAVIS",
    "JENKINS_URL",
    "BUILDKITE",
    "TEAMCITY_VERSION",
    "TF_BUILD",
    "BITBUCKET_BUILD_NUMBER",
    "CODEBUILD_BUILD_ID",
    "DRONE",
];

/// Set, non-empty, and not `0` or `false`.
fn signal_present(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Names of the automation signals present in `lookup`.
pub fn detect_automation<F>(lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    AUTOMATION_SIGNALS
        .iter()
        .filter(|name| lookup(name).is_some_and(|v| signal_present(&v)))
        .map(|name| name.to_string())
        .collect()
}

/// What the gate knows about the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSignals {
    pub interactive: bool,
    pub automation: Vec<String>,
    pub test_context: bool,
}

impl EnvironmentSignals {
    /// Observe the real process environment.
    pub fn capture(test_mode: bool) -> Self {
        Self {
            interactive: std::io::stdout().is_terminal(),
            automation: detect_automation(|name| std::env::var(name).ok()),
            test_context: test_mode || cfg!(test),
        }
    }

    /// Build from explicit values, for callers that already know them.
    pub fn from_vars(interactive: bool, vars: &[(&str, &str)], test_context: bool) -> Self {
        let automation = detect_automation(|name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        });
        Self {
            interactive,
            automation,
            test_context,
        }
    }
}

/// An installed component with a newer release available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateDelta {
    pub component_name: String,
    pub current_version: String,
    pub latest_version: String,
    pub priority: UpdatePriority,
}

/// Decides whether to look for updates and computes what is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePolicy {
    enabled: bool,
    test_mode: bool,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdatePolicy {
    pub fn new() -> Self {
        Self {
            enabled: true,
            test_mode: false,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    /// Gate evaluated against the real process environment.
    pub fn should_check(&self, store: &RegistryStore) -> bool {
        self.should_check_with(&EnvironmentSignals::capture(self.test_mode), store)
    }

    /// Gate evaluated against `signals`. Short-circuits in order: enabled,
    /// interactive, no automation, not a test, at least one install.
    pub fn should_check_with(&self, signals: &EnvironmentSignals, store: &RegistryStore) -> bool {
        if !self.enabled {
            debug!("Update checks disabled by configuration");
            return false;
        }
        if !signals.interactive {
            debug!("Skipping update check: not an interactive terminal");
            return false;
        }
        if !signals.automation.is_empty() {
            debug!(
                "Skipping update check: automation detected ({})",
                signals.automation.join(", ")
            );
            return false;
        }
        if signals.test_context {
            debug!("Skipping update check: test context");
            return false;
        }
        match store.installed_count() {
            Ok(0) => {
                debug!("Skipping update check: nothing installed");
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!("Skipping update check: {e}");
                false
            }
        }
    }

    /// Compare every installed component against its latest release.
    ///
    /// Lookup failures for individual components are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the registry itself cannot be read.
    pub async fn compute_deltas(
        &self,
        store: &RegistryStore,
        resolver: &ManifestResolver,
    ) -> Result<Vec<UpdateDelta>> {
        let mut deltas = Vec::new();
        for record in store.all()?.into_iter().filter(|r| r.is_installed()) {
            let latest = match resolver.resolve_latest(&record.name, &record.source).await {
                Ok(latest) => latest,
                Err(e) => {
                    warn!("Update lookup for {} failed: {e}", record.name);
                    continue;
                }
            };
            if !is_newer(&latest.version, &record.version) {
                continue;
            }
            let manifest = match resolver.latest_manifest(&latest).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("Reading the latest manifest of {} failed: {e}", record.name);
                    continue;
                }
            };
            deltas.push(UpdateDelta {
                component_name: record.name,
                current_version: record.version,
                latest_version: latest.version,
                priority: manifest.priority.unwrap_or_default(),
            });
        }
        Ok(deltas)
    }

    /// Run the gate and, if it opens, the delta computation on a background task.
    pub fn spawn_background_check(
        &self,
        store: RegistryStore,
        resolver: ManifestResolver,
    ) -> JoinHandle<Vec<UpdateDelta>> {
        let policy = *self;
        tokio::spawn(async move {
            if !policy.should_check(&store) {
                return Vec::new();
            }
            match policy.compute_deltas(&store, &resolver).await {
                Ok(deltas) => deltas,
                Err(e) => {
                    warn!("Background update check failed: {e}");
                    Vec::new()
                }
            }
        })
    }
}
