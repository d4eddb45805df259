//! Command surface binding.
//!
//! An installed component declares its commands in manifest metadata. The
//! binder turns each well-formed declaration into a [`CommandDescriptor`] and
//! registers an invocation handle under the command's name. Malformed
//! declarations are reported individually and never block their siblings.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::isolation::{COMPONENT_DIR_ENV, DEPS_DIR, DEPS_DIR_ENV, SOURCE_DIR, is_contained};
use super::resolver::is_valid_component_name;
use super::store::ComponentRecord;

/// A bound command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandDescriptor {
    pub component: String,
    pub name: String,
    pub summary: String,
    /// Entry point relative to the component's source root.
    pub entry: String,
    pub install_path: PathBuf,
}

impl CommandDescriptor {
    pub fn entry_path(&self) -> PathBuf {
        self.install_path.join(SOURCE_DIR).join(&self.entry)
    }
}

/// Something the host can invoke for a bound command.
pub trait Invocable: Send + Sync + std::fmt::Debug {
    fn descriptor(&self) -> &CommandDescriptor;

    /// Build a process ready to run with `args`.
    fn command(&self, args: &[String]) -> std::process::Command;
}

/// Runs a command's entry point as a child process inside its install directory.
#[derive(Debug, Clone)]
pub struct ProcessInvocable {
    descriptor: CommandDescriptor,
}

impl ProcessInvocable {
    pub fn new(descriptor: CommandDescriptor) -> Self {
        Self { descriptor }
    }
}

impl Invocable for ProcessInvocable {
    fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    fn command(&self, args: &[String]) -> std::process::Command {
        let install_path = &self.descriptor.install_path;
        let mut command = std::process::Command::new(self.descriptor.entry_path());
        command
            .args(args)
            .current_dir(install_path.join(SOURCE_DIR))
            .env(DEPS_DIR_ENV, install_path.join(DEPS_DIR))
            .env(COMPONENT_DIR_ENV, install_path);
        command
    }
}

/// A command declaration that could not be bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindFailure {
    pub component: String,
    /// Declared name, or the declaration's position when it has no usable name.
    pub command: String,
    pub reason: String,
}

/// Outcome of binding one component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BindReport {
    pub bound: Vec<CommandDescriptor>,
    pub failures: Vec<BindFailure>,
}

impl BindReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Dispatch table from command name to invocation handle.
#[derive(Debug, Default)]
pub struct CommandBinder {
    dispatch: HashMap<String, Arc<dyn Invocable>>,
}

impl CommandBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe a record's commands without registering anything.
    pub fn describe(record: &ComponentRecord) -> BindReport {
        let mut report = BindReport::default();
        if !record.is_installed() {
            return report;
        }
        let Some(install_path) = record.install_path.as_deref() else {
            return report;
        };
        let Some(commands) = record.metadata.get("commands") else {
            return report;
        };
        let Some(commands) = commands.as_array() else {
            report.failures.push(BindFailure {
                component: record.name.clone(),
                command: "commands".to_string(),
                reason: "'commands' must be an array of tables".to_string(),
            });
            return report;
        };

        let mut seen = BTreeSet::new();
        for (index, declaration) in commands.iter().enumerate() {
            match describe_one(&record.name, install_path, declaration) {
                Ok(descriptor) if !seen.insert(descriptor.name.clone()) => {
                    report.failures.push(BindFailure {
                        component: record.name.clone(),
                        command: descriptor.name,
                        reason: "declared more than once".to_string(),
                    });
                }
                Ok(descriptor) => report.bound.push(descriptor),
                Err((label, reason)) => report.failures.push(BindFailure {
                    component: record.name.clone(),
                    command: label.unwrap_or_else(|| format!("#{index}")),
                    reason,
                }),
            }
        }
        report
    }

    /// Register a record's commands, replacing any it registered before.
    ///
    /// A name already owned by another component is reported as a failure for
    /// that command only.
    pub fn bind(&mut self, record: &ComponentRecord) -> BindReport {
        self.unbind(&record.name);
        let mut report = Self::describe(record);

        let mut bound = Vec::with_capacity(report.bound.len());
        for descriptor in std::mem::take(&mut report.bound) {
            if let Some(owner) = self.dispatch.get(&descriptor.name) {
                report.failures.push(BindFailure {
                    component: record.name.clone(),
                    command: descriptor.name.clone(),
                    reason: format!(
                        "name already bound by component '{}'",
                        owner.descriptor().component
                    ),
                });
                continue;
            }
            self.dispatch.insert(
                descriptor.name.clone(),
                Arc::new(ProcessInvocable::new(descriptor.clone())),
            );
            bound.push(descriptor);
        }
        report.bound = bound;

        for failure in &report.failures {
            warn!(
                "Command '{}' of '{}' not bound: {}",
                failure.command, failure.component, failure.reason
            );
        }
        debug!("Bound {} command(s) for {}", report.bound.len(), record.name);
        report
    }

    /// Remove every command owned by `component`. Returns how many were removed.
    pub fn unbind(&mut self, component: &str) -> usize {
        let before = self.dispatch.len();
        self.dispatch
            .retain(|_, handle| handle.descriptor().component != component);
        before - self.dispatch.len()
    }

    pub fn resolve(&self, command: &str) -> Option<Arc<dyn Invocable>> {
        self.dispatch.get(command).cloned()
    }

    /// Bound commands ordered by name.
    pub fn commands(&self) -> Vec<CommandDescriptor> {
        let mut commands: Vec<CommandDescriptor> = self
            .dispatch
            .values()
            .map(|handle| handle.descriptor().clone())
            .collect();
        commands.sort_by(|a, b| a.name.cmp(&b.name));
        commands
    }
}

type DescribeError = (Option<String>, String);

fn describe_one(
    component: &str,
    install_path: &Path,
    declaration: &toml::Value,
) -> Result<CommandDescriptor, DescribeError> {
    let Some(table) = declaration.as_table() else {
        return Err((None, "declaration is not a table".to_string()));
    };
    let name = table.get("name").and_then(toml::Value::as_str);
    let label = name.map(str::to_string);

    let Some(name) = name else {
        return Err((None, "missing 'name'".to_string()));
    };
    if !is_valid_component_name(name) {
        return Err((label, format!("'{name}' is not a valid command name")));
    }
    let Some(entry) = table.get("entry").and_then(toml::Value::as_str) else {
        return Err((label, "missing 'entry'".to_string()));
    };
    if !is_contained(Path::new(entry)) {
        return Err((label, format!("entry '{entry}' escapes the install directory")));
    }
    let summary = table
        .get("summary")
        .and_then(toml::Value::as_str)
        .unwrap_or_default();

    Ok(CommandDescriptor {
        component: component.to_string(),
        name: name.to_string(),
        summary: summary.to_string(),
        entry: entry.to_string(),
        install_path: install_path.to_path_buf(),
    })
}
