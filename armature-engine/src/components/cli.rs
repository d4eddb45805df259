//! CLI commands and output formatting for component management.

use anyhow::Context;
use clap::Subcommand;
use std::io::IsTerminal;
use std::sync::Arc;

use super::context::ManagerContext;
use super::error::ComponentError;
use super::installer::IsolatedInstaller;
use super::manager::{ComponentManager, InstallOutcome, LifecycleReport, ValidationIssue};
use super::resolver::ManifestResolver;
use super::source::RoutedSource;
use super::store::{ComponentRecord, RegistryStore};
use super::updates::{UpdateDelta, UpdatePolicy};
use crate::config::ArmatureConfig;

/// Component subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ComponentCommand {
    /// Install a component by name, owner/repo, URL or local path
    Install {
        /// Component identifier, optionally pinned with @version
        identifier: String,
    },

    /// Update installed component(s) to the latest release
    Update {
        /// Name of the component (default: all)
        name: Option<String>,
    },

    /// Uninstall a component
    Uninstall {
        /// Name of the component
        name: String,
    },

    /// Re-activate the previously installed version
    Rollback {
        /// Name of the component
        name: String,
    },

    /// List components known to the registry
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check installs against the registry without repairing anything
    Validate {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show components with newer releases
    CheckUpdates {
        /// Check even when not at an interactive terminal
        #[arg(long)]
        force: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the commands contributed by installed components
    Commands {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Everything a command needs, built from configuration.
struct Runtime {
    ctx: ManagerContext,
    manager: ComponentManager,
    policy: UpdatePolicy,
}

impl Runtime {
    fn new(config: &ArmatureConfig) -> anyhow::Result<Self> {
        let ctx = ManagerContext::from_config(config);
        let store = RegistryStore::open(&ctx.storage_root).with_context(|| {
            format!("Failed to open storage root {}", ctx.storage_root.display())
        })?;
        let source = Arc::new(RoutedSource::new());
        let resolver =
            ManifestResolver::new(source.clone(), config.catalog.clone(), ctx.fetch_timeout);
        let installer = IsolatedInstaller::new(source);
        let policy = UpdatePolicy::new()
            .with_enabled(config.updates.enabled)
            .with_test_mode(config.updates.test_mode);

        Ok(Self {
            ctx,
            manager: ComponentManager::new(store, resolver, installer),
            policy,
        })
    }
}

/// Attach the failing stage to a component error.
fn staged(err: ComponentError) -> anyhow::Error {
    let stage = err.stage();
    anyhow::Error::new(err).context(format!("{stage} stage failed"))
}

/// Execute a component command.
pub async fn execute(command: ComponentCommand, config: &ArmatureConfig) -> anyhow::Result<()> {
    let runtime = Runtime::new(config)?;

    match command {
        ComponentCommand::Install { identifier } => handle_install(&runtime, &identifier).await,
        ComponentCommand::Update { name } => handle_update(&runtime, name).await,
        ComponentCommand::Uninstall { name } => handle_uninstall(&runtime, &name),
        ComponentCommand::Rollback { name } => handle_rollback(&runtime, &name),
        ComponentCommand::List { json } => handle_list(&runtime, json).await,
        ComponentCommand::Validate { json } => handle_validate(&runtime, json),
        ComponentCommand::CheckUpdates { force, json } => {
            handle_check_updates(&runtime, force, json).await
        }
        ComponentCommand::Commands { json } => handle_commands(&runtime, json),
    }
}

async fn handle_install(runtime: &Runtime, identifier: &str) -> anyhow::Result<()> {
    let outcome = runtime
        .manager
        .install(&runtime.ctx, identifier)
        .await
        .map_err(staged)?;
    report_outcome(&outcome);
    Ok(())
}

async fn handle_update(runtime: &Runtime, name: Option<String>) -> anyhow::Result<()> {
    if let Some(name) = name {
        let outcome = runtime
            .manager
            .update(&runtime.ctx, &name)
            .await
            .map_err(staged)?;
        report_outcome(&outcome);
        return Ok(());
    }

    let outcomes = runtime
        .manager
        .update_all(&runtime.ctx)
        .await
        .map_err(staged)?;
    let mut failed = 0usize;
    for (name, outcome) in outcomes {
        match outcome {
            Ok(outcome) => report_outcome(&outcome),
            Err(e) => {
                failed += 1;
                eprintln!("{name}: {} stage failed: {e}", e.stage());
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} component(s) failed to update");
    }
    Ok(())
}

fn handle_uninstall(runtime: &Runtime, name: &str) -> anyhow::Result<()> {
    if runtime
        .manager
        .uninstall(&runtime.ctx, name)
        .map_err(staged)?
    {
        eprintln!("Uninstalled {name}");
    } else {
        eprintln!("{name} is not installed");
    }
    Ok(())
}

fn handle_rollback(runtime: &Runtime, name: &str) -> anyhow::Result<()> {
    let record = runtime
        .manager
        .rollback(&runtime.ctx, name)
        .map_err(staged)?;
    eprintln!("Rolled back {} to {}", record.name, record.version);
    Ok(())
}

async fn handle_list(runtime: &Runtime, json: bool) -> anyhow::Result<()> {
    let records = runtime.manager.list().map_err(staged)?;

    if json {
        println!("{}", format_json(&records)?);
        return Ok(());
    }

    let updates = runtime.policy.spawn_background_check(
        runtime.manager.store().clone(),
        runtime.manager.resolver().clone(),
    );
    format_table(
        &["NAME", "VERSION", "STATUS", "INSTALLED", "SOURCE"],
        records.iter().map(record_row).collect(),
    );

    match updates.await {
        Ok(deltas) if !deltas.is_empty() => {
            eprintln!();
            for delta in &deltas {
                eprintln!(
                    "Update available: {} {} -> {} ({})",
                    delta.component_name,
                    delta.current_version,
                    delta.latest_version,
                    delta.priority
                );
            }
        }
        Ok(_) => {}
        Err(e) => tracing::debug!("Update check task ended abnormally: {e}"),
    }
    Ok(())
}

fn handle_validate(runtime: &Runtime, json: bool) -> anyhow::Result<()> {
    let issues = runtime.manager.validate(&runtime.ctx).map_err(staged)?;

    if json {
        println!("{}", format_json(&issues)?);
    } else if issues.is_empty() {
        eprintln!("All components verified");
    } else {
        format_table(
            &["KIND", "COMPONENT", "PATH", "DETAIL"],
            issues.iter().map(issue_row).collect(),
        );
    }

    if !issues.is_empty() {
        anyhow::bail!("{} problem(s) found", issues.len());
    }
    Ok(())
}

async fn handle_check_updates(runtime: &Runtime, force: bool, json: bool) -> anyhow::Result<()> {
    let store = runtime.manager.store();
    if !force && !runtime.policy.should_check(store) {
        eprintln!("Update check skipped (use --force to check anyway)");
        return Ok(());
    }

    let deltas = runtime
        .policy
        .compute_deltas(store, runtime.manager.resolver())
        .await
        .map_err(staged)?;

    if json {
        println!("{}", format_json(&deltas)?);
    } else {
        format_table(
            &["NAME", "CURRENT", "LATEST", "PRIORITY"],
            deltas.iter().map(delta_row).collect(),
        );
    }
    Ok(())
}

fn handle_commands(runtime: &Runtime, json: bool) -> anyhow::Result<()> {
    let reports = runtime.manager.bind_installed().map_err(staged)?;
    for failure in reports.iter().flat_map(|r| &r.failures) {
        eprintln!(
            "warning: {}: command '{}' not available: {}",
            failure.component, failure.command, failure.reason
        );
    }

    let binder = runtime.manager.binder();
    let commands = match binder.lock() {
        Ok(binder) => binder.commands(),
        Err(poisoned) => poisoned.into_inner().commands(),
    };

    if json {
        println!("{}", format_json(&commands)?);
    } else {
        let rows = commands
            .iter()
            .map(|c| vec![c.name.clone(), c.component.clone(), c.summary.clone()])
            .collect();
        format_table(&["COMMAND", "COMPONENT", "SUMMARY"], rows);
    }
    Ok(())
}

fn report_outcome(outcome: &InstallOutcome) {
    match outcome {
        InstallOutcome::Installed(report) => {
            eprintln!(
                "Installed {} {}",
                report.record.name, report.record.version
            );
            report_bindings(report);
        }
        InstallOutcome::Updated(report) => {
            eprintln!(
                "Updated {} {} -> {}",
                report.record.name,
                report.previous_version.as_deref().unwrap_or("?"),
                report.record.version
            );
            report_bindings(report);
        }
        InstallOutcome::UpToDate(record) => {
            eprintln!("{} is up to date ({})", record.name, record.version);
        }
    }
}

fn report_bindings(report: &LifecycleReport) {
    for failure in &report.bound.failures {
        eprintln!(
            "warning: command '{}' not available: {}",
            failure.command, failure.reason
        );
    }
    if !report.bound.bound.is_empty() && is_tty() {
        let names: Vec<&str> = report.bound.bound.iter().map(|c| c.name.as_str()).collect();
        eprintln!("Commands: {}", names.join(", "));
    }
}

fn record_row(record: &ComponentRecord) -> Vec<String> {
    vec![
        record.name.clone(),
        record.version.clone(),
        record.status.to_string(),
        record.installed_at.clone(),
        record.source.clone(),
    ]
}

fn issue_row(issue: &ValidationIssue) -> Vec<String> {
    match issue {
        ValidationIssue::Broken { name, path, reason } => vec![
            "broken".to_string(),
            name.clone(),
            path.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            reason.clone(),
        ],
        ValidationIssue::Transitional { name, status } => vec![
            "transitional".to_string(),
            name.clone(),
            String::new(),
            format!("persisted with status '{status}'"),
        ],
        ValidationIssue::Orphan { path } => vec![
            "orphan".to_string(),
            String::new(),
            path.display().to_string(),
            "no record owns this directory".to_string(),
        ],
    }
}

fn delta_row(delta: &UpdateDelta) -> Vec<String> {
    vec![
        delta.component_name.clone(),
        delta.current_version.clone(),
        delta.latest_version.clone(),
        delta.priority.to_string(),
    ]
}

/// Check if stdout is a TTY.
fn is_tty() -> bool {
    std::io::stdout().is_terminal()
}

/// Format and print a table to stdout.
fn format_table(headers: &[&str], rows: Vec<Vec<String>>) {
    if rows.is_empty() {
        eprintln!("No items found");
        return;
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let header_line: Vec<String> = headers
        .iter()
        .zip(&widths)
        .map(|(h, &width)| format!("{h:width$}"))
        .collect();
    println!("{}", header_line.join("  ").trim_end());

    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    println!("{}", separator.join("  "));

    for row in rows {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{cell:width$}"))
            .collect();
        println!("{}", line.join("  ").trim_end());
    }
}

/// Format data as JSON.
fn format_json<T: serde::Serialize>(data: &T) -> anyhow::Result<String> {
    serde_json::to_string_pretty(data).context("Failed to serialize output")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::manifest::UpdatePriority;
    use std::path::PathBuf;

    #[test]
    fn test_format_json() {
        let delta = UpdateDelta {
            component_name: "weather".to_string(),
            current_version: "1.2.0".to_string(),
            latest_version: "1.3.0".to_string(),
            priority: UpdatePriority::Security,
        };
        if let Ok(json) = format_json(&delta) {
            assert!(json.contains("\"component_name\""));
            assert!(json.contains("\"weather\""));
            assert!(json.contains("\"security\""));
        } else {
            panic!("Should serialize to JSON");
        }
    }

    #[test]
    fn test_validation_issue_json_is_tagged() {
        let issue = ValidationIssue::Orphan {
            path: PathBuf::from("/c/ghost/0.1.0-deadbeef"),
        };
        let Ok(json) = format_json(&issue) else {
            panic!("Should serialize to JSON");
        };
        assert!(json.contains("\"kind\": \"orphan\""));
    }

    #[test]
    fn test_issue_rows_have_one_cell_per_header() {
        let issues = [
            ValidationIssue::Broken {
                name: "weather".to_string(),
                path: None,
                reason: "missing".to_string(),
            },
            ValidationIssue::Transitional {
                name: "notes".to_string(),
                status: "installing".to_string(),
            },
            ValidationIssue::Orphan {
                path: PathBuf::from("/c/ghost/1"),
            },
        ];
        for issue in &issues {
            assert_eq!(issue_row(issue).len(), 4);
        }
    }

    #[test]
    fn test_staged_error_names_stage() {
        let err = staged(ComponentError::NoRollbackTarget {
            name: "weather".to_string(),
        });
        assert_eq!(err.to_string(), "rollback stage failed");
        assert!(format!("{err:#}").contains("No rollback target available for 'weather'"));
    }

    #[test]
    fn test_format_table() {
        let rows = vec![
            vec!["weather".to_string(), "1.3.0".to_string()],
            vec!["notes".to_string(), "0.1.0".to_string()],
        ];
        format_table(&["NAME", "VERSION"], rows);
        format_table(&["NAME", "VERSION"], Vec::new());
    }
}
