//! Component lifecycle engine.
//!
//! Components are optional feature modules fetched from a source, installed
//! into private versioned directories with their own dependency trees, and
//! tracked in a durable registry.
//!
//! # Layout
//!
//! ```text
//! <storage_root>/
//! ├── registry.toml                 installed components
//! ├── registry.lock                 writer lock
//! └── components/
//!     └── weather/
//!         ├── 1.2.0-3f9a1c2e/        retained for rollback
//!         └── 1.3.0-8b0d44a1/        current install
//!             ├── src/
//!             ├── deps/
//!             └── isolation.toml
//! ```
//!
//! # Flow
//!
//! ```text
//! identifier ─▶ ManifestResolver ─▶ IsolatedInstaller ─▶ verify ─▶ RegistryStore ─▶ CommandBinder
//!                 (tags, semver)      (fetch, deps)                 (locked commit)
//! ```

pub mod binder;
pub mod cli;
pub mod context;
pub mod error;
pub mod installer;
pub mod isolation;
pub mod manager;
pub mod manifest;
pub mod resolver;
pub mod source;
pub mod store;
pub mod updates;

#[cfg(test)]
pub(crate) mod testing;

pub use binder::{BindFailure, BindReport, CommandBinder, CommandDescriptor, Invocable};
pub use context::ManagerContext;
pub use error::{ComponentError, Result, Stage};
pub use installer::{InstallArtifact, IsolatedInstaller};
pub use manager::{ComponentManager, InstallOutcome, LifecycleReport, ValidationIssue};
pub use manifest::{ComponentManifest, UpdatePriority};
pub use resolver::{ManifestResolver, ResolvedTarget};
pub use source::{ComponentSource, RoutedSource};
pub use store::{ComponentRecord, ComponentStatus, RegistryStore};
pub use updates::{EnvironmentSignals, UpdateDelta, UpdatePolicy};
