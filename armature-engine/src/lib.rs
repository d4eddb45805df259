//! Armature - component lifecycle engine for command-line tools
//!
//! Armature discovers, installs, isolates, updates and removes optional
//! feature modules ("components") without touching the host tool's own
//! dependency tree.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Component Manager                          │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌───────────┐  │
//! │  │  Manifest  │  │  Isolated  │  │  Registry  │  │  Command  │  │
//! │  │  Resolver  │  │ Installer  │  │   Store    │  │  Binder   │  │
//! │  └────────────┘  └────────────┘  └────────────┘  └───────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//!         │                │                              ▲
//!         ▼                ▼                              │
//!   ┌───────────┐   ┌─────────────┐              ┌────────────────┐
//!   │  Sources  │   │ <root>/     │              │ Update Policy  │
//!   │ (git/dir) │   │ components/ │              │    Engine      │
//!   └───────────┘   └─────────────┘              └────────────────┘
//! ```

pub mod components;
pub mod config;

pub use components::{ComponentError, ComponentManager, ManagerContext};
pub use config::ArmatureConfig;
