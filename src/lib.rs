//! Package and module lifecycle engine for appliance-style systems.
//!
//! [`InstallOrchestrator`] is the entry point. It serializes OS package
//! operations and module install, uninstall and update runs, and brackets
//! every mutating run with [`WriteGuard`] write access.

pub mod archive;
pub mod config;
pub mod diagnostics;
pub mod download;
pub mod error;
pub mod guard;
pub mod module;
pub mod orchestrator;
pub mod package;
pub mod process;
pub mod status;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use guard::{GuardedFs, Remounter, WriteGuard};
pub use module::{
    InstallPhase, InstallStatus, ModuleInfo, UninstallPhase, UninstallStatus, UpdatePhase,
    UpdateStatus,
};
pub use orchestrator::{InstallOrchestrator, Operation, OperationKind};
pub use package::{PackageAction, PackageReport, PackageState};
pub use process::{CommandSpec, ProcessRunner};
