use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "pkgwarden package lifecycle engine")]
pub struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Use system-wide config (/etc/pkgwarden/pkgwarden.toml)
    #[arg(long, global = true, conflicts_with = "config")]
    pub system: bool,

    #[command(subcommand)]
    pub sub: Cmd,
}

/// Module identity and artifact source shared by install and update.
#[derive(ClapArgs, Debug)]
pub struct ModuleSource {
    pub name: String,
    pub version: String,

    /// Download URL of the module archive
    #[arg(long, conflicts_with = "archive")]
    pub url: Option<String>,

    /// Local module archive instead of a download
    #[arg(long)]
    pub archive: Option<PathBuf>,

    #[arg(long)]
    pub sha1: Option<String>,
    #[arg(long)]
    pub sha256: Option<String>,
    #[arg(long)]
    pub md5: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Install a module
    Install(ModuleSource),
    /// Uninstall a module
    Uninstall {
        name: String,
        /// Succeed even without an install log; removal failures become warnings
        #[arg(long)]
        force: bool,
    },
    /// Replace the installed version of a module
    Update {
        #[command(flatten)]
        source: ModuleSource,
        /// Force the uninstall half of the update
        #[arg(long)]
        force: bool,
    },
    /// Install a local .deb file
    Deb {
        path: PathBuf,
        /// Only simulate the installation
        #[arg(long)]
        dry_run: bool,
    },
    /// OS package operations
    Pkg {
        #[command(subcommand)]
        action: PkgCmd,
    },
    /// Extract a zip or tar.gz archive
    Extract { archive: PathBuf, destination: PathBuf },
    /// Run a shell command under the process runner
    Exec {
        command: String,
        /// Kill the command after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// Download cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheCmd,
    },
    /// List files recorded in a module's install log
    Files { name: String },
}

#[derive(Subcommand, Debug)]
pub enum PkgCmd {
    /// Refresh the package index
    Refresh,
    Install { names: Vec<String> },
    Remove {
        names: Vec<String>,
        /// Also delete configuration files
        #[arg(long)]
        purge: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCmd {
    List,
    /// Delete downloads, and cache entries too with --all
    Purge {
        #[arg(long)]
        all: bool,
    },
}
