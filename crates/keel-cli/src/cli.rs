//! CLI argument definitions for keel.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use clap::{Parser, Subcommand};

/// keel -- database migrations and diagnostics.
#[derive(Parser)]
#[command(
    name = "keel",
    version,
    about = "keel -- database migrations and diagnostics",
    long_about = "Applies file-based SQL migrations and checks database configuration for \
                  PostgreSQL, embedded SQLite, and hosted REST backends. Configuration is read \
                  from the environment and an optional .env file."
)]
pub struct Cli {
    /// Emit machine-readable JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply pending migrations.
    Migrate {
        /// List pending migrations without applying them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show executed, pending and modified migrations.
    Status,

    /// Check migration files against the ledger for drift and gaps.
    Validate {
        /// Exit with an error when any finding is reported.
        #[arg(long)]
        strict: bool,
    },

    /// Show the resolved configuration (credentials redacted) and its
    /// validation result.
    Config,

    /// Print setup instructions for the selected backend.
    Setup,

    /// Probe the database and report its health.
    Health,
}
