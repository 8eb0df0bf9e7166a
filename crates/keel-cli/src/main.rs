//! CLI entry point for keel.
//!
//! This binary provides the `keel` command with subcommands for applying
//! migrations, inspecting their state, and diagnosing database setup.

mod cli;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use keel_store::{ConfigResolver, Database, DatabaseConfig, DbError, HealthStatus, MigrationState};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is normal; anything else is worth a warning.
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing("info");

    match dotenv {
        Err(e) if !e.not_found() => warn!(error = %e, "failed to load .env file"),
        _ => {}
    }

    match cli.command {
        Commands::Migrate { dry_run } => cmd_migrate(dry_run, cli.json).await,
        Commands::Status => cmd_status(cli.json).await,
        Commands::Validate { strict } => cmd_validate(strict, cli.json).await,
        Commands::Config => cmd_config(cli.json),
        Commands::Setup => cmd_setup(),
        Commands::Health => cmd_health(cli.json).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: migrate
// ---------------------------------------------------------------------------

async fn cmd_migrate(dry_run: bool, json: bool) -> Result<()> {
    let db = open().await?;

    if dry_run {
        let status = db.migration_status().await.map_err(diagnostic)?;
        let pending: Vec<&str> = status
            .files
            .iter()
            .filter(|f| f.state == MigrationState::Pending)
            .map(|f| f.filename.as_str())
            .collect();
        if json {
            print_json(&pending)?;
        } else if pending.is_empty() {
            println!("  No pending migrations.");
        } else {
            println!("  Pending migrations ({}):", pending.len());
            for name in &pending {
                println!("    {name}");
            }
        }
        return close(db).await;
    }

    let outcome = db.run_migrations().await;
    close(db).await?;
    let report = outcome.map_err(diagnostic)?;

    if json {
        return print_json(&report);
    }
    if report.applied.is_empty() {
        println!("  Schema is up to date.");
    } else {
        println!("  Applied {} migration(s):", report.applied.len());
        for name in &report.applied {
            println!("    {name}");
        }
    }
    for finding in &report.drifted {
        println!(
            "  WARNING: {} changed after it was applied (not re-run)",
            finding.filename
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(json: bool) -> Result<()> {
    let db = open().await?;
    let outcome = db.migration_status().await;
    close(db).await?;
    let status = outcome.map_err(diagnostic)?;

    if json {
        return print_json(&status);
    }

    println!();
    println!("  Migration Status");
    println!("  ================");
    println!();
    for file in &status.files {
        let state = match file.state {
            MigrationState::Executed => "executed",
            MigrationState::Pending => "PENDING",
            MigrationState::Modified => "MODIFIED",
        };
        let when = file.executed_at.as_deref().unwrap_or("-");
        println!("  {state:<9} {:<40} {when}", file.filename);
    }
    println!();
    println!(
        "  Total: {}  Executed: {}  Pending: {}",
        status.total, status.executed, status.pending
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: validate
// ---------------------------------------------------------------------------

async fn cmd_validate(strict: bool, json: bool) -> Result<()> {
    let db = open().await?;
    let outcome = db.validate_migrations().await;
    close(db).await?;
    let findings = outcome.map_err(diagnostic)?;

    if json {
        print_json(&findings)?;
    } else if findings.is_clean() {
        println!("  Migrations are consistent with the ledger.");
    } else {
        for finding in &findings.modified {
            println!(
                "  MODIFIED  {} (recorded {}, now {})",
                finding.filename,
                short(&finding.recorded_checksum),
                short(&finding.current_checksum)
            );
        }
        for record in &findings.missing_files {
            println!("  MISSING   {} (applied {})", record.filename, record.executed_at);
        }
        for gap in &findings.gaps {
            println!("  GAP       between {:03} and {:03}", gap.after, gap.before);
        }
    }

    if strict && !findings.is_clean() {
        bail!("migration validation reported findings");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: config
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ConfigView {
    summary: keel_store::ConfigSummary,
    validation: keel_store::ValidationReport,
}

fn cmd_config(json: bool) -> Result<()> {
    let db = Database::new(load_config()?);
    let view = ConfigView {
        summary: db.config_summary(),
        validation: db.validate_config(),
    };

    if json {
        print_json(&view)?;
    } else {
        println!();
        println!("  Database Configuration");
        println!("  ======================");
        println!();
        for line in serde_json::to_string_pretty(&view.summary)?.lines() {
            println!("  {line}");
        }
        println!();
        for err in &view.validation.errors {
            println!("  ERROR:   {err}");
        }
        for warning in &view.validation.warnings {
            println!("  WARNING: {warning}");
        }
        if view.validation.is_valid() {
            println!("  Configuration is valid.");
        }
        println!();
    }

    if !view.validation.is_valid() {
        bail!("configuration is invalid (run `keel setup` for instructions)");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: setup
// ---------------------------------------------------------------------------

fn cmd_setup() -> Result<()> {
    match ConfigResolver::from_env().resolve() {
        Ok(config) => println!("{}", Database::new(config).setup_instructions()),
        // Resolution errors already carry the generic guide.
        Err(e) => println!("{}", e.diagnostic()),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: health
// ---------------------------------------------------------------------------

async fn cmd_health(json: bool) -> Result<()> {
    let mut config = load_config()?;
    config.auto_migrate = false;
    let db = Database::new(config);
    if let Err(e) = db.initialize().await {
        // Still report through the health shape so scripts see one format.
        warn!(code = e.code(), "database failed to initialize");
        eprintln!("{}", e.diagnostic());
    }
    let report = db.health_check().await;
    close(db).await?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "  {} ({}) {}ms{}",
            report.status,
            report.backend,
            report.latency_ms,
            report
                .message
                .as_deref()
                .map(|m| format!(": {m}"))
                .unwrap_or_default()
        );
    }

    if report.status == HealthStatus::Unhealthy {
        bail!("database is unhealthy");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn load_config() -> Result<DatabaseConfig> {
    ConfigResolver::from_env().resolve().map_err(diagnostic)
}

/// Connect without start-up migrations; the subcommand decides what runs.
async fn open() -> Result<Database> {
    let mut config = load_config()?;
    config.auto_migrate = false;
    let db = Database::new(config);
    db.initialize().await.map_err(diagnostic)?;
    info!(backend = %db.kind(), "connected");
    Ok(db)
}

async fn close(db: Database) -> Result<()> {
    db.close().await.context("failed to close database")
}

fn diagnostic(err: DbError) -> anyhow::Error {
    anyhow!(err.diagnostic())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}
