//! docgraph-admin: operator maintenance for a docgraph database.
//!
//! Reads `~/.docgraph/config.json` (or defaults); `DOCGRAPH_DB_PATH` overrides
//! the database location. Set `RUST_LOG=info` for migration detail.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use docgraph_lib::audit_export::export_csv;
use docgraph_lib::config::load_config;
use docgraph_lib::db::{AuditFilters, CoreDb};
use docgraph_lib::relationship_migrator::migrate_legacy_relationships;

#[derive(Debug, Parser)]
#[command(name = "docgraph-admin", version, about = "Operator maintenance for a docgraph database")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply schema migrations and fold legacy relationship columns into associations
    Migrate,
    /// Recompute the audit hash chain (global stream when no workspace is given)
    VerifyAudit { workspace: Option<String> },
    /// Write the audit log as CSV to stdout (all workspaces when none is given)
    ExportAudit { workspace: Option<String> },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match run(&cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("docgraph-admin: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: &Command) -> Result<ExitCode, String> {
    let config = load_config()?;
    // Opening applies schema migrations and the relationship pass.
    let db = CoreDb::open(&config).map_err(|e| e.to_string())?;

    match command {
        Command::Migrate => {
            let version = db.schema_version().map_err(|e| e.to_string())?;
            let report = migrate_legacy_relationships(db.conn_ref(), None);
            println!("schema version {}", version);
            println!(
                "{}",
                serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?
            );
            Ok(if report.has_failures() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::VerifyAudit { workspace } => {
            let report = db
                .verify_audit_chain(workspace.as_deref())
                .map_err(|e| e.to_string())?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?
            );
            Ok(if report.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::ExportAudit { workspace } => {
            let filters = AuditFilters {
                workspace_id: workspace.clone(),
                ..Default::default()
            };
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let rows = export_csv(&db, &filters, &mut out).map_err(|e| e.to_string())?;
            log::info!("Exported {} audit rows", rows);
            Ok(ExitCode::SUCCESS)
        }
    }
}
