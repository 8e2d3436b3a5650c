//! CLI routing and command dispatch.

use crate::constants;
use crate::core::audit_log::{self, AuditEvent};
use crate::core::config;
use crate::core::paths::DeployPaths;
use crate::models::deploy_config::DeployFile;
use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use clap::{ArgAction, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Table};
use serde_json::Value;
use std::path::PathBuf;

pub mod apply;
pub mod audit;
pub mod init;
pub mod outputs;
pub mod plan;

/// Shared context passed to all command handlers.
pub struct CliContext {
    pub paths: DeployPaths,
    pub config: DeployFile,
    pub non_interactive: bool,
}

impl CliContext {
    /// Append an audit entry. Failures are reported, not fatal.
    pub fn audit(&self, event: AuditEvent) {
        if let Err(e) = audit_log::log(&self.paths, event) {
            eprintln!("warning: audit log failed: {}", e);
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "keypair-manager",
    version,
    about = "Ordered deployment with idempotent keypair provisioning"
)]
pub struct Cli {
    /// Project root (default: nearest ancestor with deploy.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub root: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Run in non-interactive mode (no prompts, suitable for automation)
    #[arg(long, global = true, env = "KEYPAIR_MANAGER_NON_INTERACTIVE")]
    pub non_interactive: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default tracing filter for the requested verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }

    pub fn run(self) -> Result<()> {
        let root = DeployPaths::resolve_root(self.root)?;
        let config = config::load(&root.join(constants::CONFIG_FILE))?;
        let paths = DeployPaths::from_root(root, config.deploy.cloud_dir.as_deref());

        let ctx = CliContext {
            paths,
            config,
            non_interactive: self.non_interactive,
        };

        match self.command {
            Commands::Init(args) => init::run(&ctx, args),
            Commands::Apply(args) => apply::run(&ctx, args),
            Commands::Plan(args) => plan::run(&ctx, args),
            Commands::Outputs(args) => outputs::run(&ctx, args),
            Commands::Audit { command } => audit::run(&ctx, command),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default deploy.toml and create the control-plane directories
    Init(init::InitArgs),
    /// Apply deployment units in dependency order
    Apply(apply::ApplyArgs),
    /// Show the apply order without applying (dry-run)
    Plan(plan::PlanArgs),
    /// Show recorded stack outputs and provisioning invocations
    Outputs(outputs::OutputsArgs),
    /// View the audit trail
    Audit {
        #[command(subcommand)]
        command: audit::AuditCommand,
    },
}

/// Table with the shared preset and a bold header row.
pub(crate) fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(
        header
            .iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect::<Vec<_>>(),
    );
    table
}

pub(crate) fn local_time(at: DateTime<Utc>) -> String {
    DateTime::<Local>::from(at).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Render an output value for a table cell.
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}
