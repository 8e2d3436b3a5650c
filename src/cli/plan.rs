//! Dry-run preview of an apply.

use crate::cli::{table, CliContext};
use crate::core::invoker::physical_resource_id;
use crate::core::state::StateStore;
use crate::units::{self, KEYPAIR};
use anyhow::{bail, Result};
use clap::Args;

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Plan only this unit and its dependencies (repeatable)
    #[arg(long = "unit", value_name = "NAME")]
    pub units: Vec<String>,
    /// Output format (table|json)
    #[arg(long, default_value = "table")]
    pub format: String,
}

pub fn run(ctx: &CliContext, args: PlanArgs) -> Result<()> {
    if args.format != "table" && args.format != "json" {
        bail!("unknown format '{}', expected table or json", args.format);
    }
    let plan = units::standard_graph()?.plan(&args.units)?;
    let state = StateStore::load(&ctx.paths.state)?;

    let rows: Vec<(String, Vec<String>, String)> = plan
        .into_iter()
        .map(|entry| {
            let action = planned_action(ctx, &state, &entry.name);
            (entry.name, entry.dependencies, action)
        })
        .collect();

    if args.format == "json" {
        let units: Vec<_> = rows
            .iter()
            .enumerate()
            .map(|(i, (name, deps, action))| {
                serde_json::json!({
                    "position": i + 1,
                    "unit": name,
                    "dependencies": deps,
                    "action": action,
                })
            })
            .collect();
        let plan = serde_json::json!({ "project": ctx.paths.root.display().to_string(), "units": units });
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let mut table = table(&["#", "Unit", "Depends on", "Action"]);
    for (i, (name, deps, action)) in rows.iter().enumerate() {
        table.add_row(vec![
            (i + 1).to_string(),
            name.clone(),
            if deps.is_empty() { "-".to_string() } else { deps.join(", ") },
            action.clone(),
        ]);
    }
    println!("Plan for {}", ctx.paths);
    println!("{}", table);
    println!("\nNo changes made (dry-run).");
    Ok(())
}

/// What applying `unit` would do given the recorded state.
fn planned_action(ctx: &CliContext, state: &StateStore, unit: &str) -> String {
    if unit == KEYPAIR {
        let id = physical_resource_id(unit, &ctx.config.keypair.function_name);
        return match state.invocation(&id) {
            Some(record) if record.has_succeeded() => format!(
                "re-affirm {} ({})",
                record.request.requested_name, record.request.requested_secret_location
            ),
            Some(record) => format!(
                "retry {} (last attempt {}, {} so far)",
                record.request.requested_name,
                record.error_kind.as_deref().unwrap_or("unfinished"),
                record.attempts
            ),
            None => format!(
                "provision {}-<random> via {}",
                ctx.config.keypair.name_prefix, ctx.config.keypair.function_name
            ),
        };
    }
    match state.stack(unit) {
        Some(_) => "update".to_string(),
        None => "create".to_string(),
    }
}
