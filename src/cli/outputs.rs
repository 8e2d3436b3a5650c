use crate::cli::{display_value, local_time, table, CliContext};
use crate::core::credstore;
use crate::core::state::StateStore;
use anyhow::{bail, Result};
use clap::Args;

#[derive(Args, Debug)]
pub struct OutputsArgs {
    /// Output format (table|json)
    #[arg(long, default_value = "table")]
    pub format: String,
}

pub fn run(ctx: &CliContext, args: OutputsArgs) -> Result<()> {
    if args.format != "table" && args.format != "json" {
        bail!("unknown format '{}', expected table or json", args.format);
    }
    let store = StateStore::load(&ctx.paths.state)?;
    let state = store.state();

    if args.format == "json" {
        let outputs: serde_json::Map<String, serde_json::Value> = state
            .stacks
            .iter()
            .map(|(unit, stack)| (unit.clone(), serde_json::json!(stack.outputs)))
            .collect();
        let body = serde_json::json!({
            "outputs": outputs,
            "invocations": state.invocations,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    if state.stacks.is_empty() && state.invocations.is_empty() {
        println!("Nothing applied yet in {}.", ctx.paths);
        return Ok(());
    }

    let mut outputs = table(&["Unit", "Output", "Value", "Applied"]);
    for (unit, stack) in &state.stacks {
        for (key, value) in &stack.outputs {
            outputs.add_row(vec![
                unit.clone(),
                key.clone(),
                display_value(value),
                local_time(stack.applied_at),
            ]);
        }
    }
    println!("{}", outputs);

    if !state.invocations.is_empty() {
        let mut invocations = table(&[
            "Physical id",
            "Status",
            "Keypair",
            "Secret location",
            "Attempts",
            "Last error",
        ]);
        for (id, record) in &state.invocations {
            invocations.add_row(vec![
                id.clone(),
                format!("{:?}", record.status).to_uppercase(),
                record.request.requested_name.clone(),
                record.request.requested_secret_location.clone(),
                record.attempts.to_string(),
                record.error_kind.clone().unwrap_or_else(|| "-".to_string()),
            ]);
        }
        println!("\n{}", invocations);
    }

    let keypairs = credstore::list_keypairs(&ctx.paths.keypairs)?;
    if !keypairs.is_empty() {
        println!("\nRegistered keypairs:");
        for entry in &keypairs {
            let modified = entry
                .modified
                .map(|t| local_time(t.into()))
                .unwrap_or_else(|| "-".to_string());
            println!("  {}  {}  {}", entry.name, modified, entry.public_key);
        }
    }
    Ok(())
}
