use crate::cli::{display_value, table, CliContext};
use crate::core::audit_log::AuditEvent;
use crate::core::control_plane;
use crate::core::file_lock::FileLock;
use crate::core::graph::{ApplyFailure, ApplyOptions, ApplyReport};
use crate::core::naming::RandomSuffix;
use crate::core::state::StateStore;
use crate::error::{DeployError, ProvisioningError};
use crate::models::invocation::{InvocationStatus, ProvisioningInvocation};
use crate::units::{self, DeployEnv};
use anyhow::Result;
use clap::Args;
use dialoguer::Confirm;
use std::time::Duration;

/// Exit code when the operator stops a run between units.
const EXIT_STOPPED: i32 = 2;

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Apply only this unit and its dependencies (repeatable)
    #[arg(long = "unit", value_name = "NAME")]
    pub units: Vec<String>,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,

    /// Confirm each unit before it applies
    #[arg(long)]
    pub step: bool,

    /// Provisioning invocation timeout in seconds
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,
}

pub fn run(ctx: &CliContext, args: ApplyArgs) -> Result<()> {
    let _lock = FileLock::hold_or_fail(&ctx.paths.state_lock, "deploy state")?;

    let plan = units::standard_graph()?.plan(&args.units)?;
    let names: Vec<String> = plan.iter().map(|e| e.name.clone()).collect();

    println!("Apply order: {}", names.join(" -> "));
    if !args.yes && !ctx.non_interactive {
        let confirmed = Confirm::new()
            .with_prompt(format!("Apply {} unit(s) to {}?", names.len(), ctx.paths))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let host = control_plane::local_host(&ctx.paths, &ctx.config)?;
    let mut graph = units::standard_graph()?;
    let state = StateStore::load(&ctx.paths.state)?;
    let timeout = Duration::from_secs(args.timeout.unwrap_or(ctx.config.keypair.timeout_secs));
    let mut env = DeployEnv::new(
        ctx.config.clone(),
        state,
        &host,
        Box::new(RandomSuffix::default()),
        timeout,
    );
    env.invoker.set_observer(|invocation: &ProvisioningInvocation| ctx.audit(invocation_event(invocation)));
    let opts = ApplyOptions {
        only: args.units.clone(),
        max_attempts: ctx.config.deploy.invoke_attempts,
    };

    ctx.audit(AuditEvent::new("apply.started", names.join(",")));
    let step = args.step && !ctx.non_interactive;
    let mut proceed = |unit: &str| {
        if !step {
            return true;
        }
        Confirm::new()
            .with_prompt(format!("Apply unit '{}'?", unit))
            .default(true)
            .interact()
            .unwrap_or(false)
    };
    let outcome = graph.apply(&mut env, &opts, &mut proceed);

    match outcome {
        Ok(report) => {
            for unit in &report.applied {
                ctx.audit(AuditEvent::new("unit.applied", unit.as_str()).succeeded());
            }
            print_report(&report);
            if let Some(unit) = &report.aborted_before {
                ctx.audit(AuditEvent::new("apply.stopped", unit.as_str()));
                std::process::exit(EXIT_STOPPED);
            }
            ctx.audit(AuditEvent::new("apply.finished", names.join(",")).succeeded());
            Ok(())
        }
        Err(failure) => {
            for unit in &failure.applied {
                ctx.audit(AuditEvent::new("unit.applied", unit.as_str()).succeeded());
            }
            ctx.audit(
                AuditEvent::new("unit.failed", failure.unit.as_deref().unwrap_or("<graph>"))
                    .failed(failure.error.kind(), failure.error.to_string()),
            );
            print_failure(&failure);
            std::process::exit(1);
        }
    }
}

fn invocation_event(invocation: &ProvisioningInvocation) -> AuditEvent {
    let detail = format!(
        "{} {} -> {}",
        invocation.action.as_str(),
        invocation.payload.requested_name,
        invocation.payload.requested_secret_location
    );
    let event = match (invocation.status, invocation.deduplicated) {
        (InvocationStatus::Pending, _) => {
            let started = AuditEvent::new("invocation.started", invocation.physical_resource_id.as_str());
            return started.detail(detail);
        }
        (InvocationStatus::Succeeded, true) => "invocation.deduplicated",
        (InvocationStatus::Succeeded, false) => "invocation.succeeded",
        _ => "invocation.failed",
    };
    let entry = AuditEvent::new(event, invocation.physical_resource_id.as_str()).detail(detail);
    match (&invocation.status, &invocation.error_kind) {
        (InvocationStatus::Succeeded, _) => entry.succeeded(),
        (_, Some(kind)) => entry.failed(kind, "invocation failed"),
        (_, None) => entry.failed("Unknown", "invocation did not finish"),
    }
}

fn print_report(report: &ApplyReport) {
    if !report.props.is_empty() {
        let mut table = table(&["Output", "Value", "Published by"]);
        for (key, published) in report.props.iter() {
            table.add_row(vec![
                key.to_string(),
                display_value(&published.value),
                published.publisher.clone(),
            ]);
        }
        println!("{}", table);
    }

    match &report.aborted_before {
        Some(unit) => {
            println!(
                "\nStopped before '{}'. Applied: {}. Not attempted: {}.",
                unit,
                list_or_none(&report.applied),
                list_or_none(&report.not_attempted)
            );
        }
        None => println!("\nApplied {} unit(s): {}.", report.applied.len(), list_or_none(&report.applied)),
    }
    if !report.excluded.is_empty() {
        println!("Excluded by unit filter: {}.", report.excluded.join(", "));
    }
}

fn print_failure(failure: &ApplyFailure) {
    let unit = failure.unit.as_deref().unwrap_or("<graph>");
    eprintln!("error: unit '{}' failed with {}", unit, failure.error.kind());
    eprintln!("  {}", failure.error);
    if let DeployError::Provisioning(ProvisioningError::PartialProvisioning {
        keypair_name,
        missing_secret,
        ..
    }) = &failure.error
    {
        eprintln!("  exists:  keypair '{}'", keypair_name);
        eprintln!("  missing: secret '{}'", missing_secret);
        eprintln!("  reconcile by hand before re-running; it will not be retried automatically");
    }
    let class = failure.error.class();
    eprintln!(
        "  class: {}{}",
        class.as_str(),
        if class.is_retryable() {
            " (safe to re-run; the physical resource id is reused)"
        } else {
            ""
        }
    );
    if failure.attempts > 1 {
        eprintln!("  attempts: {}", failure.attempts);
    }
    eprintln!("  applied: {}", list_or_none(&failure.applied));
    eprintln!("  not attempted: {}", list_or_none(&failure.not_attempted));
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}
