use crate::cli::{local_time, table, CliContext};
use crate::core::audit_log::{self, AuditEntry};
use anyhow::Result;
use clap::{Args, Subcommand};

#[derive(Subcommand, Debug)]
pub enum AuditCommand {
    /// Display the audit trail
    Log(AuditLogArgs),
    /// Verify audit chain integrity
    Verify(AuditVerifyArgs),
}

#[derive(Args, Debug)]
pub struct AuditLogArgs {
    /// Maximum number of entries to display (applied after filtering)
    #[arg(long, default_value_t = 50)]
    pub limit: usize,

    /// Only events of this kind, e.g. `invocation` or `unit.failed`
    #[arg(long, value_name = "KIND")]
    pub event: Option<String>,

    /// Only entries about this unit or physical resource id
    #[arg(long, value_name = "NAME")]
    pub subject: Option<String>,

    /// Only entries that recorded a failure
    #[arg(long)]
    pub failed: bool,
}

#[derive(Args, Debug)]
pub struct AuditVerifyArgs {}

pub fn run(ctx: &CliContext, cmd: AuditCommand) -> Result<()> {
    match cmd {
        AuditCommand::Log(args) => run_log(ctx, args),
        AuditCommand::Verify(_) => run_verify(ctx),
    }
}

/// `kind` matches the event itself or any event under it: `invocation`
/// selects `invocation.started`, `invocation.failed` and so on.
fn event_matches(event: &str, kind: &str) -> bool {
    event == kind
        || event
            .strip_prefix(kind)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// A unit name also selects the invocations it owns (`<unit>-<function>`).
fn subject_matches(subject: &str, name: &str) -> bool {
    subject == name
        || subject
            .strip_prefix(name)
            .is_some_and(|rest| rest.starts_with('-'))
}

fn is_failure(entry: &AuditEntry) -> bool {
    entry.result.as_ref().is_some_and(|r| !r.success)
}

/// The last `args.limit` entries that pass every filter, oldest first.
fn select(entries: Vec<AuditEntry>, args: &AuditLogArgs) -> Vec<AuditEntry> {
    let mut kept: Vec<AuditEntry> = entries
        .into_iter()
        .filter(|e| args.event.as_deref().map_or(true, |k| event_matches(&e.event, k)))
        .filter(|e| args.subject.as_deref().map_or(true, |s| subject_matches(&e.subject, s)))
        .filter(|e| !args.failed || is_failure(e))
        .collect();
    if kept.len() > args.limit {
        kept = kept.split_off(kept.len() - args.limit);
    }
    kept
}

fn run_log(ctx: &CliContext, args: AuditLogArgs) -> Result<()> {
    let total = audit_log::read_log(&ctx.paths, None)?;
    if total.is_empty() {
        println!("No audit entries found.");
        return Ok(());
    }
    let recorded = total.len();
    let entries = select(total, &args);
    if entries.is_empty() {
        println!("No audit entries match ({} recorded).", recorded);
        return Ok(());
    }

    let mut log = table(&["Timestamp", "Event", "Subject", "Detail", "Actor", "Result"]);
    for entry in &entries {
        let outcome = match &entry.result {
            Some(r) if r.success => "OK".to_string(),
            Some(r) => format!("FAIL: {}", r.error_kind.as_deref().unwrap_or("?")),
            None => "-".to_string(),
        };
        log.add_row(vec![
            local_time(entry.timestamp),
            entry.event.clone(),
            entry.subject.clone(),
            entry.detail.clone().unwrap_or_default(),
            entry.actor.clone(),
            outcome,
        ]);
    }

    println!("{}", log);
    println!("\n{} of {} entries shown.", entries.len(), recorded);
    Ok(())
}

fn run_verify(ctx: &CliContext) -> Result<()> {
    let (total, errors) = audit_log::verify_chain(&ctx.paths)?;

    if total == 0 {
        println!("No audit entries to verify.");
        return Ok(());
    }

    for err in &errors {
        println!("  [FAIL] {}", err);
    }

    println!();
    if errors.is_empty() {
        println!("Audit chain: {} entries verified, 0 errors", total);
    } else {
        println!("Audit chain: {} entries, {} errors", total, errors.len());
        std::process::exit(1);
    }
    Ok(())
}
