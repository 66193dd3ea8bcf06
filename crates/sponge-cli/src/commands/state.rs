use sponge_state::RunOutcome;

use super::Context;

pub fn list(ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.store()?;
    let environments = store.list_environments()?;
    if environments.is_empty() {
        println!("No environments recorded.");
        return Ok(());
    }

    for environment in environments {
        let lock = match store.get_lock(&environment)? {
            Some(lock) => format!(" [locked by {} for {}]", lock.holder, lock.operation),
            None => String::new(),
        };
        println!("{environment}{lock}");
        for record in store.list_modules(&environment)? {
            println!(
                "  {:<18} {}  applied_at={}",
                record.kind.as_str(),
                &record.fingerprint[..12.min(record.fingerprint.len())],
                record.applied_at
            );
        }
    }
    Ok(())
}

pub fn history(ctx: &Context, limit: usize) -> anyhow::Result<()> {
    let params = ctx.params()?;
    let store = ctx.store()?;
    let runs = store.list_runs(&params.environment, limit)?;
    if runs.is_empty() {
        println!("No runs recorded for '{}'.", params.environment);
        return Ok(());
    }

    for run in runs {
        let outcome = match &run.outcome {
            RunOutcome::Succeeded => "succeeded".to_string(),
            RunOutcome::Cancelled => "cancelled".to_string(),
            RunOutcome::Failed { reason, .. } => format!("failed: {reason}"),
        };
        let changed: Vec<&str> = run.changed.iter().map(|k| k.as_str()).collect();
        println!(
            "{} {:<7} {}ms  changed=[{}]  {}",
            run.started_at,
            run.operation.to_string(),
            run.finished_at.saturating_sub(run.started_at),
            changed.join(", "),
            outcome
        );
        if !run.skipped.is_empty() {
            let skipped: Vec<&str> = run.skipped.iter().map(|k| k.as_str()).collect();
            println!("    skipped: {}", skipped.join(", "));
        }
    }
    Ok(())
}

pub fn force_unlock(ctx: &Context, environment: Option<&str>) -> anyhow::Result<()> {
    let environment = match environment {
        Some(env) => env.to_string(),
        None => ctx.params()?.environment,
    };
    let store = ctx.store()?;
    match store.force_unlock(&environment)? {
        Some(lock) => println!(
            "✓ Released lock on '{environment}' held by {} ({} since {})",
            lock.holder, lock.operation, lock.acquired_at
        ),
        None => println!("'{environment}' was not locked."),
    }
    Ok(())
}
