use sponge_core::ModuleKind;
use sponge_engine::ApplyReport;
use tracing::info;

use super::{Context, cancel_on_ctrl_c};

pub async fn plan(ctx: &Context, destroy: bool) -> anyhow::Result<()> {
    let composition = ctx.composition()?;
    let applier = ctx.applier()?;
    let plan = if destroy {
        applier.plan_destroy(&composition.environment)?
    } else {
        applier.plan(&composition).await?
    };
    println!("{plan}");
    Ok(())
}

pub async fn apply(ctx: &Context, module: Option<&str>) -> anyhow::Result<()> {
    let composition = ctx.composition()?;
    let applier = ctx.applier()?;

    let report = match module {
        Some(name) => {
            let kind: ModuleKind = name.parse()?;
            info!(environment = %composition.environment, module = %kind, "applying single module");
            applier.apply_module(&composition, kind).await?
        }
        None => {
            let plan = applier.plan(&composition).await?;
            println!("{plan}");
            if plan.is_empty() {
                return Ok(());
            }
            println!();
            applier.apply(&composition, cancel_on_ctrl_c()).await?
        }
    };

    print_report(&report);
    Ok(())
}

pub async fn destroy(ctx: &Context) -> anyhow::Result<()> {
    let params = ctx.params()?;
    let applier = ctx.applier()?;
    let report = applier
        .destroy(&params.environment, cancel_on_ctrl_c())
        .await?;

    if report.destroyed.is_empty() {
        println!("Nothing to destroy in '{}'.", report.environment);
    } else {
        for kind in &report.destroyed {
            println!("  - {kind}");
        }
        println!(
            "✓ Destroyed {} module(s) in '{}'",
            report.destroyed.len(),
            report.environment
        );
    }
    Ok(())
}

fn print_report(report: &ApplyReport) {
    for kind in &report.created {
        println!("  + {kind}");
    }
    for kind in &report.updated {
        println!("  ~ {kind}");
    }
    println!(
        "✓ Apply complete for '{}': {} created, {} updated, {} unchanged",
        report.environment,
        report.created.len(),
        report.updated.len(),
        report.unchanged.len()
    );
    println!();
    println!("{}", report.outputs.render(false));
}
