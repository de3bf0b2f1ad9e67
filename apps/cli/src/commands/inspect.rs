//! `optibench inspect`

use super::{SelectionArgs, harness, runtime_args};
use anyhow::{Context, Result};
use colored::Colorize;
use optibench_core::{Inspection, Overrides};

pub fn execute(selection: &SelectionArgs, json_output: bool) -> Result<()> {
    let args = runtime_args(selection);
    let run = harness().build(&args)?;
    let inspection = run.inspect().context("Failed to configure optimizers")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&inspection)?);
    } else {
        print_inspection(&inspection);
    }
    Ok(())
}

fn format_overrides(overrides: &Overrides) -> String {
    if overrides.is_empty() {
        return "-".to_string();
    }
    overrides.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(", ")
}

pub fn print_inspection(inspection: &Inspection) {
    let specs = &inspection.specs;
    println!();
    println!("{}", format!("{} × {}", inspection.workload, inspection.submission).bold().green());
    println!();
    println!("  Model:          {} ({} tensors, {} weights)", inspection.model.name, inspection.model.parameters, inspection.model.numel);
    println!(
        "  Max epochs:     {}",
        specs.max_epochs.map_or_else(|| "unbounded".to_string(), |e| e.to_string())
    );
    println!("  Max steps:      {}", specs.max_steps.map_or_else(|| "unbounded".to_string(), |s| s.to_string()));
    println!("  Devices:        {}", specs.devices);
    println!("  Target metric:  {} ({})", specs.target_metric.cyan(), specs.target_metric_mode);

    println!();
    println!("{}", "Parameter groups".bold());
    println!("{}", "─".repeat(72));
    for (i, group) in inspection.groups.iter().enumerate() {
        println!("  [{i}] {:>4} tensors {:>10} weights  {}", group.parameters.len(), group.numel, format_overrides(&group.overrides));
    }

    for optimizer in &inspection.optimizers.optimizers {
        println!();
        println!("{}", format!("Optimizer: {}", optimizer.name).bold());
        println!("{}", "─".repeat(72));
        for (i, group) in optimizer.groups.iter().enumerate() {
            println!(
                "  [{i}] {:>4} tensors  lr={:<10} weight_decay={:<8} {}",
                group.parameters.len(),
                group.lr,
                group.weight_decay,
                format_overrides(&group.overrides).dimmed()
            );
        }
    }
    for scheduler in &inspection.optimizers.schedulers {
        println!("  Scheduler: {} (every {:?})", scheduler.name.cyan(), scheduler.interval);
    }
    println!();
}
