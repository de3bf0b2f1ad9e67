//! `optibench run`
//!
//! Resolves both plugins, prepares the fit splits and writes the run plan the
//! external trainer consumes.

use super::inspect::print_inspection;
use super::{RunOptions, SelectionArgs, harness, runtime_args};
use anyhow::{Context, Result};
use colored::Colorize;
use tracing::info;

pub fn execute(selection: &SelectionArgs, options: &RunOptions) -> Result<()> {
    let mut args = runtime_args(selection)
        .with_download(options.download)
        .with_checkpoint_dir(&options.checkpoints)
        .with_output_dir(&options.output);
    if let Some(workers) = options.workers {
        args = args.with_workers(workers);
    }

    let mut run = harness().build(&args)?;
    let plan = run.plan(&args).with_context(|| format!("Failed to prepare data for '{}'", args.workload_name))?;
    print_inspection(&plan.inspection);

    println!("{}", "Data".bold());
    println!("{}", "─".repeat(72));
    println!("  Train:          {} samples in {} batches of {}", plan.train.samples, plan.train.batches, plan.train.batch_size);
    println!("  Validation:     {} samples in {} batches", plan.val.samples, plan.val.batches);
    println!("  Steps/epoch:    {}", plan.steps_per_epoch);
    if let Some(total) = plan.total_steps {
        println!("  Total steps:    {total}");
    }

    let path = plan.write(&args.output_dir).context("Failed to write run plan")?;
    info!(workload = %args.workload_name, submission = %args.submission_name, "run prepared");
    println!();
    println!("{} {}", "✓ Run plan written to".green(), path.display());
    Ok(())
}
