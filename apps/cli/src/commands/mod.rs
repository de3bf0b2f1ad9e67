//! Command implementations for the Optibench CLI.

pub mod inspect;
pub mod list;
pub mod run;

use clap::Args;
use optibench_core::{Harness, RuntimeArgs};
use std::path::PathBuf;

/// Workload/submission pair plus the settings both factories read.
#[derive(Args, Debug)]
pub struct SelectionArgs {
    /// Workload to run (see `optibench list`)
    #[arg(short, long)]
    pub workload: String,

    /// Submission to run (see `optibench list`)
    #[arg(short, long)]
    pub submission: String,

    /// Path to all datasets (workload independent)
    #[arg(short, long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Path to the submission's hyperparameter file (TOML)
    #[arg(long)]
    pub hyperparameters: Option<PathBuf>,

    /// Path to a workload config file (TOML) overriding its defaults
    #[arg(long)]
    pub workload_config: Option<PathBuf>,

    /// Override the workload's batch size
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Override the workload's device count
    #[arg(long)]
    pub devices: Option<u32>,

    /// Seed for initialization, shuffling and synthetic data
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

/// Settings only a run needs.
#[derive(Args, Debug)]
pub struct RunOptions {
    /// Download datasets that do not exist yet
    #[arg(long)]
    pub download: bool,

    /// Checkpoint directory
    #[arg(short, long, default_value = "checkpoints")]
    pub checkpoints: PathBuf,

    /// Output directory for the run plan
    #[arg(short, long, default_value = "output")]
    pub output: PathBuf,

    /// Data loading workers, default: all available
    #[arg(long)]
    pub workers: Option<usize>,
}

/// Registries with every built-in plugin.
pub fn harness() -> Harness {
    Harness::new(optibench_workloads::registry(), optibench_submissions::registry())
}

pub fn runtime_args(selection: &SelectionArgs) -> RuntimeArgs {
    let mut args = RuntimeArgs::new(&selection.workload, &selection.submission, &selection.data_dir).with_seed(selection.seed);
    args.hyperparameters.clone_from(&selection.hyperparameters);
    args.workload_config.clone_from(&selection.workload_config);
    args.batch_size = selection.batch_size;
    args.devices = selection.devices;
    args
}
