//! Optibench CLI - runs optimizer submissions against benchmark workloads
//!
//! The `optibench` command lists the installed plugins, inspects how a
//! submission treats a workload's parameter groups and prepares runs for the
//! external trainer.

mod commands;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{RunOptions, SelectionArgs, inspect, list, run};

/// Optibench - benchmark optimizers across workloads
#[derive(Parser, Debug)]
#[command(
    name = "optibench",
    author,
    version,
    about = "Runs a single submission (optimizer and scheduler) on a single workload"
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered workloads and submissions
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show specs, parameter groups and resolved optimizer settings
    ///
    /// Builds the workload bound to the submission without touching any
    /// dataset.
    Inspect {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Prepare data and write the run plan for the trainer
    Run {
        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        options: RunOptions,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::List { json } => list::execute(json),
        Command::Inspect { selection, json } => inspect::execute(&selection, json),
        Command::Run { selection, options } => run::execute(&selection, &options),
    }
}
