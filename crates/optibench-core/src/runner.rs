//! Wires registries, runtime args and the data module into a run plan for
//! the external trainer.

use crate::config::{RuntimeArgs, WorkloadConfig};
use crate::data::{LoaderSummary, Stage, WorkloadDataModule};
use crate::error::{BenchResult, PluginKind};
use crate::groups::GroupSummary;
use crate::registry::Registry;
use crate::specs::{MetricMode, RuntimeSpecs};
use crate::submission::{OptimizerSetupSummary, Submission, SubmissionFactory};
use crate::workload::{WorkloadFactory, WorkloadModel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// File name of the plan written to the output directory.
pub const RUN_PLAN_FILE: &str = "run_plan.json";

/// Both plugin registries.
#[derive(Debug, Clone)]
pub struct Harness {
    workloads: Registry<dyn WorkloadFactory>,
    submissions: Registry<dyn SubmissionFactory>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(Registry::new(PluginKind::Workload), Registry::new(PluginKind::Submission))
    }
}

impl Harness {
    /// Creates a harness over the given plugin registries.
    pub fn new(workloads: Registry<dyn WorkloadFactory>, submissions: Registry<dyn SubmissionFactory>) -> Self {
        Self { workloads, submissions }
    }

    pub fn workloads(&self) -> &Registry<dyn WorkloadFactory> {
        &self.workloads
    }

    pub fn submissions(&self) -> &Registry<dyn SubmissionFactory> {
        &self.submissions
    }

    /// Resolves both plugins and builds the bound model and data module.
    ///
    /// # Errors
    /// `UnknownPlugin` if either name is not registered, plus anything the
    /// factories raise.
    pub fn build(&self, args: &RuntimeArgs) -> BenchResult<Run> {
        args.validate()?;
        let submission_factory = self.submissions.import(&args.submission_name)?;
        let workload_factory = self.workloads.import(&args.workload_name)?;

        let submission = submission_factory.get_submission(args)?;
        let (model, data) = workload_factory.get_workload(Arc::clone(&submission), args)?;
        model.get_specs().validate()?;

        info!(
            workload = %model.name(),
            submission = %submission.name(),
            parameters = model.grouped_model().trainable_parameters().len(),
            "built workload"
        );
        Ok(Run { model, data, submission })
    }
}

/// A workload bound to a submission.
#[derive(Debug)]
pub struct Run {
    pub model: Box<dyn WorkloadModel>,
    pub data: Box<dyn WorkloadDataModule>,
    pub submission: Arc<dyn Submission>,
}

impl Run {
    /// Specs and optimizer layout, without touching the dataset.
    ///
    /// # Errors
    /// Returns error if the model's groups cannot be resolved by the submission.
    pub fn inspect(&self) -> BenchResult<Inspection> {
        let grouped = self.model.grouped_model();
        let params = grouped.trainable_parameters();
        let setup = self.model.configure_optimizers()?;
        Ok(Inspection {
            workload: self.model.name().to_string(),
            submission: self.submission.name().to_string(),
            specs: self.model.get_specs().clone(),
            model: ModelSummary {
                name: grouped.name().to_string(),
                parameters: params.len(),
                numel: params.values().map(|p| p.numel()).sum(),
            },
            groups: grouped.parameter_groups()?.summary(),
            optimizers: setup.summary(),
        })
    }

    /// Prepares data for fitting and collects everything the trainer needs.
    ///
    /// # Errors
    /// Returns error if the dataset cannot be prepared, a loader is
    /// misconfigured, or optimizers cannot be configured.
    pub fn plan(&mut self, args: &RuntimeArgs) -> BenchResult<RunPlan> {
        self.data.prepare()?;
        self.data.setup(Stage::Fit)?;
        let train = self.data.train_loader()?.summary();
        let val = self.data.val_loader()?.summary();

        let inspection = self.inspect()?;
        let devices = inspection.specs.devices as usize;
        let steps_per_epoch = train.batches.div_ceil(devices) as u64;
        let total_steps = inspection.specs.total_steps(Some(steps_per_epoch));
        let checkpoint = CheckpointPlan {
            dir: args.checkpoint_dir.join(&inspection.workload).join(&inspection.submission),
            monitor: inspection.specs.target_metric.clone(),
            mode: inspection.specs.target_metric_mode,
        };

        Ok(RunPlan {
            inspection,
            config: self.data.data().config().clone(),
            train,
            val,
            steps_per_epoch,
            total_steps,
            checkpoint,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub parameters: usize,
    pub numel: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inspection {
    pub workload: String,
    pub submission: String,
    pub specs: RuntimeSpecs,
    pub model: ModelSummary,
    /// The model's own partition, before submission overrides.
    pub groups: Vec<GroupSummary>,
    pub optimizers: OptimizerSetupSummary,
}

/// Best-checkpoint selection handed to the trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPlan {
    pub dir: PathBuf,
    pub monitor: String,
    pub mode: MetricMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    #[serde(flatten)]
    pub inspection: Inspection,
    pub config: WorkloadConfig,
    pub train: LoaderSummary,
    pub val: LoaderSummary,
    pub steps_per_epoch: u64,
    pub total_steps: Option<u64>,
    pub checkpoint: CheckpointPlan,
}

impl RunPlan {
    /// Writes the plan as pretty JSON into `dir`, creating it if needed.
    ///
    /// # Returns
    /// Path of the written `run_plan.json`
    ///
    /// # Errors
    /// `Io` if the directory or file cannot be written.
    pub fn write(&self, dir: &Path) -> BenchResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(RUN_PLAN_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), "wrote run plan");
        Ok(path)
    }

    /// Reads a plan written by [`RunPlan::write`].
    ///
    /// # Errors
    /// `Io` if the file cannot be read, `Json` if it does not parse.
    pub fn load(path: &Path) -> BenchResult<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}
