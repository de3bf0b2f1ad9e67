//! The workload contract: a model bound to a submission plus its data module.

use crate::config::{RuntimeArgs, WorkloadConfig};
use crate::data::{Batch, WorkloadDataModule};
use crate::error::BenchResult;
use crate::grouped::{GroupedModel, GroupedModule};
use crate::nn::Module;
use crate::specs::RuntimeSpecs;
use crate::submission::{OptimizerSetup, Submission};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Loss plus metrics of one step, keyed in the logged-metric namespace
/// (`train_loss`, `val_acc`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub loss: f64,
    pub metrics: BTreeMap<String, f64>,
}

/// Raw result of evaluating a batch, before it is namespaced by stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: Option<f64>,
}

impl Evaluation {
    fn into_step(self, prefix: &str) -> StepOutput {
        let mut metrics = BTreeMap::from([(format!("{prefix}_loss"), self.loss)]);
        if let Some(acc) = self.accuracy {
            metrics.insert(format!("{prefix}_acc"), acc);
        }
        StepOutput { loss: self.loss, metrics }
    }
}

/// A grouped model together with the submission that will optimize it.
#[derive(Debug)]
pub struct BoundModel {
    grouped: Box<dyn GroupedModule>,
    submission: Arc<dyn Submission>,
}

impl BoundModel {
    /// Binds a plain module, wrapping it with the identity grouping.
    ///
    /// # Errors
    /// `InvalidModel` if the module has no trainable parameters.
    pub fn from_raw(module: impl Module + 'static, submission: Arc<dyn Submission>) -> BenchResult<Self> {
        Ok(Self::from_grouped(GroupedModel::from_raw(module)?, submission))
    }

    /// Binds a model that already declares its own grouping.
    pub fn from_grouped(grouped: impl GroupedModule + 'static, submission: Arc<dyn Submission>) -> Self {
        Self { grouped: Box::new(grouped), submission }
    }

    pub fn grouped(&self) -> &dyn GroupedModule {
        self.grouped.as_ref()
    }

    pub fn submission(&self) -> &Arc<dyn Submission> {
        &self.submission
    }

    pub fn configure_optimizers(&self, specs: &RuntimeSpecs) -> BenchResult<OptimizerSetup> {
        self.submission.configure_optimizers(self.grouped.as_ref(), specs)
    }
}

/// Capabilities a workload's model exposes to the trainer.
pub trait WorkloadModel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn get_specs(&self) -> &RuntimeSpecs;

    fn bound(&self) -> &BoundModel;

    /// Forward pass and loss on one batch.
    fn evaluate(&self, batch: &Batch) -> BenchResult<Evaluation>;

    fn grouped_model(&self) -> &dyn GroupedModule {
        self.bound().grouped()
    }

    fn configure_optimizers(&self) -> BenchResult<OptimizerSetup> {
        self.bound().configure_optimizers(self.get_specs())
    }

    fn training_step(&self, batch: &Batch) -> BenchResult<StepOutput> {
        Ok(self.evaluate(batch)?.into_step("train"))
    }

    fn validation_step(&self, batch: &Batch) -> BenchResult<StepOutput> {
        Ok(self.evaluate(batch)?.into_step("val"))
    }

    fn test_step(&self, batch: &Batch) -> BenchResult<StepOutput> {
        Ok(self.evaluate(batch)?.into_step("test"))
    }
}

/// A model and data module ready for the trainer.
pub type WorkloadPair = (Box<dyn WorkloadModel>, Box<dyn WorkloadDataModule>);

/// Entry point of a workload plugin.
pub trait WorkloadFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Batch size and workload-specific options before runtime args apply.
    fn default_config(&self) -> WorkloadConfig;

    /// Builds the model bound to `submission` and the matching data module.
    /// Performs no dataset I/O; that is deferred to `prepare`/`setup`.
    fn get_workload(&self, submission: Arc<dyn Submission>, args: &RuntimeArgs) -> BenchResult<WorkloadPair>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_namespacing() {
        let step = Evaluation { loss: 0.5, accuracy: Some(0.75) }.into_step("val");
        assert_eq!(step.loss, 0.5);
        assert_eq!(step.metrics["val_loss"], 0.5);
        assert_eq!(step.metrics["val_acc"], 0.75);

        let step = Evaluation { loss: 1.0, accuracy: None }.into_step("train");
        assert_eq!(step.metrics.len(), 1);
        assert!(step.metrics.contains_key("train_loss"));
    }
}
