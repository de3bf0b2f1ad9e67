//! MNIST: handwritten digits with a small sigmoid MLP.

use crate::mlp::{self, Activation, MlpModel};
use optibench_core::{
    BenchResult, DataModule, MetricMode, RuntimeArgs, RuntimeSpecs, Submission, SyntheticSource, WorkloadConfig,
    WorkloadFactory, WorkloadPair,
};
use std::sync::Arc;
use tracing::debug;

pub const NAME: &str = "mnist";

const INPUT_SIZE: usize = 28 * 28;
const NUM_HIDDEN: usize = 128;
const NUM_CLASSES: usize = 10;
const BATCH_SIZE: usize = 512;
const DEVICES: u32 = 1;

/// Train/val/test/predict sizes after holding out 5000 training images.
const SPLITS: [usize; 4] = [55_000, 5_000, 10_000, 10_000];

pub fn specs(devices: u32) -> BenchResult<RuntimeSpecs> {
    RuntimeSpecs::new(Some(42), Some(4536), devices, "val_acc", MetricMode::Max)
}

pub struct MnistFactory;

impl WorkloadFactory for MnistFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "MNIST digits, MLP 784-128-10 with sigmoid"
    }

    fn default_config(&self) -> WorkloadConfig {
        WorkloadConfig::new(NAME, BATCH_SIZE)
    }

    fn get_workload(&self, submission: Arc<dyn Submission>, args: &RuntimeArgs) -> BenchResult<WorkloadPair> {
        let config = args.workload_config(self.default_config())?;
        let network = mlp::network("mnist_mlp", INPUT_SIZE, NUM_HIDDEN, NUM_CLASSES, args.seed)?;
        let model = MlpModel::new(NAME, network, Activation::Sigmoid, submission, specs(args.devices.unwrap_or(DEVICES))?)?;
        debug!(workload = NAME, batch_size = config.batch_size, "built mnist workload");

        let data = DataModule::new(config, SyntheticSource::new(INPUT_SIZE, NUM_CLASSES, SPLITS))
            .with_download(args.download)
            .with_seed(args.seed);
        Ok((Box::new(model), Box::new(data)))
    }
}
