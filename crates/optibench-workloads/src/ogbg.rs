//! OGBG: molecular property prediction with a GIN encoder.
//!
//! Samples are graphs reduced to their sum-pooled node features, so every GIN
//! convolution acts on a single aggregated node and reduces to its inner MLP.

use crate::ops;
use ndarray::{Array2, Axis};
use optibench_core::{
    Batch, BenchError, BenchResult, BoundModel, DataModule, Evaluation, MetricMode, Network, RuntimeArgs, RuntimeSpecs,
    Submission, SyntheticSource, WorkloadConfig, WorkloadFactory, WorkloadModel, WorkloadPair,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const NAME: &str = "ogbg";

const HIDDEN_CHANNELS: usize = 64;
const NUM_LAYERS: usize = 3;
const BATCH_SIZE: usize = 32;
const DEVICES: u32 = 1;
const DATASET: &str = "dataset";

/// ogbg-molhiv scaffold split sizes, with the test split reused for predict.
const SPLITS: [usize; 4] = [32_901, 4_113, 4_113, 4_113];

/// The `dataset` option table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetOptions {
    pub name: String,
    pub node_feature_dim: usize,
    pub num_classes: usize,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self { name: "ogbg-molhiv".to_string(), node_feature_dim: 9, num_classes: 2 }
    }
}

/// GIN (`jk = cat`) followed by a batch-normed MLP classifier, with the
/// parameter names of the graph library it mirrors.
pub fn network(node_feature_dim: usize, num_classes: usize, seed: u64) -> BenchResult<Network> {
    let mut builder = Network::builder("gin").seed(seed);
    for i in 0..NUM_LAYERS {
        let input = if i == 0 { node_feature_dim } else { HIDDEN_CHANNELS };
        builder = builder
            .linear(&format!("convs.{i}.nn.lins.0"), input, HIDDEN_CHANNELS, true)
            .linear(&format!("convs.{i}.nn.lins.1"), HIDDEN_CHANNELS, HIDDEN_CHANNELS, true);
    }
    builder
        .linear("lin", NUM_LAYERS * HIDDEN_CHANNELS, HIDDEN_CHANNELS, true)
        .linear("classifier.lins.0", HIDDEN_CHANNELS, HIDDEN_CHANNELS, true)
        .batch_norm("classifier.norms.0", HIDDEN_CHANNELS)
        .linear("classifier.lins.1", HIDDEN_CHANNELS, num_classes, true)
        .build()
}

pub fn specs(devices: u32) -> BenchResult<RuntimeSpecs> {
    RuntimeSpecs::new(Some(50), None, devices, "val_acc", MetricMode::Max)
}

#[derive(Debug)]
pub struct OgbgModel {
    network: Network,
    dataset: DatasetOptions,
    bound: BoundModel,
    specs: RuntimeSpecs,
}

impl OgbgModel {
    pub fn new(dataset: DatasetOptions, submission: Arc<dyn Submission>, specs: RuntimeSpecs, seed: u64) -> BenchResult<Self> {
        let network = network(dataset.node_feature_dim, dataset.num_classes, seed)?;
        let bound = BoundModel::from_raw(network.clone(), submission)?;
        Ok(Self { network, dataset, bound, specs })
    }

    pub fn dataset(&self) -> &DatasetOptions {
        &self.dataset
    }

    pub fn forward(&self, pooled: &Array2<f32>) -> BenchResult<Array2<f32>> {
        let net = &self.network;
        let mut x = pooled.clone();
        let mut layers = Vec::with_capacity(NUM_LAYERS);
        for i in 0..NUM_LAYERS {
            let hidden = ops::relu(ops::linear(net, &format!("convs.{i}.nn.lins.0"), &x)?);
            x = ops::relu(ops::linear(net, &format!("convs.{i}.nn.lins.1"), &hidden)?);
            layers.push(x.clone());
        }
        let views: Vec<_> = layers.iter().map(|layer| layer.view()).collect();
        let jk = ndarray::concatenate(Axis(1), &views)?;
        let x = ops::linear(net, "lin", &jk)?;
        let x = ops::batch_norm(net, "classifier.norms.0", &ops::linear(net, "classifier.lins.0", &x)?)?;
        ops::linear(net, "classifier.lins.1", &ops::relu(x))
    }
}

impl WorkloadModel for OgbgModel {
    fn name(&self) -> &str {
        NAME
    }

    fn get_specs(&self) -> &RuntimeSpecs {
        &self.specs
    }

    fn bound(&self) -> &BoundModel {
        &self.bound
    }

    fn evaluate(&self, batch: &Batch) -> BenchResult<Evaluation> {
        let logits = self.forward(&batch.inputs)?;
        Ok(Evaluation {
            loss: ops::cross_entropy(&logits, &batch.targets, None, 0.0)?,
            accuracy: Some(ops::accuracy(&logits, &batch.targets)),
        })
    }
}

pub struct OgbgFactory;

impl WorkloadFactory for OgbgFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "OGBG molecular graphs, 3-layer GIN with jumping knowledge and MLP head"
    }

    fn default_config(&self) -> WorkloadConfig {
        WorkloadConfig::new(NAME, BATCH_SIZE)
    }

    fn get_workload(&self, submission: Arc<dyn Submission>, args: &RuntimeArgs) -> BenchResult<WorkloadPair> {
        let config = args.workload_config(self.default_config())?;
        let dataset: DatasetOptions =
            if config.options.contains_key(DATASET) { config.option(DATASET)? } else { DatasetOptions::default() };
        if dataset.node_feature_dim == 0 || dataset.num_classes < 2 {
            return Err(BenchError::Config(format!(
                "{}: node_feature_dim must be >= 1 and num_classes >= 2",
                dataset.name
            )));
        }
        debug!(workload = NAME, dataset = %dataset.name, "resolved dataset options");

        let source = SyntheticSource::new(dataset.node_feature_dim, dataset.num_classes, SPLITS);
        let model = OgbgModel::new(dataset, submission, specs(args.devices.unwrap_or(DEVICES))?, args.seed)?;
        let data = DataModule::new(config, source).with_download(args.download).with_seed(args.seed);
        Ok((Box::new(model), Box::new(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optibench_core::Module;

    #[test]
    fn test_layout_follows_gin_naming() {
        let net = network(9, 2, 0).unwrap();
        assert_eq!(net.param("convs.0.nn.lins.0.weight").unwrap().shape(), vec![64, 9]);
        assert_eq!(net.param("convs.2.nn.lins.1.weight").unwrap().shape(), vec![64, 64]);
        assert_eq!(net.param("lin.weight").unwrap().shape(), vec![64, 192]);
        assert_eq!(net.param("classifier.lins.1.weight").unwrap().shape(), vec![2, 64]);
        // Running statistics are buffers.
        let trainable = net.trainable_parameters();
        assert!(trainable.contains_key("classifier.norms.0.weight"));
        assert!(!trainable.contains_key("classifier.norms.0.running_var"));
        assert_eq!(trainable.len(), 3 * 4 + 2 + 4 + 2);
    }
}
