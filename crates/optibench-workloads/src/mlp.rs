//! Two-layer perceptron classifier shared by the image workloads.

use crate::ops;
use ndarray::Array2;
use optibench_core::{Batch, BenchResult, BoundModel, Evaluation, Network, RuntimeSpecs, Submission, WorkloadModel};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Sigmoid,
    Relu,
}

impl Activation {
    fn apply(self, x: Array2<f32>) -> Array2<f32> {
        match self {
            Self::Sigmoid => ops::sigmoid(x),
            Self::Relu => ops::relu(x),
        }
    }
}

/// `Linear(in, hidden) -> activation -> Linear(hidden, classes)`, laid out
/// as `0.*` and `2.*` like a sequential container.
pub fn network(name: &str, input: usize, hidden: usize, classes: usize, seed: u64) -> BenchResult<Network> {
    Network::builder(name).seed(seed).linear("0", input, hidden, true).linear("2", hidden, classes, true).build()
}

#[derive(Debug)]
pub struct MlpModel {
    name: &'static str,
    network: Network,
    activation: Activation,
    bound: BoundModel,
    specs: RuntimeSpecs,
}

impl MlpModel {
    pub fn new(
        name: &'static str,
        network: Network,
        activation: Activation,
        submission: Arc<dyn Submission>,
        specs: RuntimeSpecs,
    ) -> BenchResult<Self> {
        let bound = BoundModel::from_raw(network.clone(), submission)?;
        Ok(Self { name, network, activation, bound, specs })
    }

    pub fn forward(&self, inputs: &Array2<f32>) -> BenchResult<Array2<f32>> {
        let hidden = self.activation.apply(ops::linear(&self.network, "0", inputs)?);
        ops::linear(&self.network, "2", &hidden)
    }
}

impl WorkloadModel for MlpModel {
    fn name(&self) -> &str {
        self.name
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
