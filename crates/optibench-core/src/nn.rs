//! Parameters and modules.
//!
//! A [`Module`] exposes named parameter handles. Handles are shared
//! (`Arc`) so that grouping metadata and optimizers can refer to the same
//! tensors the model owns; values are mutated in place by optimizers only.

use crate::error::{BenchError, BenchResult};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Unique, dotted parameter identifier (e.g. `encoder.layers.0.weight`).
pub type ParamId = String;

/// Shared handle to a parameter.
pub type ParameterHandle = Arc<Parameter>;

/// A tensor owned by a model.
pub struct Parameter {
    value: RwLock<ArrayD<f32>>,
    requires_grad: bool,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("shape", &self.shape())
            .field("requires_grad", &self.requires_grad)
            .finish_non_exhaustive()
    }
}

impl Parameter {
    /// Creates a trainable parameter.
    #[must_use]
    pub fn new(value: ArrayD<f32>) -> ParameterHandle {
        Arc::new(Self { value: RwLock::new(value), requires_grad: true })
    }

    /// Creates a buffer that is carried by the model but never optimized.
    #[must_use]
    pub fn frozen(value: ArrayD<f32>) -> ParameterHandle {
        Arc::new(Self { value: RwLock::new(value), requires_grad: false })
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn shape(&self) -> Vec<usize> {
        self.read().shape().to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.read().ndim()
    }

    /// Number of scalar elements.
    pub fn numel(&self) -> usize {
        self.read().len()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ArrayD<f32>> {
        self.value.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ArrayD<f32>> {
        self.value.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Anything that owns named parameters.
pub trait Module: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// All parameters, trainable or not, in declaration order.
    fn named_parameters(&self) -> Vec<(ParamId, ParameterHandle)>;

    /// Parameters with `requires_grad == true`, keyed by id.
    fn trainable_parameters(&self) -> BTreeMap<ParamId, ParameterHandle> {
        self.named_parameters().into_iter().filter(|(_, p)| p.requires_grad()).collect()
    }

    /// Total number of trainable scalars.
    fn num_parameters(&self) -> usize {
        self.trainable_parameters().values().map(|p| p.numel()).sum()
    }
}

/// A flat parameter container assembled from layer descriptions.
///
/// Workloads describe their architecture as a tree of prefixed parameters;
/// forward computations read the tensors back by id.
#[derive(Debug, Clone)]
pub struct Network {
    name: String,
    params: Vec<(ParamId, ParameterHandle)>,
}

impl Network {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> NetworkBuilder {
        NetworkBuilder::new(name)
    }

    /// Looks up a parameter by id.
    pub fn param(&self, id: &str) -> BenchResult<&ParameterHandle> {
        self.params
            .iter()
            .find(|(name, _)| name == id)
            .map(|(_, p)| p)
            .ok_or_else(|| BenchError::Config(format!("network '{}' has no parameter '{id}'", self.name)))
    }

    /// Parameters whose id starts with `prefix`.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a ParamId, &'a ParameterHandle)> + 'a {
        self.params.iter().filter(move |(name, _)| name.starts_with(prefix)).map(|(n, p)| (n, p))
    }
}

impl Module for Network {
    fn name(&self) -> &str {
        &self.name
    }

    fn named_parameters(&self) -> Vec<(ParamId, ParameterHandle)> {
        self.params.clone()
    }
}

/// Builder for [`Network`].
///
/// Weights of rank two or more use Xavier-uniform initialization, vectors are
/// zero-initialized (norm scales start at one).
pub struct NetworkBuilder {
    name: String,
    params: Vec<(ParamId, ParameterHandle)>,
    rng: StdRng,
}

impl NetworkBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), params: Vec::new(), rng: StdRng::seed_from_u64(0) }
    }

    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Adds a raw trainable tensor.
    #[must_use]
    pub fn tensor(mut self, id: impl Into<String>, shape: &[usize]) -> Self {
        let value = if shape.len() > 1 { self.xavier_uniform(shape) } else { ArrayD::zeros(IxDyn(shape)) };
        self.params.push((id.into(), Parameter::new(value)));
        self
    }

    /// Adds a non-trainable buffer.
    #[must_use]
    pub fn buffer(mut self, id: impl Into<String>, value: ArrayD<f32>) -> Self {
        self.params.push((id.into(), Parameter::frozen(value)));
        self
    }

    /// `{prefix}.weight` with shape `[out, in]` and optionally `{prefix}.bias`.
    #[must_use]
    pub fn linear(self, prefix: &str, in_features: usize, out_features: usize, bias: bool) -> Self {
        let this = self.tensor(format!("{prefix}.weight"), &[out_features, in_features]);
        if bias { this.tensor(format!("{prefix}.bias"), &[out_features]) } else { this }
    }

    #[must_use]
    pub fn embedding(self, prefix: &str, num_embeddings: usize, dim: usize) -> Self {
        self.tensor(format!("{prefix}.weight"), &[num_embeddings, dim])
    }

    #[must_use]
    pub fn layer_norm(mut self, prefix: &str, dim: usize) -> Self {
        self.params.push((format!("{prefix}.weight"), Parameter::new(ArrayD::ones(IxDyn(&[dim])))));
        self.tensor(format!("{prefix}.bias"), &[dim])
    }

    /// Affine scale/shift plus frozen running statistics.
    #[must_use]
    pub fn batch_norm(self, prefix: &str, dim: usize) -> Self {
        self.layer_norm(prefix, dim)
            .buffer(format!("{prefix}.running_mean"), ArrayD::zeros(IxDyn(&[dim])))
            .buffer(format!("{prefix}.running_var"), ArrayD::ones(IxDyn(&[dim])))
    }

    /// Nests another network's parameters under `prefix`.
    #[must_use]
    pub fn child(mut self, prefix: &str, network: &Network) -> Self {
        for (id, param) in &network.params {
            self.params.push((format!("{prefix}.{id}"), Arc::clone(param)));
        }
        self
    }

    pub fn build(self) -> BenchResult<Network> {
        let mut seen = HashSet::new();
        for (id, _) in &self.params {
            if !seen.insert(id.as_str()) {
                return Err(BenchError::Config(format!(
                    "network '{}' declares parameter '{id}' twice",
                    self.name
                )));
            }
        }
        Ok(Network { name: self.name, params: self.params })
    }

    fn xavier_uniform(&mut self, shape: &[usize]) -> ArrayD<f32> {
        let receptive: usize = shape[2..].iter().product();
        let fan_out = shape[0] * receptive;
        let fan_in = shape[1] * receptive;
        let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
        let rng = &mut self.rng;
        ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.gen_range(-bound..=bound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_layout() {
        let net = Network::builder("mlp").linear("0", 4, 3, true).build().unwrap();
        assert_eq!(net.param("0.weight").unwrap().shape(), vec![3, 4]);
        assert_eq!(net.param("0.bias").unwrap().shape(), vec![3]);
        assert_eq!(net.num_parameters(), 15);
    }

    #[test]
    fn test_buffers_are_not_trainable() {
        let net = Network::builder("bn").batch_norm("norm", 8).build().unwrap();
        assert_eq!(net.named_parameters().len(), 4);
        let trainable = net.trainable_parameters();
        assert_eq!(trainable.len(), 2);
        assert!(trainable.contains_key("norm.weight"));
        assert!(!trainable.contains_key("norm.running_mean"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = Network::builder("dup").tensor("w", &[2]).tensor("w", &[2]).build();
        assert!(matches!(result, Err(BenchError::Config(_))));
    }

    #[test]
    fn test_child_shares_handles() {
        let head = Network::builder("head").linear("proj", 2, 2, false).build().unwrap();
        let net = Network::builder("outer").child("generator", &head).build().unwrap();
        let outer = net.param("generator.proj.weight").unwrap();
        assert!(Arc::ptr_eq(outer, head.param("proj.weight").unwrap()));
    }

    #[test]
    fn test_xavier_bounds() {
        let net = Network::builder("w").seed(7).tensor("w", &[10, 20]).build().unwrap();
        let bound = (6.0f32 / 30.0).sqrt();
        let w = net.param("w").unwrap().read();
        assert!(w.iter().all(|v| v.abs() <= bound));
    }
}
