//! Optibench Workloads
//!
//! Built-in benchmark workloads:
//! - `mnist`: sigmoid MLP on handwritten digits
//! - `cifar100`: ReLU MLP on augmented color images
//! - `ogbg`: GIN on molecular graphs
//! - `wmt`: encoder-decoder transformer for translation

pub mod cifar100;
pub mod mlp;
pub mod mnist;
pub mod ogbg;
pub mod ops;
pub mod wmt;

pub use cifar100::{Cifar100Factory, TrainTransforms};
pub use mlp::{Activation, MlpModel};
pub use mnist::MnistFactory;
pub use ogbg::{OgbgFactory, OgbgModel};
pub use wmt::{GroupedTransformer, WmtFactory, WmtModel};

use optibench_core::{PluginKind, Registry, WorkloadFactory};
use std::sync::Arc;

/// Registry holding every built-in workload.
pub fn registry() -> Registry<dyn WorkloadFactory> {
    let registry: Registry<dyn WorkloadFactory> = Registry::new(PluginKind::Workload);
    registry.register(mnist::NAME, Arc::new(MnistFactory));
    registry.register(cifar100::NAME, Arc::new(Cifar100Factory));
    registry.register(ogbg::NAME, Arc::new(OgbgFactory));
    registry.register(wmt::NAME, Arc::new(WmtFactory));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lists_builtins() {
        let names: Vec<String> = registry().list_names().into_iter().collect();
        assert_eq!(names, ["cifar100", "mnist", "ogbg", "wmt"]);
    }
}
