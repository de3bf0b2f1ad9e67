//! Optibench Submissions
//!
//! Baseline optimizer submissions:
//! - `adamw_baseline`: AdamW with cosine decay and linear warmup
//! - `sgd_baseline`: SGD with momentum and step decay

pub mod adamw;
pub mod scheduler;
pub mod sgd;

pub use adamw::{AdamW, AdamWBaseline, AdamWFactory};
pub use scheduler::{CosineWarmup, StepDecay};
pub use sgd::{Sgd, SgdBaseline, SgdFactory};

use ndarray::ArrayD;
use optibench_core::{BenchError, BenchResult, HyperDefaults, Hyperparameters, PluginKind, Registry, SubmissionFactory};
use std::sync::Arc;
use tracing::debug;

const LEARNING_RATE: &str = "learning_rate";
const WEIGHT_DECAY: &str = "weight_decay";

/// Registry holding every built-in submission.
pub fn registry() -> Registry<dyn SubmissionFactory> {
    let registry: Registry<dyn SubmissionFactory> = Registry::new(PluginKind::Submission);
    registry.register(adamw::NAME, Arc::new(AdamWFactory));
    registry.register(sgd::NAME, Arc::new(SgdFactory));
    registry
}

/// Layers the hyperparameter file over a submission's declared defaults.
///
/// `learning_rate`, `weight_decay` and every key of `defaults.extra` may be
/// set; `other` lists submission-specific keys read elsewhere. Anything else
/// is rejected.
fn hyper_defaults(
    submission: &str,
    mut defaults: HyperDefaults,
    hparams: &Hyperparameters,
    other: &[&str],
) -> BenchResult<HyperDefaults> {
    let mut known: Vec<&str> = vec![LEARNING_RATE, WEIGHT_DECAY];
    known.extend(defaults.extra.keys().map(String::as_str));
    known.extend_from_slice(other);
    let unknown = hparams.unknown_keys(&known);
    if !unknown.is_empty() {
        return Err(BenchError::Config(format!(
            "unknown hyperparameters for '{submission}': {}",
            unknown.join(", ")
        )));
    }

    if let Some(lr) = hparams.f64(LEARNING_RATE)? {
        defaults.learning_rate = lr;
    }
    if let Some(wd) = hparams.f64(WEIGHT_DECAY)? {
        defaults.weight_decay = wd;
    }
    let keys: Vec<String> = defaults.extra.keys().cloned().collect();
    for key in keys {
        if let Some(value) = hparams.f64(&key)? {
            defaults.extra.insert(key, value);
        }
    }
    debug!(submission, lr = defaults.learning_rate, wd = defaults.weight_decay, "resolved submission defaults");
    Ok(defaults)
}

fn check_gradient(id: &str, value: &ArrayD<f32>, grad: &ArrayD<f32>) -> BenchResult<()> {
    if value.shape() == grad.shape() {
        return Ok(());
    }
    Err(BenchError::Config(format!(
        "gradient for '{id}' has shape {:?}, parameter has {:?}",
        grad.shape(),
        value.shape()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(src: &str) -> Hyperparameters {
        Hyperparameters::from_table(src.parse().unwrap())
    }

    #[test]
    fn test_registry_lists_baselines() {
        let names: Vec<String> = registry().list_names().into_iter().collect();
        assert_eq!(names, vec!["adamw_baseline".to_string(), "sgd_baseline".to_string()]);
    }

    #[test]
    fn test_hyperparameter_file_overrides_defaults() {
        let defaults = SgdBaseline::default_hyperparameters();
        let resolved = hyper_defaults("sgd", defaults, &table("learning_rate = 1\nmomentum = 0.5"), &[]).unwrap();
        assert_eq!(resolved.learning_rate, 1.0);
        assert!((resolved.weight_decay - 5e-4).abs() < 1e-12);
        assert_eq!(resolved.extra["momentum"], 0.5);
    }

    #[test]
    fn test_unknown_hyperparameters_rejected() {
        let defaults = SgdBaseline::default_hyperparameters();
        let err = hyper_defaults("sgd", defaults, &table("learning_rat = 0.1"), &["gamma"]).unwrap_err();
        assert!(err.to_string().contains("learning_rat"));
    }
}
