//! The contract every optimizer submission satisfies.
//!
//! A submission turns a grouped model into optimizers and learning-rate
//! schedulers. Per-group hyperparameters are resolved as submission defaults
//! (already layered with the hyperparameter file) overridden by each group's
//! overrides.

use crate::config::RuntimeArgs;
use crate::error::{BenchError, BenchResult};
use crate::grouped::GroupedModule;
use crate::groups::{LR_MULTIPLIER, Overrides, Partition, WEIGHT_DECAY};
use crate::merge::merge;
use crate::nn::{ParamId, ParameterHandle};
use crate::specs::RuntimeSpecs;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Gradients keyed by parameter id.
pub type Gradients = BTreeMap<ParamId, ArrayD<f32>>;

/// Base hyperparameters of a submission after the hyperparameter file was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperDefaults {
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Optimizer-specific values (betas, momentum, ...). Group overrides may
    /// replace these by name.
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
}

impl HyperDefaults {
    #[must_use]
    pub fn new(learning_rate: f64, weight_decay: f64) -> Self {
        Self { learning_rate, weight_decay, extra: BTreeMap::new() }
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: f64) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A parameter group with concrete hyperparameters.
#[derive(Debug, Clone)]
pub struct ResolvedGroup {
    pub parameters: BTreeMap<ParamId, ParameterHandle>,
    /// Learning rate before any schedule is applied.
    pub base_lr: f64,
    /// Learning rate currently in effect.
    pub lr: f64,
    pub weight_decay: f64,
    pub extra: BTreeMap<String, f64>,
    /// The overrides this group was resolved from.
    pub overrides: Overrides,
}

impl ResolvedGroup {
    pub fn extra(&self, key: &str) -> BenchResult<f64> {
        self.extra
            .get(key)
            .copied()
            .ok_or_else(|| BenchError::Config(format!("resolved group has no hyperparameter '{key}'")))
    }

    pub fn summary(&self) -> ResolvedGroupSummary {
        ResolvedGroupSummary {
            parameters: self.parameters.keys().cloned().collect(),
            lr: self.lr,
            weight_decay: self.weight_decay,
            extra: self.extra.clone(),
            overrides: self.overrides.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedGroupSummary {
    pub parameters: Vec<ParamId>,
    pub lr: f64,
    pub weight_decay: f64,
    pub extra: BTreeMap<String, f64>,
    pub overrides: Overrides,
}

/// Layers each group's overrides on top of `defaults`.
///
/// `lr_multiplier` scales the base learning rate, `weight_decay` replaces the
/// default, any other key must name an entry of `defaults.extra`.
pub fn resolve_groups(partition: &Partition, defaults: &HyperDefaults, submission: &str) -> BenchResult<Vec<ResolvedGroup>> {
    let mut resolved = Vec::with_capacity(partition.len());
    for group in partition.groups().iter().filter(|g| !g.is_empty()) {
        let mut extra = defaults.extra.clone();
        for (key, value) in group.overrides.iter() {
            if key == LR_MULTIPLIER || key == WEIGHT_DECAY {
                continue;
            }
            let Some(slot) = extra.get_mut(key) else {
                return Err(BenchError::Config(format!(
                    "override '{key}' is not a hyperparameter of submission '{submission}'"
                )));
            };
            *slot = *value;
        }
        let lr = defaults.learning_rate * group.overrides.get(LR_MULTIPLIER).unwrap_or(1.0);
        resolved.push(ResolvedGroup {
            parameters: group.members.clone(),
            base_lr: lr,
            lr,
            weight_decay: group.overrides.get(WEIGHT_DECAY).unwrap_or(defaults.weight_decay),
            extra,
            overrides: group.overrides.clone(),
        });
    }
    Ok(resolved)
}

/// An optimizer bound to resolved parameter groups.
pub trait Optimizer: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn param_groups(&self) -> &[ResolvedGroup];

    /// Applies one update. Parameters without a gradient are left untouched.
    fn step(&mut self, grads: &Gradients) -> BenchResult<()>;

    /// Sets every group's learning rate to `scale * base_lr`.
    fn set_lr_scale(&mut self, scale: f64);

    fn current_lrs(&self) -> Vec<f64> {
        self.param_groups().iter().map(|g| g.lr).collect()
    }
}

/// Maps a step (or epoch) index to a learning-rate scale.
pub trait LrScheduler: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn lr_scale(&self, step: u64) -> f64;
}

/// When the trainer advances a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerInterval {
    Step,
    Epoch,
}

#[derive(Debug)]
pub struct SchedulerConfig {
    pub scheduler: Box<dyn LrScheduler>,
    pub interval: SchedulerInterval,
}

/// Optimizers and schedulers handed to the trainer.
#[derive(Debug, Default)]
pub struct OptimizerSetup {
    pub optimizers: Vec<Box<dyn Optimizer>>,
    pub schedulers: Vec<SchedulerConfig>,
}

impl OptimizerSetup {
    /// Applies every scheduler at `index` to every optimizer whose interval matches.
    pub fn apply_schedules(&mut self, interval: SchedulerInterval, index: u64) {
        for config in self.schedulers.iter().filter(|c| c.interval == interval) {
            let scale = config.scheduler.lr_scale(index);
            for optimizer in &mut self.optimizers {
                optimizer.set_lr_scale(scale);
            }
        }
    }

    pub fn summary(&self) -> OptimizerSetupSummary {
        OptimizerSetupSummary {
            optimizers: self
                .optimizers
                .iter()
                .map(|o| OptimizerSummary {
                    name: o.name().to_string(),
                    groups: o.param_groups().iter().map(ResolvedGroup::summary).collect(),
                })
                .collect(),
            schedulers: self
                .schedulers
                .iter()
                .map(|s| SchedulerSummary { name: s.scheduler.name().to_string(), interval: s.interval })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSetupSummary {
    pub optimizers: Vec<OptimizerSummary>,
    pub schedulers: Vec<SchedulerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSummary {
    pub name: String,
    pub groups: Vec<ResolvedGroupSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSummary {
    pub name: String,
    pub interval: SchedulerInterval,
}

/// A pluggable optimizer strategy.
pub trait Submission: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Defaults after the hyperparameter file was applied.
    fn defaults(&self) -> &HyperDefaults;

    /// Overrides the submission wants on top of the model's own grouping.
    ///
    /// `model` is the model's partition, read once per configuration. The
    /// returned partition is merged over it, and a non-empty override set
    /// replaces the model's set for that parameter, so submissions that only
    /// add keys should build on `model` (see [`refine_partition`]).
    ///
    /// [`refine_partition`]: crate::grouped::refine_partition
    fn override_groups(&self, _model: &Partition) -> BenchResult<Option<Partition>> {
        Ok(None)
    }

    /// Builds optimizers and schedulers for already resolved groups.
    fn build(&self, groups: Vec<ResolvedGroup>, specs: &RuntimeSpecs) -> BenchResult<OptimizerSetup>;

    /// Reads the model's partition once, merges the submission's overrides,
    /// resolves hyperparameters and builds the optimizer setup.
    ///
    /// # Errors
    /// `UnboundModel` if the model has no trainable parameters yet.
    fn configure_optimizers(&self, model: &dyn GroupedModule, specs: &RuntimeSpecs) -> BenchResult<OptimizerSetup> {
        let params = model.trainable_parameters();
        if params.is_empty() {
            return Err(BenchError::UnboundModel { submission: self.name().to_string() });
        }

        let base = model.parameter_groups()?;
        let partition = match self.override_groups(&base)? {
            Some(overrides) => merge(&base, &overrides)?,
            None => base,
        };
        let groups = resolve_groups(&partition, self.defaults(), self.name())?;
        debug!(
            submission = %self.name(),
            model = %model.name(),
            groups = groups.len(),
            "resolved parameter groups"
        );

        let setup = self.build(groups, specs)?;
        info!(
            submission = %self.name(),
            optimizers = setup.optimizers.len(),
            schedulers = setup.schedulers.len(),
            "configured optimizers"
        );
        Ok(setup)
    }
}

/// Entry point of a submission plugin.
pub trait SubmissionFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Builds the submission bound to `args`. Pure construction apart from
    /// reading the hyperparameter file.
    fn get_submission(&self, args: &RuntimeArgs) -> BenchResult<Arc<dyn Submission>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouped::GroupedModel;
    use crate::groups::ParameterGroup;
    use crate::nn::{Module, Network};
    use crate::specs::MetricMode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct RecordingSubmission {
        defaults: HyperDefaults,
        boost: Option<ParamId>,
    }

    impl Submission for RecordingSubmission {
        fn name(&self) -> &str {
            "recording"
        }

        fn defaults(&self) -> &HyperDefaults {
            &self.defaults
        }

        fn override_groups(&self, model: &Partition) -> BenchResult<Option<Partition>> {
            let Some(id) = &self.boost else { return Ok(None) };
            let (selected, rest): (BTreeMap<_, _>, BTreeMap<_, _>) =
                model.parameters().into_iter().partition(|(k, _)| k == id);
            Ok(Some(Partition::new(vec![
                ParameterGroup::new(selected, Overrides::new().with(LR_MULTIPLIER, 2.0)),
                ParameterGroup::all(rest),
            ])?))
        }

        fn build(&self, groups: Vec<ResolvedGroup>, _specs: &RuntimeSpecs) -> BenchResult<OptimizerSetup> {
            Ok(OptimizerSetup { optimizers: vec![Box::new(Recorded { groups })], schedulers: Vec::new() })
        }
    }

    #[derive(Debug)]
    struct Recorded {
        groups: Vec<ResolvedGroup>,
    }

    impl Optimizer for Recorded {
        fn name(&self) -> &str {
            "recorded"
        }

        fn param_groups(&self) -> &[ResolvedGroup] {
            &self.groups
        }

        fn step(&mut self, _grads: &Gradients) -> BenchResult<()> {
            Ok(())
        }

        fn set_lr_scale(&mut self, scale: f64) {
            for g in &mut self.groups {
                g.lr = g.base_lr * scale;
            }
        }
    }

    #[derive(Debug)]
    struct CountingModel {
        inner: GroupedModel,
        calls: AtomicUsize,
    }

    impl GroupedModule for CountingModel {
        fn module(&self) -> &dyn Module {
            self.inner.module()
        }

        fn parameter_groups(&self) -> BenchResult<Partition> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.parameter_groups()
        }
    }

    fn specs() -> RuntimeSpecs {
        RuntimeSpecs::new(Some(1), None, 1, "val_acc", MetricMode::Max).unwrap()
    }

    fn three_params() -> Network {
        Network::builder("tiny").tensor("w1", &[2, 2]).tensor("w2", &[2, 2]).tensor("b1", &[2]).build().unwrap()
    }

    #[test]
    fn test_submission_override_end_to_end() {
        let model = GroupedModel::from_raw(three_params()).unwrap();
        let submission = RecordingSubmission { defaults: HyperDefaults::new(0.1, 0.01), boost: Some("w1".into()) };

        let setup = submission.configure_optimizers(&model, &specs()).unwrap();
        let groups = setup.optimizers[0].param_groups();
        assert_eq!(groups.len(), 2);

        let plain = &groups[0];
        assert_eq!(plain.parameters.keys().cloned().collect::<Vec<_>>(), vec!["b1".to_string(), "w2".to_string()]);
        assert!(plain.overrides.is_empty());
        assert!((plain.lr - 0.1).abs() < 1e-12);

        let boosted = &groups[1];
        assert_eq!(boosted.parameters.keys().cloned().collect::<Vec<_>>(), vec!["w1".to_string()]);
        assert_eq!(boosted.overrides.get(LR_MULTIPLIER), Some(2.0));
        assert!((boosted.lr - 0.2).abs() < 1e-12);
        assert!((boosted.weight_decay - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_parameter_groups_read_once() {
        let model = CountingModel { inner: GroupedModel::from_raw(three_params()).unwrap(), calls: AtomicUsize::new(0) };
        let submission = RecordingSubmission { defaults: HyperDefaults::new(0.1, 0.0), boost: Some("w2".into()) };
        submission.configure_optimizers(&model, &specs()).unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        submission.configure_optimizers(&model, &specs()).unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[derive(Debug)]
    struct EmptyModel {
        network: Network,
    }

    impl GroupedModule for EmptyModel {
        fn module(&self) -> &dyn Module {
            &self.network
        }

        fn parameter_groups(&self) -> BenchResult<Partition> {
            Ok(Partition::default())
        }
    }

    #[test]
    fn test_unbound_model_rejected() {
        let model = EmptyModel { network: Network::builder("empty").build().unwrap() };
        let submission = RecordingSubmission { defaults: HyperDefaults::new(0.1, 0.0), boost: None };
        let err = submission.configure_optimizers(&model, &specs()).unwrap_err();
        assert!(matches!(err, BenchError::UnboundModel { ref submission } if submission == "recording"));
    }

    #[test]
    fn test_resolve_groups_layers_overrides() {
        let net = three_params();
        let params = net.trainable_parameters();
        let partition = Partition::new(vec![
            ParameterGroup::new(
                params.iter().filter(|(k, _)| k.starts_with('w')).map(|(k, v)| (k.clone(), v.clone())).collect(),
                Overrides::new().with("momentum", 0.5),
            ),
            ParameterGroup::new(
                params.iter().filter(|(k, _)| k.starts_with('b')).map(|(k, v)| (k.clone(), v.clone())).collect(),
                Overrides::new().with(WEIGHT_DECAY, 0.0).with(LR_MULTIPLIER, 1.0),
            ),
        ])
        .unwrap();
        let defaults = HyperDefaults::new(0.5, 0.1).with_extra("momentum", 0.9);

        let groups = resolve_groups(&partition, &defaults, "sgd").unwrap();
        assert_eq!(groups[0].extra("momentum").unwrap(), 0.5);
        assert!((groups[0].weight_decay - 0.1).abs() < 1e-12);
        assert_eq!(groups[1].weight_decay, 0.0);
        assert!((groups[1].lr - 0.5).abs() < 1e-12);
        assert_eq!(groups[1].extra("momentum").unwrap(), 0.9);

        let bad = Partition::identity(params).into_groups().into_iter().map(|g| g.with_override("beta9", 1.0)).collect();
        let err = resolve_groups(&Partition::new(bad).unwrap(), &defaults, "sgd").unwrap_err();
        assert!(err.to_string().contains("beta9"));
    }

    #[test]
    fn test_apply_schedules_matches_interval() {
        #[derive(Debug)]
        struct Half;
        impl LrScheduler for Half {
            fn name(&self) -> &str {
                "half"
            }
            fn lr_scale(&self, _step: u64) -> f64 {
                0.5
            }
        }

        let model = GroupedModel::from_raw(three_params()).unwrap();
        let submission = RecordingSubmission { defaults: HyperDefaults::new(1.0, 0.0), boost: None };
        let mut setup = submission.configure_optimizers(&model, &specs()).unwrap();
        setup.schedulers.push(SchedulerConfig { scheduler: Box::new(Half), interval: SchedulerInterval::Epoch });

        setup.apply_schedules(SchedulerInterval::Step, 3);
        assert_eq!(setup.optimizers[0].current_lrs(), vec![1.0]);
        setup.apply_schedules(SchedulerInterval::Epoch, 3);
        assert_eq!(setup.optimizers[0].current_lrs(), vec![0.5]);
        assert_eq!(setup.summary().schedulers[0].interval, SchedulerInterval::Epoch);
    }
}
