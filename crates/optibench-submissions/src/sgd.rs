//! SGD baseline: heavy-ball momentum, step decay per epoch.

use crate::scheduler::StepDecay;
use crate::{check_gradient, hyper_defaults};
use ndarray::{ArrayD, Zip};
use optibench_core::{
    BenchResult, Gradients, HyperDefaults, Optimizer, OptimizerSetup, ParamId, ResolvedGroup, RuntimeArgs, RuntimeSpecs,
    SchedulerConfig, SchedulerInterval, Submission, SubmissionFactory,
};
use std::collections::HashMap;
use std::sync::Arc;

pub const NAME: &str = "sgd_baseline";

const MOMENTUM: &str = "momentum";
const GAMMA: &str = "gamma";
const STEP_SIZE: &str = "step_size";
const NESTEROV: &str = "nesterov";

/// Stochastic gradient descent with coupled (L2) weight decay.
#[derive(Debug)]
pub struct Sgd {
    groups: Vec<ResolvedGroup>,
    nesterov: bool,
    velocity: HashMap<ParamId, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(groups: Vec<ResolvedGroup>, nesterov: bool) -> Self {
        Self { groups, nesterov, velocity: HashMap::new() }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn param_groups(&self) -> &[ResolvedGroup] {
        &self.groups
    }

    fn step(&mut self, grads: &Gradients) -> BenchResult<()> {
        for group in &self.groups {
            let mu = group.extra(MOMENTUM)? as f32;
            let lr = group.lr as f32;
            let wd = group.weight_decay as f32;

            for (id, param) in &group.parameters {
                let Some(grad) = grads.get(id) else { continue };
                let mut value = param.write();
                check_gradient(id, &value, grad)?;

                // L2 decay folds into the gradient before momentum.
                let mut d = grad.clone();
                Zip::from(&mut d).and(&*value).for_each(|d, &p| *d += wd * p);

                if mu != 0.0 {
                    let fresh = !self.velocity.contains_key(id);
                    let buf = self.velocity.entry(id.clone()).or_insert_with(|| d.clone());
                    if !fresh {
                        Zip::from(&mut *buf).and(&d).for_each(|b, &d| *b = mu * *b + d);
                    }
                    if self.nesterov {
                        Zip::from(&mut d).and(&*buf).for_each(|d, &b| *d += mu * b);
                    } else {
                        d.assign(&*buf);
                    }
                }

                Zip::from(&mut *value).and(&d).for_each(|p, &d| *p -= lr * d);
            }
        }
        Ok(())
    }

    fn set_lr_scale(&mut self, scale: f64) {
        for group in &mut self.groups {
            group.lr = group.base_lr * scale;
        }
    }
}

/// The SGD baseline submission.
#[derive(Debug, Clone)]
pub struct SgdBaseline {
    defaults: HyperDefaults,
    nesterov: bool,
    gamma: f64,
    /// Epochs between decays; a third of the epoch budget when unset.
    step_size: Option<u64>,
}

impl SgdBaseline {
    pub fn new(defaults: HyperDefaults) -> Self {
        Self { defaults, nesterov: false, gamma: 0.1, step_size: None }
    }

    /// Baseline defaults: lr 0.1, momentum 0.9, weight decay 5e-4.
    pub fn default_hyperparameters() -> HyperDefaults {
        HyperDefaults::new(0.1, 5e-4).with_extra(MOMENTUM, 0.9)
    }

    #[must_use]
    pub fn with_nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov = nesterov;
        self
    }

    #[must_use]
    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    #[must_use]
    pub fn with_step_size(mut self, step_size: u64) -> Self {
        self.step_size = Some(step_size);
        self
    }

    fn step_size(&self, specs: &RuntimeSpecs) -> u64 {
        self.step_size.unwrap_or_else(|| specs.max_epochs.map_or(1, |epochs| u64::from(epochs / 3).max(1)))
    }
}

impl Submission for SgdBaseline {
    fn name(&self) -> &str {
        NAME
    }

    fn defaults(&self) -> &HyperDefaults {
        &self.defaults
    }

    fn build(&self, groups: Vec<ResolvedGroup>, specs: &RuntimeSpecs) -> BenchResult<OptimizerSetup> {
        let schedule = SchedulerConfig {
            scheduler: Box::new(StepDecay::new(self.step_size(specs), self.gamma)),
            interval: SchedulerInterval::Epoch,
        };
        Ok(OptimizerSetup { optimizers: vec![Box::new(Sgd::new(groups, self.nesterov))], schedulers: vec![schedule] })
    }
}

pub struct SgdFactory;

impl SubmissionFactory for SgdFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "SGD with momentum and step decay"
    }

    fn get_submission(&self, args: &RuntimeArgs) -> BenchResult<Arc<dyn Submission>> {
        let hparams = args.load_hyperparameters()?;
        let defaults = hyper_defaults(NAME, SgdBaseline::default_hyperparameters(), &hparams, &[GAMMA, STEP_SIZE, NESTEROV])?;
        let mut submission = SgdBaseline::new(defaults);
        if let Some(nesterov) = hparams.bool(NESTEROV)? {
            submission = submission.with_nesterov(nesterov);
        }
        if let Some(gamma) = hparams.f64(GAMMA)? {
            submission = submission.with_gamma(gamma);
        }
        if let Some(step_size) = hparams.u64(STEP_SIZE)? {
            submission = submission.with_step_size(step_size);
        }
        Ok(Arc::new(submission))
    }
}
