//! AdamW baseline: decoupled weight decay, cosine schedule with warmup.

use crate::scheduler::CosineWarmup;
use crate::{check_gradient, hyper_defaults};
use ndarray::{ArrayD, Zip};
use optibench_core::{
    BenchError, BenchResult, Gradients, HyperDefaults, LrScheduler, Optimizer, OptimizerSetup, Overrides, ParamId,
    ParamMatcher, Partition, ResolvedGroup, RuntimeArgs, RuntimeSpecs, SchedulerConfig, SchedulerInterval, Submission,
    SubmissionFactory, WEIGHT_DECAY, refine_partition,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const NAME: &str = "adamw_baseline";

const BETA1: &str = "beta1";
const BETA2: &str = "beta2";
const EPS: &str = "eps";
const WARMUP_FRACTION: &str = "warmup_fraction";
const MIN_LR_SCALE: &str = "min_lr_scale";

/// Per-parameter moment estimates.
#[derive(Debug, Clone)]
struct Moments {
    m: ArrayD<f32>,
    v: ArrayD<f32>,
    step: i32,
}

/// AdamW over resolved parameter groups.
///
/// Each group carries its own `lr`, `weight_decay`, `beta1`, `beta2` and `eps`:
///
/// ```text
/// m = b1 * m + (1 - b1) * g
/// v = b2 * v + (1 - b2) * g^2
/// p = p - lr * (m_hat / (sqrt(v_hat) + eps) + wd * p)
/// ```
#[derive(Debug)]
pub struct AdamW {
    groups: Vec<ResolvedGroup>,
    state: HashMap<ParamId, Moments>,
}

impl AdamW {
    pub fn new(groups: Vec<ResolvedGroup>) -> Self {
        Self { groups, state: HashMap::new() }
    }
}

impl Optimizer for AdamW {
    fn name(&self) -> &str {
        "adamw"
    }

    fn param_groups(&self) -> &[ResolvedGroup] {
        &self.groups
    }

    fn step(&mut self, grads: &Gradients) -> BenchResult<()> {
        for group in &self.groups {
            let b1 = group.extra(BETA1)? as f32;
            let b2 = group.extra(BETA2)? as f32;
            let eps = group.extra(EPS)? as f32;
            let lr = group.lr as f32;
            let wd = group.weight_decay as f32;

            for (id, param) in &group.parameters {
                let Some(grad) = grads.get(id) else { continue };
                let mut value = param.write();
                check_gradient(id, &value, grad)?;

                let moments = self.state.entry(id.clone()).or_insert_with(|| Moments {
                    m: ArrayD::zeros(value.raw_dim()),
                    v: ArrayD::zeros(value.raw_dim()),
                    step: 0,
                });
                moments.step += 1;
                let bias1 = 1.0 - b1.powi(moments.step);
                let bias2 = 1.0 - b2.powi(moments.step);

                Zip::from(&mut *value).and(&mut moments.m).and(&mut moments.v).and(grad).for_each(|p, m, v, &g| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= lr * (m_hat / (v_hat.sqrt() + eps) + wd * *p);
                });
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

/// The AdamW baseline submission.
#[derive(Debug, Clone)]
pub struct AdamWBaseline {
    defaults: HyperDefaults,
    warmup_fraction: f64,
    min_lr_scale: f64,
    decay_vectors: bool,
}

impl AdamWBaseline {
    pub fn new(defaults: HyperDefaults) -> Self {
        Self { defaults, warmup_fraction: 0.05, min_lr_scale: 0.0, decay_vectors: false }
    }

    /// Baseline defaults: lr 1e-3, betas (0.9, 0.999), eps 1e-8, weight decay 0.01.
    pub fn default_hyperparameters() -> HyperDefaults {
        HyperDefaults::new(1e-3, 0.01).with_extra(BETA1, 0.9).with_extra(BETA2, 0.999).with_extra(EPS, 1e-8)
    }

    #[must_use]
    pub fn with_warmup_fraction(mut self, fraction: f64) -> Self {
        self.warmup_fraction = fraction;
        self
    }

    #[must_use]
    pub fn with_min_lr_scale(mut self, scale: f64) -> Self {
        self.min_lr_scale = scale;
        self
    }

    /// Also decay biases and norm scales.
    #[must_use]
    pub fn with_decay_vectors(mut self, decay: bool) -> Self {
        self.decay_vectors = decay;
        self
    }

    fn schedule(&self, specs: &RuntimeSpecs) -> BenchResult<SchedulerConfig> {
        let (total, interval) = match (specs.max_steps, specs.max_epochs) {
            (Some(steps), _) => (steps, SchedulerInterval::Step),
            (None, Some(epochs)) => (u64::from(epochs), SchedulerInterval::Epoch),
            (None, None) => return Err(BenchError::InvalidSpecs("no step or epoch budget to schedule over".to_string())),
        };
        let warmup = (total as f64 * self.warmup_fraction).round() as u64;
        debug!(total, warmup, ?interval, "cosine schedule");
        let scheduler: Box<dyn LrScheduler> =
            Box::new(CosineWarmup::new(warmup, total).with_min_scale(self.min_lr_scale));
        Ok(SchedulerConfig { scheduler, interval })
    }
}

impl Submission for AdamWBaseline {
    fn name(&self) -> &str {
        NAME
    }

    fn defaults(&self) -> &HyperDefaults {
        &self.defaults
    }

    /// Biases and normalization scales (rank-1 tensors) get no weight decay.
    /// Whatever else the model declared for them is kept.
    fn override_groups(&self, model: &Partition) -> BenchResult<Option<Partition>> {
        if self.decay_vectors {
            return Ok(None);
        }
        refine_partition(model, &ParamMatcher::Rank(1), &Overrides::new().with(WEIGHT_DECAY, 0.0)).map(Some)
    }

    fn build(&self, groups: Vec<ResolvedGroup>, specs: &RuntimeSpecs) -> BenchResult<OptimizerSetup> {
        Ok(OptimizerSetup { optimizers: vec![Box::new(AdamW::new(groups))], schedulers: vec![self.schedule(specs)?] })
    }
}

pub struct AdamWFactory;

impl SubmissionFactory for AdamWFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "AdamW with cosine decay and linear warmup, no weight decay on vectors"
    }

    fn get_submission(&self, args: &RuntimeArgs) -> BenchResult<Arc<dyn Submission>> {
        let hparams = args.load_hyperparameters()?;
        let defaults =
            hyper_defaults(NAME, AdamWBaseline::default_hyperparameters(), &hparams, &[WARMUP_FRACTION, MIN_LR_SCALE, "decay_vectors"])?;
        let mut submission = AdamWBaseline::new(defaults);
        if let Some(fraction) = hparams.f64(WARMUP_FRACTION)? {
            submission = submission.with_warmup_fraction(fraction);
        }
        if let Some(scale) = hparams.f64(MIN_LR_SCALE)? {
            submission = submission.with_min_lr_scale(scale);
        }
        if let Some(decay) = hparams.bool("decay_vectors")? {
            submission = submission.with_decay_vectors(decay);
        }
        Ok(Arc::new(submission))
    }
}
