//! Learning-rate schedules.
//!
//! Schedulers return a scale relative to each group's resolved learning rate,
//! so one schedule drives groups with different `lr_multiplier`s.

use optibench_core::LrScheduler;
use std::f64::consts::PI;

/// Linear warmup from zero followed by cosine decay to `min_scale`.
#[derive(Debug, Clone, PartialEq)]
pub struct CosineWarmup {
    pub warmup: u64,
    pub total: u64,
    pub min_scale: f64,
}

impl CosineWarmup {
    pub fn new(warmup: u64, total: u64) -> Self {
        Self { warmup: warmup.min(total), total, min_scale: 0.0 }
    }

    #[must_use]
    pub fn with_min_scale(mut self, min_scale: f64) -> Self {
        self.min_scale = min_scale;
        self
    }
}

impl LrScheduler for CosineWarmup {
    fn name(&self) -> &str {
        "cosine_warmup"
    }

    fn lr_scale(&self, step: u64) -> f64 {
        if step < self.warmup {
            (step + 1) as f64 / self.warmup as f64
        } else if step < self.total {
            let progress = (step - self.warmup) as f64 / (self.total - self.warmup) as f64;
            let cosine = 0.5 * (1.0 + (progress * PI).cos());
            self.min_scale + (1.0 - self.min_scale) * cosine
        } else {
            self.min_scale
        }
    }
}

/// Multiplies the scale by `gamma` every `step_size` intervals.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDecay {
    pub step_size: u64,
    pub gamma: f64,
}

impl StepDecay {
    pub fn new(step_size: u64, gamma: f64) -> Self {
        Self { step_size: step_size.max(1), gamma }
    }
}

impl LrScheduler for StepDecay {
    fn name(&self) -> &str {
        "step_decay"
    }

    fn lr_scale(&self, step: u64) -> f64 {
        let exponent = i32::try_from(step / self.step_size).unwrap_or(i32::MAX);
        self.gamma.powi(exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_cosine_warmup_curve() {
        let schedule = CosineWarmup::new(10, 110);
        assert!(close(schedule.lr_scale(0), 0.1));
        assert!(close(schedule.lr_scale(9), 1.0));
        assert!(close(schedule.lr_scale(10), 1.0));
        assert!(close(schedule.lr_scale(60), 0.5));
        assert!(schedule.lr_scale(105) < 0.01);
        assert!(close(schedule.lr_scale(110), 0.0));
        assert!(close(schedule.lr_scale(10_000), 0.0));
    }

    #[test]
    fn test_cosine_min_scale_and_no_warmup() {
        let schedule = CosineWarmup::new(0, 4).with_min_scale(0.1);
        assert!(close(schedule.lr_scale(0), 1.0));
        assert!(close(schedule.lr_scale(4), 0.1));
        let schedule = CosineWarmup::new(50, 10);
        assert_eq!(schedule.warmup, 10);
    }

    #[test]
    fn test_step_decay() {
        let schedule = StepDecay::new(3, 0.1);
        assert!(close(schedule.lr_scale(0), 1.0));
        assert!(close(schedule.lr_scale(2), 1.0));
        assert!(close(schedule.lr_scale(3), 0.1));
        assert!(close(schedule.lr_scale(7), 0.01));
        assert_eq!(StepDecay::new(0, 0.5).step_size, 1);
    }
}
