//! The stopping/device/metric contract a workload declares to the trainer.

use crate::error::{BenchError, BenchResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether the target metric should be maximized or minimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricMode {
    Max,
    Min,
}

impl MetricMode {
    /// Returns true if `candidate` is better than `best` under this mode.
    pub fn improves(self, candidate: f64, best: f64) -> bool {
        match self {
            Self::Max => candidate > best,
            Self::Min => candidate < best,
        }
    }
}

impl fmt::Display for MetricMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Max => f.write_str("max"),
            Self::Min => f.write_str("min"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpecs {
    /// `None` means unbounded; `max_steps` decides.
    pub max_epochs: Option<u32>,
    /// `None` means unbounded; `max_epochs` decides.
    pub max_steps: Option<u64>,
    pub devices: u32,
    /// Key into the logged-metric namespace (e.g. `val_acc`).
    pub target_metric: String,
    pub target_metric_mode: MetricMode,
}

impl RuntimeSpecs {
    /// Builds validated specs.
    ///
    /// # Errors
    /// `InvalidSpecs` when both limits are unset, `devices` is zero or the
    /// target metric is empty.
    pub fn new(
        max_epochs: Option<u32>,
        max_steps: Option<u64>,
        devices: u32,
        target_metric: impl Into<String>,
        target_metric_mode: MetricMode,
    ) -> BenchResult<Self> {
        let specs = Self { max_epochs, max_steps, devices, target_metric: target_metric.into(), target_metric_mode };
        specs.validate()?;
        Ok(specs)
    }

    pub fn validate(&self) -> BenchResult<()> {
        if self.max_epochs.is_none() && self.max_steps.is_none() {
            return Err(BenchError::InvalidSpecs("one of max_epochs or max_steps must be set".to_string()));
        }
        if self.devices == 0 {
            return Err(BenchError::InvalidSpecs("devices must be >= 1".to_string()));
        }
        if self.target_metric.trim().is_empty() {
            return Err(BenchError::InvalidSpecs("target_metric is required".to_string()));
        }
        Ok(())
    }

    /// Total optimizer steps, when known, given the number of steps per epoch.
    ///
    /// An explicit `max_steps` wins; otherwise it is derived from `max_epochs`.
    pub fn total_steps(&self, steps_per_epoch: Option<u64>) -> Option<u64> {
        self.max_steps.or_else(|| Some(u64::from(self.max_epochs?) * steps_per_epoch?))
    }
}
