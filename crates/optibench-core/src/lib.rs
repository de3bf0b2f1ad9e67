//! Optibench Core
//!
//! Building blocks of the optimizer benchmark:
//! - Parameters and modules (`nn`)
//! - Parameter groups, partitions and the merge algorithm
//! - The submission and workload plugin contracts
//! - Data modules and loaders
//! - Registries and the run harness

pub mod config;
pub mod data;
pub mod error;
pub mod grouped;
pub mod groups;
pub mod merge;
pub mod nn;
pub mod registry;
pub mod runner;
pub mod specs;
pub mod submission;
pub mod workload;

pub use config::{Hyperparameters, RuntimeArgs, WorkloadConfig, MAX_WORKERS};
pub use data::{Batch, BatchTransform, DataLoader, DataModule, Dataset, DatasetSource, Split, Stage, SyntheticSource, WorkloadDataModule};
pub use error::{BenchError, BenchResult, PluginKind};
pub use grouped::{GroupedModel, GroupedModule, OverrideRule, Overlay, ParamMatcher, override_partition, refine_partition};
pub use groups::{LR_MULTIPLIER, Overrides, ParameterGroup, Partition, WEIGHT_DECAY};
pub use merge::{merge, merge_partitions};
pub use nn::{Module, Network, NetworkBuilder, ParamId, Parameter, ParameterHandle};
pub use registry::Registry;
pub use runner::{Harness, Inspection, Run, RunPlan, RUN_PLAN_FILE};
pub use specs::{MetricMode, RuntimeSpecs};
pub use submission::{
    Gradients, HyperDefaults, LrScheduler, Optimizer, OptimizerSetup, ResolvedGroup, SchedulerConfig, SchedulerInterval, Submission,
    SubmissionFactory, resolve_groups,
};
pub use workload::{BoundModel, Evaluation, StepOutput, WorkloadFactory, WorkloadModel, WorkloadPair};
