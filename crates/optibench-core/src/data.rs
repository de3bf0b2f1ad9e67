//! Data modules: per-stage dataset slots and the loaders built from them.
//!
//! Real dataset downloads and transform pipelines belong to an external
//! collaborator. A [`DatasetSource`] either reads `<split>.json` files from the
//! workload's dataset directory or generates deterministic synthetic samples
//! with the workload's shapes.

use crate::config::WorkloadConfig;
use crate::error::{BenchError, BenchResult};
use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Lifecycle stage passed to [`WorkloadDataModule::setup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fit,
    Validate,
    Test,
    Predict,
}

impl Stage {
    /// Splits a stage needs.
    pub fn splits(self) -> &'static [Split] {
        match self {
            Self::Fit => &[Split::Train, Split::Val],
            Self::Validate => &[Split::Val],
            Self::Test => &[Split::Test],
            Self::Predict => &[Split::Predict],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fit => "fit",
            Self::Validate => "validate",
            Self::Test => "test",
            Self::Predict => "predict",
        })
    }
}

impl FromStr for Stage {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fit" => Ok(Self::Fit),
            "validate" => Ok(Self::Validate),
            "test" => Ok(Self::Test),
            "predict" => Ok(Self::Predict),
            other => Err(BenchError::Config(format!("unknown stage '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
    Test,
    Predict,
}

impl Split {
    pub const ALL: [Self; 4] = [Self::Train, Self::Val, Self::Test, Self::Predict];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
            Self::Predict => "predict",
        }
    }

    fn slot(self) -> &'static str {
        match self {
            Self::Train => "train_dataset",
            Self::Val => "val_dataset",
            Self::Test => "test_dataset",
            Self::Predict => "predict_dataset",
        }
    }
}

/// A mini-batch of flattened samples and class (or token) targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Array2<f32>,
    pub targets: Vec<usize>,
}

impl Batch {
    pub fn new(inputs: Array2<f32>, targets: Vec<usize>) -> BenchResult<Self> {
        if inputs.nrows() != targets.len() {
            return Err(BenchError::Config(format!(
                "batch has {} inputs but {} targets",
                inputs.nrows(),
                targets.len()
            )));
        }
        Ok(Self { inputs, targets })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// An in-memory split.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    inputs: Array2<f32>,
    targets: Vec<usize>,
}

/// On-disk layout of `<split>.json`.
#[derive(Debug, Serialize, Deserialize)]
struct DatasetFile {
    inputs: Vec<Vec<f32>>,
    targets: Vec<usize>,
}

impl Dataset {
    pub fn new(inputs: Array2<f32>, targets: Vec<usize>) -> BenchResult<Self> {
        let Batch { inputs, targets } = Batch::new(inputs, targets)?;
        Ok(Self { inputs, targets })
    }

    /// Reads a split file with row-major `inputs` and matching `targets`.
    pub fn load(path: &Path) -> BenchResult<Self> {
        let file: DatasetFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let width = file.inputs.first().map_or(0, Vec::len);
        if file.inputs.iter().any(|row| row.len() != width) {
            return Err(BenchError::Config(format!("{}: rows have different widths", path.display())));
        }
        let rows = file.inputs.len();
        let inputs = Array2::from_shape_vec((rows, width), file.inputs.into_iter().flatten().collect())?;
        Self::new(inputs, file.targets)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.inputs.ncols()
    }

    fn select(&self, indices: &[usize]) -> Batch {
        Batch {
            inputs: self.inputs.select(Axis(0), indices),
            targets: indices.iter().map(|&i| self.targets[i]).collect(),
        }
    }
}

/// Augmentation applied to training batches only.
pub trait BatchTransform: Send + Sync + fmt::Debug {
    fn apply(&self, batch: Batch, rng: &mut StdRng) -> Batch;
}

/// Where a workload's samples come from.
pub trait DatasetSource: Send + Sync + fmt::Debug {
    /// Width of one flattened input row.
    fn num_features(&self) -> usize;

    /// Number of classes (or target vocabulary size).
    fn num_classes(&self) -> usize;

    /// Size of the split in the full benchmark dataset.
    fn nominal_len(&self, split: Split) -> usize;

    /// Samples generated when no split file is present.
    fn synthetic_len(&self, split: Split) -> usize {
        self.nominal_len(split).min(256)
    }

    fn train_transform(&self) -> Option<Arc<dyn BatchTransform>> {
        None
    }

    /// Loads `dir/<split>.json` if present, otherwise synthesizes samples.
    fn load(&self, split: Split, dir: &Path, seed: u64) -> BenchResult<Dataset> {
        let path = dir.join(format!("{}.json", split.as_str()));
        if path.is_file() {
            let dataset = Dataset::load(&path)?;
            if dataset.num_features() != self.num_features() {
                return Err(BenchError::Config(format!(
                    "{}: expected {} features, found {}",
                    path.display(),
                    self.num_features(),
                    dataset.num_features()
                )));
            }
            return Ok(dataset);
        }
        self.synthesize(split, seed)
    }

    fn synthesize(&self, split: Split, seed: u64) -> BenchResult<Dataset> {
        let rows = self.synthetic_len(split);
        let mut rng = StdRng::seed_from_u64(seed ^ (split as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let inputs = Array2::from_shape_fn((rows, self.num_features()), |_| rng.gen_range(0.0..1.0));
        let classes = self.num_classes().max(1);
        let targets = (0..rows).map(|_| rng.gen_range(0..classes)).collect();
        Dataset::new(inputs, targets)
    }
}

/// Source with fixed shapes and nominal split sizes.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    pub features: usize,
    pub classes: usize,
    /// Nominal sizes of train, val, test and predict, in that order.
    pub sizes: [usize; 4],
    pub transform: Option<Arc<dyn BatchTransform>>,
}

impl SyntheticSource {
    pub fn new(features: usize, classes: usize, sizes: [usize; 4]) -> Self {
        Self { features, classes, sizes, transform: None }
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Arc<dyn BatchTransform>) -> Self {
        self.transform = Some(transform);
        self
    }
}

impl DatasetSource for SyntheticSource {
    fn num_features(&self) -> usize {
        self.features
    }

    fn num_classes(&self) -> usize {
        self.classes
    }

    fn nominal_len(&self, split: Split) -> usize {
        self.sizes[split as usize]
    }

    fn train_transform(&self) -> Option<Arc<dyn BatchTransform>> {
        self.transform.clone()
    }
}

/// Iterates a dataset in mini-batches.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<Dataset>,
    batch_size: usize,
    pub shuffle: bool,
    pub workers: usize,
    seed: u64,
    transform: Option<Arc<dyn BatchTransform>>,
}

impl DataLoader {
    /// Samples per batch, at least 1. The last batch of an epoch may be smaller.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    /// Batches of one epoch. Shuffling and augmentation are seeded by `epoch`.
    pub fn epoch(&self, epoch: u64) -> Vec<Batch> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch));
        if self.shuffle {
            order.shuffle(&mut rng);
        }
        order
            .chunks(self.batch_size)
            .map(|chunk| {
                let batch = self.dataset.select(chunk);
                match &self.transform {
                    Some(transform) => transform.apply(batch, &mut rng),
                    None => batch,
                }
            })
            .collect()
    }

    pub fn summary(&self) -> LoaderSummary {
        LoaderSummary {
            samples: self.num_samples(),
            batches: self.len(),
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            workers: self.workers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderSummary {
    pub samples: usize,
    pub batches: usize,
    pub batch_size: usize,
    pub shuffle: bool,
    pub workers: usize,
}

/// Shared data-module state: configuration plus one slot per split.
#[derive(Debug)]
pub struct DataModule {
    config: WorkloadConfig,
    download: bool,
    seed: u64,
    source: Box<dyn DatasetSource>,
    slots: [Option<Arc<Dataset>>; 4],
}

impl DataModule {
    pub fn new(config: WorkloadConfig, source: impl DatasetSource + 'static) -> Self {
        Self { config, download: false, seed: 0, source: Box::new(source), slots: Default::default() }
    }

    #[must_use]
    pub fn with_download(mut self, download: bool) -> Self {
        self.download = download;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    pub fn source(&self) -> &dyn DatasetSource {
        self.source.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    pub fn workers(&self) -> usize {
        self.config.workers.min(crate::config::MAX_WORKERS)
    }

    /// Ensures the dataset directory exists, creating it only when downloads are allowed.
    pub fn prepare(&self) -> BenchResult<()> {
        let dir = self.config.dataset_dir();
        if dir.is_dir() {
            return Ok(());
        }
        if !self.download {
            return Err(BenchError::Config(format!(
                "dataset directory {} does not exist (enable download to create it)",
                dir.display()
            )));
        }
        std::fs::create_dir_all(&dir)?;
        info!(workload = %self.config.name, dir = %dir.display(), "created dataset directory");
        Ok(())
    }

    /// Loads the splits `stage` needs. Already loaded splits are kept.
    pub fn setup(&mut self, stage: Stage) -> BenchResult<()> {
        let dir = self.config.dataset_dir();
        for &split in stage.splits() {
            if self.slots[split as usize].is_some() {
                continue;
            }
            let dataset = self.source.load(split, &dir, self.seed)?;
            debug!(workload = %self.config.name, %stage, split = split.as_str(), samples = dataset.len(), "loaded split");
            self.slots[split as usize] = Some(Arc::new(dataset));
        }
        Ok(())
    }

    /// Fills a slot directly, bypassing the source.
    pub fn set_dataset(&mut self, split: Split, dataset: Dataset) {
        self.slots[split as usize] = Some(Arc::new(dataset));
    }

    pub fn dataset(&self, split: Split) -> Option<&Dataset> {
        self.slots[split as usize].as_deref()
    }

    /// Builds a loader for `split`.
    ///
    /// # Errors
    /// `MisconfiguredData` if the split was never set up or the batch size is zero.
    pub fn loader(&self, split: Split) -> BenchResult<DataLoader> {
        let dataset = self.slots[split as usize].clone().ok_or_else(|| self.misconfigured(split.slot()))?;
        if self.config.batch_size < 1 {
            return Err(self.misconfigured("batch_size"));
        }
        let train = split == Split::Train;
        Ok(DataLoader {
            dataset,
            batch_size: self.config.batch_size,
            shuffle: train,
            workers: self.workers(),
            seed: self.seed,
            transform: if train { self.source.train_transform() } else { None },
        })
    }

    fn misconfigured(&self, field: &str) -> BenchError {
        BenchError::MisconfiguredData { workload: self.config.name.clone(), field: field.to_string() }
    }
}

/// Data side of a workload.
pub trait WorkloadDataModule: Send + Sync + fmt::Debug {
    fn data(&self) -> &DataModule;

    fn data_mut(&mut self) -> &mut DataModule;

    fn prepare(&mut self) -> BenchResult<()> {
        self.data().prepare()
    }

    fn setup(&mut self, stage: Stage) -> BenchResult<()> {
        self.data_mut().setup(stage)
    }

    fn train_loader(&self) -> BenchResult<DataLoader> {
        self.data().loader(Split::Train)
    }

    fn val_loader(&self) -> BenchResult<DataLoader> {
        self.data().loader(Split::Val)
    }

    fn test_loader(&self) -> BenchResult<DataLoader> {
        self.data().loader(Split::Test)
    }

    fn predict_loader(&self) -> BenchResult<DataLoader> {
        self.data().loader(Split::Predict)
    }
}

impl WorkloadDataModule for DataModule {
    fn data(&self) -> &DataModule {
        self
    }

    fn data_mut(&mut self) -> &mut DataModule {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn module(dir: &Path, batch_size: usize) -> DataModule {
        let mut config = WorkloadConfig::new("toy", batch_size);
        config.data_dir = dir.to_path_buf();
        config.workers = 64;
        DataModule::new(config, SyntheticSource::new(4, 3, [10, 5, 5, 5]))
    }

    #[test]
    fn test_loader_before_setup_is_misconfigured() {
        let tmp = TempDir::new().unwrap();
        let data = module(tmp.path(), 4);
        let err = data.loader(Split::Train).unwrap_err();
        assert!(matches!(
            err,
            BenchError::MisconfiguredData { ref workload, ref field } if workload == "toy" && field == "train_dataset"
        ));
    }

    #[test]
    fn test_zero_batch_size_is_misconfigured() {
        let tmp = TempDir::new().unwrap();
        let mut data = module(tmp.path(), 0);
        data.setup(Stage::Fit).unwrap();
        let err = data.val_loader().unwrap_err();
        assert!(matches!(err, BenchError::MisconfiguredData { ref field, .. } if field == "batch_size"));
    }

    #[test]
    fn test_setup_stages_fill_their_slots() {
        let tmp = TempDir::new().unwrap();
        let mut data = module(tmp.path(), 4);
        data.setup(Stage::Fit).unwrap();
        assert!(data.dataset(Split::Train).is_some());
        assert!(data.dataset(Split::Val).is_some());
        assert!(data.dataset(Split::Test).is_none());

        let train = data.train_loader().unwrap();
        assert!(train.shuffle);
        assert_eq!(train.workers, 16);
        assert_eq!(train.num_samples(), 10);
        assert_eq!(train.batch_size(), 4);
        assert_eq!(train.len(), 3);
        let sizes: Vec<usize> = train.epoch(0).iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(!data.val_loader().unwrap().shuffle);
    }

    #[test]
    fn test_prepare_honours_download_flag() {
        let tmp = TempDir::new().unwrap();
        let data = module(tmp.path(), 4);
        assert!(data.prepare().is_err());
        let data = data.with_download(true);
        data.prepare().unwrap();
        assert!(tmp.path().join("toy").is_dir());
    }

    #[test]
    fn test_split_file_takes_precedence() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("toy");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("test.json"),
            r#"{"inputs": [[0.0, 1.0, 2.0, 3.0], [4.0, 5.0, 6.0, 7.0]], "targets": [2, 0]}"#,
        )
        .unwrap();

        let mut data = module(tmp.path(), 8);
        data.setup(Stage::Test).unwrap();
        let batches = data.test_loader().unwrap().epoch(0);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].targets, vec![2, 0]);
        assert_eq!(batches[0].inputs[[1, 3]], 7.0);
    }

    #[test]
    fn test_synthetic_data_is_deterministic() {
        let source = SyntheticSource::new(4, 3, [10, 5, 5, 5]);
        let a = source.synthesize(Split::Train, 7).unwrap();
        let b = source.synthesize(Split::Train, 7).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, source.synthesize(Split::Val, 7).unwrap());
    }

    #[test]
    fn test_stage_parsing() {
        assert_eq!("fit".parse::<Stage>().unwrap(), Stage::Fit);
        assert!("train".parse::<Stage>().is_err());
        assert_eq!(Stage::Predict.to_string(), "predict");
    }
}
