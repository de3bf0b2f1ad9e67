//! CIFAR-100: 32x32 color images in 100 classes.
//!
//! Training batches go through the configured augmentations; the toggles live
//! in the `train_transforms` option table of the workload config.

use crate::mlp::{self, Activation, MlpModel};
use ndarray::{Array2, ArrayView1};
use optibench_core::{
    Batch, BatchTransform, BenchError, BenchResult, DataModule, MetricMode, RuntimeArgs, RuntimeSpecs, Submission,
    SyntheticSource, WorkloadConfig, WorkloadFactory, WorkloadPair,
};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const NAME: &str = "cifar100";

const CHANNELS: usize = 3;
const IMAGE_SIZE: usize = 32;
const INPUT_SIZE: usize = CHANNELS * IMAGE_SIZE * IMAGE_SIZE;
const NUM_HIDDEN: usize = 512;
const NUM_CLASSES: usize = 100;
const BATCH_SIZE: usize = 128;
const DEVICES: u32 = 1;
const TRAIN_TRANSFORMS: &str = "train_transforms";

/// The test set doubles as validation set.
const SPLITS: [usize; 4] = [50_000, 10_000, 10_000, 10_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    Constant,
    Edge,
    Reflect,
    Symmetric,
}

impl PaddingMode {
    /// Source index for a possibly out-of-range coordinate; `None` reads as zero.
    fn resolve(self, i: isize, n: isize) -> Option<usize> {
        if (0..n).contains(&i) {
            return Some(i as usize);
        }
        let mapped = match self {
            Self::Constant => return None,
            Self::Edge => i.clamp(0, n - 1),
            Self::Reflect if i < 0 => -i,
            Self::Reflect => 2 * n - 2 - i,
            Self::Symmetric if i < 0 => -i - 1,
            Self::Symmetric => 2 * n - 1 - i,
        };
        Some(mapped.clamp(0, n - 1) as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomCrop {
    #[serde(rename = "use")]
    pub enabled: bool,
    pub size: usize,
    pub padding: usize,
    pub padding_mode: PaddingMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizontalFlip {
    #[serde(rename = "use")]
    pub enabled: bool,
    pub p: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrivialAugment {
    #[serde(rename = "use")]
    pub enabled: bool,
}

/// Augmentations applied to training images, in this order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainTransforms {
    pub random_crop: RandomCrop,
    pub horizontal_flip: HorizontalFlip,
    pub trivial_augment: TrivialAugment,
}

impl Default for TrainTransforms {
    fn default() -> Self {
        Self {
            random_crop: RandomCrop { enabled: true, size: IMAGE_SIZE, padding: 4, padding_mode: PaddingMode::Reflect },
            horizontal_flip: HorizontalFlip { enabled: true, p: 0.5 },
            trivial_augment: TrivialAugment { enabled: false },
        }
    }
}

impl TrainTransforms {
    fn validate(&self) -> BenchResult<()> {
        if self.random_crop.size != IMAGE_SIZE {
            return Err(BenchError::Config(format!(
                "random_crop.size must be {IMAGE_SIZE}, got {}",
                self.random_crop.size
            )));
        }
        if self.random_crop.padding >= IMAGE_SIZE {
            return Err(BenchError::Config(format!("random_crop.padding must be < {IMAGE_SIZE}")));
        }
        if !(0.0..=1.0).contains(&self.horizontal_flip.p) {
            return Err(BenchError::Config("horizontal_flip.p must be in [0, 1]".to_string()));
        }
        Ok(())
    }

    fn as_toml(&self) -> toml::Value {
        let table = |entries: Vec<(&str, toml::Value)>| {
            toml::Value::Table(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
        };
        let mode = match self.random_crop.padding_mode {
            PaddingMode::Constant => "constant",
            PaddingMode::Edge => "edge",
            PaddingMode::Reflect => "reflect",
            PaddingMode::Symmetric => "symmetric",
        };
        table(vec![
            (
                "random_crop",
                table(vec![
                    ("use", self.random_crop.enabled.into()),
                    ("size", (self.random_crop.size as i64).into()),
                    ("padding", (self.random_crop.padding as i64).into()),
                    ("padding_mode", mode.into()),
                ]),
            ),
            (
                "horizontal_flip",
                table(vec![("use", self.horizontal_flip.enabled.into()), ("p", self.horizontal_flip.p.into())]),
            ),
            ("trivial_augment", table(vec![("use", self.trivial_augment.enabled.into())])),
        ])
    }
}

/// Applies [`TrainTransforms`] to flattened CHW images.
#[derive(Debug, Clone)]
pub struct Augment {
    transforms: TrainTransforms,
}

impl Augment {
    pub fn new(transforms: TrainTransforms) -> Self {
        Self { transforms }
    }

    fn augment_image(&self, image: ArrayView1<'_, f32>, rng: &mut StdRng) -> Vec<f32> {
        let mut pixels = image.to_vec();
        let crop = &self.transforms.random_crop;
        if crop.enabled && crop.padding > 0 {
            let span = 2 * crop.padding + IMAGE_SIZE - crop.size;
            let dy = rng.gen_range(0..=span) as isize - crop.padding as isize;
            let dx = rng.gen_range(0..=span) as isize - crop.padding as isize;
            pixels = shift(&pixels, dy, dx, crop.padding_mode);
        }
        let flip = &self.transforms.horizontal_flip;
        if flip.enabled && rng.gen_bool(flip.p) {
            for row in pixels.chunks_mut(IMAGE_SIZE) {
                row.reverse();
            }
        }
        if self.transforms.trivial_augment.enabled {
            trivial_augment(&mut pixels, rng);
        }
        pixels
    }
}

impl BatchTransform for Augment {
    fn apply(&self, batch: Batch, rng: &mut StdRng) -> Batch {
        let (rows, cols) = batch.inputs.dim();
        if cols != INPUT_SIZE {
            warn!(workload = NAME, expected = INPUT_SIZE, found = cols, "batch is not 32x32 RGB, skipping augmentation");
            return batch;
        }
        let mut data = Vec::with_capacity(rows * INPUT_SIZE);
        for image in batch.inputs.rows() {
            data.extend(self.augment_image(image, rng));
        }
        match Array2::from_shape_vec((rows, cols), data) {
            Ok(inputs) => Batch { inputs, targets: batch.targets },
            Err(err) => {
                warn!(workload = NAME, error = %err, "augmented batch has the wrong shape, using it unaugmented");
                batch
            }
        }
    }
}

/// Reads every output pixel from `(y + dy, x + dx)` of the source image.
fn shift(pixels: &[f32], dy: isize, dx: isize, mode: PaddingMode) -> Vec<f32> {
    let n = IMAGE_SIZE as isize;
    let mut out = vec![0.0; pixels.len()];
    for c in 0..CHANNELS {
        let plane = c * IMAGE_SIZE * IMAGE_SIZE;
        for y in 0..IMAGE_SIZE {
            for x in 0..IMAGE_SIZE {
                let sy = mode.resolve(y as isize + dy, n);
                let sx = mode.resolve(x as isize + dx, n);
                if let (Some(sy), Some(sx)) = (sy, sx) {
                    out[plane + y * IMAGE_SIZE + x] = pixels[plane + sy * IMAGE_SIZE + sx];
                }
            }
        }
    }
    out
}

/// One randomly chosen photometric op with a random magnitude.
fn trivial_augment(pixels: &mut [f32], rng: &mut StdRng) {
    let magnitude: f32 = rng.gen_range(0.0..0.99);
    match rng.gen_range(0..4) {
        0 => {}
        1 => {
            let factor = if rng.gen_bool(0.5) { 1.0 + magnitude } else { 1.0 - magnitude };
            pixels.iter_mut().for_each(|v| *v = (*v * factor).clamp(0.0, 1.0));
        }
        2 => {
            let mean = pixels.iter().sum::<f32>() / pixels.len() as f32;
            let factor = if rng.gen_bool(0.5) { 1.0 + magnitude } else { 1.0 - magnitude };
            pixels.iter_mut().for_each(|v| *v = (mean + (*v - mean) * factor).clamp(0.0, 1.0));
        }
        _ => {
            let threshold = 1.0 - magnitude;
            pixels.iter_mut().filter(|v| **v >= threshold).for_each(|v| *v = 1.0 - *v);
        }
    }
}

pub fn specs(devices: u32) -> BenchResult<RuntimeSpecs> {
    RuntimeSpecs::new(Some(50), None, devices, "val_acc", MetricMode::Max)
}

pub struct Cifar100Factory;

impl WorkloadFactory for Cifar100Factory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "CIFAR-100 images, MLP 3072-512-100 with crop/flip augmentation"
    }

    fn default_config(&self) -> WorkloadConfig {
        WorkloadConfig::new(NAME, BATCH_SIZE).with_option(TRAIN_TRANSFORMS, TrainTransforms::default().as_toml())
    }

    fn get_workload(&self, submission: Arc<dyn Submission>, args: &RuntimeArgs) -> BenchResult<WorkloadPair> {
        let config = args.workload_config(self.default_config())?;
        let transforms: TrainTransforms = config.option(TRAIN_TRANSFORMS)?;
        transforms.validate()?;
        debug!(workload = NAME, ?transforms, "resolved train transforms");

        let network = mlp::network("cifar100_mlp", INPUT_SIZE, NUM_HIDDEN, NUM_CLASSES, args.seed)?;
        let model = MlpModel::new(NAME, network, Activation::Relu, submission, specs(args.devices.unwrap_or(DEVICES))?)?;

        let source = SyntheticSource::new(INPUT_SIZE, NUM_CLASSES, SPLITS).with_transform(Arc::new(Augment::new(transforms)));
        let data = DataModule::new(config, source).with_download(args.download).with_seed(args.seed);
        Ok((Box::new(model), Box::new(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;
    use rand::SeedableRng;

    fn gradient_image() -> Array1<f32> {
        Array1::from_shape_fn(INPUT_SIZE, |i| (i % IMAGE_SIZE) as f32 / IMAGE_SIZE as f32)
    }

    #[test]
    fn test_padding_modes() {
        assert_eq!(PaddingMode::Constant.resolve(-1, 4), None);
        assert_eq!(PaddingMode::Edge.resolve(-2, 4), Some(0));
        assert_eq!(PaddingMode::Reflect.resolve(-1, 4), Some(1));
        assert_eq!(PaddingMode::Reflect.resolve(4, 4), Some(2));
        assert_eq!(PaddingMode::Symmetric.resolve(-1, 4), Some(0));
        assert_eq!(PaddingMode::Symmetric.resolve(5, 4), Some(2));
        assert_eq!(PaddingMode::Edge.resolve(2, 4), Some(2));
    }

    #[test]
    fn test_flip_with_certainty() {
        let mut transforms = TrainTransforms::default();
        transforms.random_crop.enabled = false;
        transforms.horizontal_flip.p = 1.0;
        let image = gradient_image();
        let mut rng = StdRng::seed_from_u64(0);
        let out = Augment::new(transforms).augment_image(image.view(), &mut rng);
        assert_eq!(out[0], image[IMAGE_SIZE - 1]);
        assert_eq!(out[IMAGE_SIZE - 1], image[0]);
    }

    #[test]
    fn test_disabled_transforms_are_identity() {
        let mut transforms = TrainTransforms::default();
        transforms.random_crop.enabled = false;
        transforms.horizontal_flip.enabled = false;
        let batch = Batch::new(Array2::from_shape_fn((2, INPUT_SIZE), |(r, c)| (r + c) as f32), vec![1, 2]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let out = Augment::new(transforms).apply(batch.clone(), &mut rng);
        assert_eq!(out, batch);
    }

    #[test]
    fn test_batches_of_other_widths_pass_through() {
        let batch = Batch::new(Array2::from_shape_fn((3, 12), |(r, c)| (r * c) as f32), vec![0, 1, 2]).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let out = Augment::new(TrainTransforms::default()).apply(batch.clone(), &mut rng);
        assert_eq!(out, batch);
    }

    #[test]
    fn test_shift_with_constant_padding() {
        let image = gradient_image().to_vec();
        let shifted = shift(&image, 0, 2, PaddingMode::Constant);
        assert_eq!(shifted[0], image[2]);
        assert_eq!(shifted[IMAGE_SIZE - 1], 0.0);
    }

    #[test]
    fn test_default_options_round_trip_through_config() {
        let config = Cifar100Factory.default_config();
        let transforms: TrainTransforms = config.option(TRAIN_TRANSFORMS).unwrap();
        assert_eq!(transforms, TrainTransforms::default());
        let mut bad = transforms;
        bad.random_crop.size = 24;
        assert!(bad.validate().is_err());
    }
}
