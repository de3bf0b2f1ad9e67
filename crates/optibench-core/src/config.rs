//! Runtime arguments, workload configuration and hyperparameter files.
//!
//! All of these are immutable once built and are passed by reference into
//! workload and submission factories.

use crate::error::{BenchError, BenchResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Data loader worker processes are capped at this many.
pub const MAX_WORKERS: usize = 16;

/// Arguments of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeArgs {
    pub workload_name: String,
    pub submission_name: String,
    /// Root of all datasets; each workload uses `data_dir/<workload>`.
    pub data_dir: PathBuf,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Allow the data module to fetch missing datasets.
    #[serde(default)]
    pub download: bool,
    /// TOML file with submission hyperparameters.
    #[serde(default)]
    pub hyperparameters: Option<PathBuf>,
    /// TOML file overriding the workload's default configuration.
    #[serde(default)]
    pub workload_config: Option<PathBuf>,
    /// Data loader workers; defaults to the available parallelism.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Overrides the device count a workload would otherwise declare.
    #[serde(default)]
    pub devices: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub seed: u64,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1)
}

impl RuntimeArgs {
    /// Creates run arguments with defaults for everything but the plugin
    /// names and the dataset root.
    ///
    /// # Arguments
    /// * `workload_name` - Registered workload to run
    /// * `submission_name` - Registered submission to bind
    /// * `data_dir` - Root of all datasets
    #[must_use]
    pub fn new(workload_name: impl Into<String>, submission_name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            workload_name: workload_name.into(),
            submission_name: submission_name.into(),
            data_dir: data_dir.into(),
            checkpoint_dir: default_checkpoint_dir(),
            output_dir: default_output_dir(),
            download: false,
            hyperparameters: None,
            workload_config: None,
            workers: default_workers(),
            devices: None,
            batch_size: None,
            seed: 0,
        }
    }

    #[must_use]
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_hyperparameters(mut self, path: impl Into<PathBuf>) -> Self {
        self.hyperparameters = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_workload_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.workload_config = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn with_devices(mut self, devices: u32) -> Self {
        self.devices = Some(devices);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
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

    /// Checks the arguments before any plugin is built.
    ///
    /// # Errors
    /// `Config` if a plugin name is blank, `workers` is zero or `devices` is zero.
    pub fn validate(&self) -> BenchResult<()> {
        if self.workload_name.trim().is_empty() {
            return Err(BenchError::Config("workload name is required".to_string()));
        }
        if self.submission_name.trim().is_empty() {
            return Err(BenchError::Config("submission name is required".to_string()));
        }
        if self.workers == 0 {
            return Err(BenchError::Config("workers must be >= 1".to_string()));
        }
        if self.devices == Some(0) {
            return Err(BenchError::Config("devices must be >= 1".to_string()));
        }
        Ok(())
    }

    /// Loads the hyperparameter file, or an empty set when none was given.
    ///
    /// # Errors
    /// `Config` if the file cannot be read, `Toml` if it does not parse.
    pub fn load_hyperparameters(&self) -> BenchResult<Hyperparameters> {
        self.hyperparameters.as_deref().map_or_else(|| Ok(Hyperparameters::default()), Hyperparameters::load)
    }

    /// Resolves the configuration of `workload` from its defaults, the
    /// optional workload config file and the CLI overrides, in that order.
    ///
    /// # Errors
    /// Returns error if the workload config file cannot be read or merged.
    pub fn workload_config(&self, defaults: WorkloadConfig) -> BenchResult<WorkloadConfig> {
        let mut config = match &self.workload_config {
            Some(path) => defaults.overlay_file(path)?,
            None => defaults,
        };
        config.data_dir.clone_from(&self.data_dir);
        config.workers = self.workers.min(MAX_WORKERS);
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        debug!(
            workload = %config.name,
            batch_size = config.batch_size,
            workers = config.workers,
            "resolved workload config"
        );
        Ok(config)
    }
}

/// Per-workload configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub name: String,
    /// Each workload sets its own; zero means unset.
    #[serde(default)]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Root of all datasets.
    #[serde(default)]
    pub data_dir: PathBuf,
    /// Workload-specific nested options (e.g. `train_transforms`).
    #[serde(default)]
    pub options: toml::Table,
}

impl WorkloadConfig {
    /// Creates a workload configuration with one worker and no options.
    ///
    /// # Arguments
    /// * `name` - Workload name; also the dataset subdirectory
    /// * `batch_size` - Default batch size of the workload
    #[must_use]
    pub fn new(name: impl Into<String>, batch_size: usize) -> Self {
        Self { name: name.into(), batch_size, workers: 1, data_dir: PathBuf::new(), options: toml::Table::new() }
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// The directory of this workload's dataset.
    pub fn dataset_dir(&self) -> PathBuf {
        self.data_dir.join(&self.name)
    }

    /// Deserializes a typed view of one nested option table.
    ///
    /// # Errors
    /// `Config` if `key` is missing or does not match `T`.
    pub fn option<T: serde::de::DeserializeOwned>(&self, key: &str) -> BenchResult<T> {
        let value = self.options.get(key).cloned().ok_or_else(|| {
            BenchError::Config(format!("workload '{}' has no option '{key}'", self.name))
        })?;
        value
            .try_into()
            .map_err(|e| BenchError::Config(format!("workload '{}' option '{key}': {e}", self.name)))
    }

    /// Applies a TOML file on top of this config; nested tables merge key by key.
    pub fn overlay_file(self, path: &Path) -> BenchResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BenchError::Config(format!("failed to read {}: {e}", path.display())))?;
        let overlay: toml::Table = toml::from_str(&content)?;
        self.overlay(overlay)
    }

    fn overlay(self, overlay: toml::Table) -> BenchResult<Self> {
        let name = self.name.clone();
        let toml::Value::Table(mut base) = toml::Value::try_from(&self)
            .map_err(|e| BenchError::Config(format!("failed to serialize workload config: {e}")))?
        else {
            return Err(BenchError::Config("workload config is not a table".to_string()));
        };
        merge_tables(&mut base, overlay);
        let merged: Self = toml::Value::Table(base)
            .try_into()
            .map_err(|e| BenchError::Config(format!("invalid workload config for '{name}': {e}")))?;
        if merged.name != name {
            return Err(BenchError::Config(format!(
                "workload config file names workload '{}', expected '{name}'",
                merged.name
            )));
        }
        Ok(merged)
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => {
                if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                    merge_tables(existing, incoming);
                } else {
                    base.insert(key, toml::Value::Table(incoming));
                }
            }
            value => {
                base.insert(key, value);
            }
        }
    }
}

/// Submission hyperparameters read from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hyperparameters(toml::Table);

impl Hyperparameters {
    /// Reads a TOML hyperparameter file.
    ///
    /// # Errors
    /// `Config` if the file cannot be read, `Toml` if it does not parse.
    pub fn load(path: &Path) -> BenchResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BenchError::Config(format!("failed to read hyperparameters {}: {e}", path.display())))?;
        let table: toml::Table = toml::from_str(&content)?;
        debug!(path = %path.display(), keys = table.len(), "loaded hyperparameters");
        Ok(Self(table))
    }

    pub fn from_table(table: toml::Table) -> Self {
        Self(table)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reads a float, accepting integer literals.
    ///
    /// # Returns
    /// `None` if the key is absent
    ///
    /// # Errors
    /// `Config` if the value is not a number.
    pub fn f64(&self, key: &str) -> BenchResult<Option<f64>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(toml::Value::Float(v)) => Ok(Some(*v)),
            Some(toml::Value::Integer(v)) => Ok(Some(*v as f64)),
            Some(other) => Err(BenchError::Config(format!("hyperparameter '{key}' must be a number, got {other}"))),
        }
    }

    /// Reads a non-negative integer.
    ///
    /// # Returns
    /// `None` if the key is absent
    ///
    /// # Errors
    /// `Config` if the value is negative or not an integer.
    pub fn u64(&self, key: &str) -> BenchResult<Option<u64>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(toml::Value::Integer(v)) if *v >= 0 => Ok(Some(*v as u64)),
            Some(other) => {
                Err(BenchError::Config(format!("hyperparameter '{key}' must be a non-negative integer, got {other}")))
            }
        }
    }

    /// Reads a boolean flag.
    ///
    /// # Returns
    /// `None` if the key is absent
    ///
    /// # Errors
    /// `Config` if the value is not a boolean.
    pub fn bool(&self, key: &str) -> BenchResult<Option<bool>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(toml::Value::Boolean(v)) => Ok(Some(*v)),
            Some(other) => Err(BenchError::Config(format!("hyperparameter '{key}' must be a boolean, got {other}"))),
        }
    }

    /// Keys not in `known`, so submissions can reject typos.
    pub fn unknown_keys(&self, known: &[&str]) -> Vec<String> {
        self.0.keys().filter(|k| !known.contains(&k.as_str())).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_workload_config_resolution_order() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cifar.toml");
        std::fs::write(
            &path,
            "name = \"cifar100\"\nbatch_size = 64\n[options.train_transforms.horizontal_flip]\np = 0.25\n",
        )
        .unwrap();

        let mut flip = toml::Table::new();
        flip.insert("use".into(), true.into());
        flip.insert("p".into(), 0.5.into());
        let mut transforms = toml::Table::new();
        transforms.insert("horizontal_flip".into(), flip.into());
        let defaults = WorkloadConfig::new("cifar100", 128).with_option("train_transforms", transforms);

        let args = RuntimeArgs::new("cifar100", "adamw_baseline", "/data").with_workload_config(&path).with_workers(64);
        let config = args.workload_config(defaults).unwrap();

        assert_eq!(config.batch_size, 64);
        assert_eq!(config.workers, MAX_WORKERS);
        assert_eq!(config.dataset_dir(), PathBuf::from("/data/cifar100"));
        let flip = &config.options["train_transforms"]["horizontal_flip"];
        assert_eq!(flip["p"].as_float(), Some(0.25));
        assert_eq!(flip["use"].as_bool(), Some(true));

        let args = args.with_batch_size(8);
        let config = args.workload_config(WorkloadConfig::new("cifar100", 128)).unwrap();
        assert_eq!(config.batch_size, 8);
    }

    #[test]
    fn test_workload_config_file_must_match_name() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("wrong.toml");
        std::fs::write(&path, "name = \"mnist\"\n").unwrap();
        let args = RuntimeArgs::new("cifar100", "sgd_baseline", "/data").with_workload_config(&path);
        assert!(matches!(args.workload_config(WorkloadConfig::new("cifar100", 1)), Err(BenchError::Config(_))));
    }

    #[test]
    fn test_hyperparameters_accessors() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hp.toml");
        std::fs::write(&path, "learning_rate = 0.01\nwarmup_steps = 10\nnesterov = true\nbeta1 = 1\n").unwrap();

        let hp = Hyperparameters::load(&path).unwrap();
        assert_eq!(hp.f64("learning_rate").unwrap(), Some(0.01));
        assert_eq!(hp.f64("beta1").unwrap(), Some(1.0));
        assert_eq!(hp.u64("warmup_steps").unwrap(), Some(10));
        assert_eq!(hp.bool("nesterov").unwrap(), Some(true));
        assert_eq!(hp.f64("missing").unwrap(), None);
        assert!(hp.f64("nesterov").is_err());
        assert_eq!(hp.unknown_keys(&["learning_rate", "warmup_steps", "nesterov"]), vec!["beta1".to_string()]);
    }

    #[test]
    fn test_runtime_args_validate() {
        assert!(RuntimeArgs::new("mnist", "sgd_baseline", "/d").validate().is_ok());
        assert!(RuntimeArgs::new("", "sgd_baseline", "/d").validate().is_err());
        assert!(RuntimeArgs::new("mnist", "sgd_baseline", "/d").with_workers(0).validate().is_err());
        assert!(RuntimeArgs::new("mnist", "sgd_baseline", "/d").with_devices(0).validate().is_err());
    }

    #[test]
    fn test_missing_hyperparameter_file() {
        let args = RuntimeArgs::new("mnist", "sgd_baseline", "/d").with_hyperparameters("/nonexistent/hp.toml");
        assert!(matches!(args.load_hyperparameters(), Err(BenchError::Config(_))));
        assert!(RuntimeArgs::new("mnist", "sgd_baseline", "/d").load_hyperparameters().unwrap().is_empty());
    }
}
