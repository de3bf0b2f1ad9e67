use thiserror::Error;

pub type BenchResult<T> = std::result::Result<T, BenchError>;

/// Kind of plugin looked up through a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Workload,
    Submission,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workload => f.write_str("workload"),
            Self::Submission => f.write_str("submission"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BenchError {
    /// A model without trainable parameters was wrapped.
    #[error("invalid model '{model}': no trainable parameters")]
    InvalidModel { model: String },

    /// Partitions disagree on the parameter universe, or a partition is not disjoint.
    #[error("partition mismatch: {0}")]
    PartitionMismatch(String),

    /// A submission was asked for optimizers before the model had parameters.
    #[error("submission '{submission}' cannot configure optimizers: model is not bound (no parameters)")]
    UnboundModel { submission: String },

    #[error("unknown {kind} '{name}' (available: {available})")]
    UnknownPlugin { kind: PluginKind, name: String, available: String },

    /// A data module was asked for a loader before its dataset or batch size was set.
    #[error("workload '{workload}' has misconfigured data: {field} is not set")]
    MisconfiguredData { workload: String, field: String },

    #[error("invalid runtime specs: {0}")]
    InvalidSpecs(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
