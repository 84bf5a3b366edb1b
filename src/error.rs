//! Error types for the det-eval library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for det-eval operations.
pub type Result<T> = std::result::Result<T, EvalError>;

/// Error types that can occur while evaluating detections.
#[derive(Error, Debug)]
pub enum EvalError {
    /// Error during JSON parsing or serialization.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error during I/O operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error while parsing a TOML configuration file.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Error raised by the per-class results table.
    #[error("Table error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    /// Invalid bounding box coordinates.
    #[error("Invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    /// Invalid ground-truth label row.
    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    /// Invalid IoU or confidence threshold.
    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    /// Invalid run configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Mask prototypes and ground-truth masks must be both present or both absent.
    #[error("Mask mismatch: {0}")]
    MaskMismatch(String),

    /// Two arrays that must line up do not.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The inference collaborator failed.
    #[error("Inference failed: {0}")]
    Inference(String),

    /// The dataset collaborator failed.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Malformed line in a label or prediction file.
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
}
