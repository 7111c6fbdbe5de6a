use std::path::PathBuf;

use thiserror::Error;

/// Errors raised anywhere in the forecasting pipeline
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("No data found: {0}")]
    NoDataFound(String),

    #[error("Artifact not found: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Feature count mismatch: model expects {expected} features, input has {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Requested {requested} prediction days but the model horizon is {horizon}")]
    UnsupportedHorizon { requested: usize, horizon: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model record error: {0}")]
    Recorder(String),

    #[error("Model error: {0}")]
    Model(String),
}

impl From<burn::record::RecorderError> for ForecastError {
    fn from(err: burn::record::RecorderError) -> Self {
        Self::Recorder(format!("{:?}", err))
    }
}

impl ForecastError {
    pub fn invalid_parameter(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ForecastError>;
