use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::constants::DATE_COLUMN;
use crate::daily::step_6_train_model::TrainingHistory;
use crate::error::{ForecastError, Result};
use crate::util::file_utils::PredictionRecord;

/// Error body plus the HTTP-style status it maps to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: u16,
    pub error: String,
}

impl ApiError {
    pub fn new(status: u16, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(400, error)
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(404, error)
    }
}

impl From<ForecastError> for ApiError {
    fn from(err: ForecastError) -> Self {
        let status = match &err {
            ForecastError::InvalidParameter { .. }
            | ForecastError::UnsupportedHorizon { .. }
            | ForecastError::ShapeMismatch { .. }
            | ForecastError::InsufficientData(_) => 400,
            ForecastError::NoDataFound(_) | ForecastError::MissingArtifact(_) => 404,
            _ => 500,
        };
        Self::new(status, err.to_string())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status, self.error)
    }
}

impl std::error::Error for ApiError {}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchDataResponse {
    pub ticker: String,
    pub rows: usize,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareDataResponse {
    pub ticker: String,
    pub rows: usize,
    pub columns: usize,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainResponse {
    pub ticker: String,
    pub status: String,
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub stopped_early: bool,
    pub loss: Vec<f64>,
    pub val_loss: Vec<f64>,
}

impl TrainResponse {
    pub fn from_history(ticker: &str, history: TrainingHistory) -> Self {
        Self {
            ticker: ticker.to_string(),
            status: "success".to_string(),
            epochs_run: history.loss.len(),
            best_epoch: history.best_epoch,
            stopped_early: history.stopped_early,
            loss: history.loss,
            val_loss: history.val_loss,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub ticker: String,
    pub predictions: Vec<PredictionRecord>,
    pub prediction_file: String,
}

/// Outcome of one entry of a batch training request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchItemResult {
    Success {
        ticker: String,
        status: String,
        prediction_file: String,
    },
    TickerError {
        ticker: String,
        error: String,
    },
    FileError {
        file: String,
        error: String,
    },
}

impl BatchItemResult {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchItemResult::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DashboardResponse {
    Day {
        ticker: String,
        day: usize,
        prediction: PredictionRecord,
    },
    All {
        ticker: String,
        predictions: Vec<PredictionRecord>,
    },
}

/// One OHLCV bar of a candle response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adjusted_close: f64,
    pub volume: f64,
}

impl Candle {
    /// Rows of a standardized bar frame
    pub fn from_frame(bars: &DataFrame) -> Result<Vec<Candle>> {
        let dates = bars.column(DATE_COLUMN)?.str()?;
        let open = bars.column("open")?.f64()?;
        let high = bars.column("high")?.f64()?;
        let low = bars.column("low")?.f64()?;
        let close = bars.column("close")?.f64()?;
        let adjusted_close = bars.column("adjusted_close")?.f64()?;
        let volume = bars.column("volume")?.f64()?;

        Ok((0..bars.height())
            .map(|i| Candle {
                date: dates.get(i).unwrap_or_default().to_string(),
                open: open.get(i).unwrap_or(f64::NAN),
                high: high.get(i).unwrap_or(f64::NAN),
                low: low.get(i).unwrap_or(f64::NAN),
                close: close.get(i).unwrap_or(f64::NAN),
                adjusted_close: adjusted_close.get(i).unwrap_or(f64::NAN),
                volume: volume.get(i).unwrap_or(0.0),
            })
            .collect())
    }
}
