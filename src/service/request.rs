use log::warn;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_DAYS_BACK, DEFAULT_DROPOUT_RATE, DEFAULT_EPOCHS,
    DEFAULT_HIDDEN_SIZE, DEFAULT_LEARNING_RATE, DEFAULT_PREDICTION_HORIZON, DEFAULT_PREDICT_DAYS,
    DEFAULT_SEQUENCE_LENGTH, DEFAULT_VALIDATION_SPLIT, EARLY_STOPPING_PATIENCE,
};
use crate::daily::step_3_window_builder::OutputMode;
use crate::daily::step_4_recurrent_cell::CellKind;
use crate::daily::step_6_train_model::TrainingConfig;
use crate::error::{ForecastError, Result};

/// Training parameters as they arrive on the wire
///
/// Every field is optional. Missing, zero or negative numbers fall back to
/// the default with a warning instead of failing the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
    #[serde(default, alias = "daysBack")]
    pub days_back: Option<f64>,
    #[serde(default)]
    pub epochs: Option<f64>,
    #[serde(default, alias = "batchSize")]
    pub batch_size: Option<f64>,
    #[serde(default, alias = "seqLen")]
    pub seq_len: Option<f64>,
    #[serde(default, alias = "validationSplit")]
    pub validation_split: Option<f64>,
    #[serde(default, alias = "learningRate")]
    pub learning_rate: Option<f64>,
    #[serde(default, alias = "dropoutRate")]
    pub dropout_rate: Option<f64>,
    #[serde(default, alias = "predictionHorizon")]
    pub prediction_horizon: Option<f64>,
    #[serde(default, alias = "hiddenSize")]
    pub hidden_size: Option<f64>,
    #[serde(default)]
    pub patience: Option<f64>,
    #[serde(default)]
    pub cell: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

/// Parameters after the tolerant defaulting policy has been applied
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTrainParams {
    pub days_back: usize,
    pub prediction_horizon: usize,
    pub training: TrainingConfig,
}

impl TrainParams {
    pub fn resolve(&self) -> Result<ResolvedTrainParams> {
        let prediction_horizon = count_or_default(
            "prediction_horizon",
            self.prediction_horizon,
            DEFAULT_PREDICTION_HORIZON,
        );

        let cell = match &self.cell {
            Some(cell) => cell.parse::<CellKind>()?,
            None => CellKind::default(),
        };

        let mode = match self.mode.as_deref().map(|m| m.trim().to_lowercase()) {
            None => OutputMode::MultiStep(prediction_horizon),
            Some(m) if m == "multi_step" || m == "multi" => OutputMode::MultiStep(prediction_horizon),
            Some(m) if m == "single_step" || m == "single" => OutputMode::SingleStep,
            Some(other) => {
                return Err(ForecastError::invalid_parameter(
                    "mode",
                    format!("unknown mode '{}', expected 'single_step' or 'multi_step'", other),
                ))
            }
        };

        let mut validation_split = positive_or_default(
            "validation_split",
            self.validation_split,
            DEFAULT_VALIDATION_SPLIT,
        );
        if validation_split >= 1.0 {
            warn!(
                "validation_split {} is not below 1, using default {}",
                validation_split, DEFAULT_VALIDATION_SPLIT
            );
            validation_split = DEFAULT_VALIDATION_SPLIT;
        }

        let mut dropout = positive_or_default("dropout_rate", self.dropout_rate, DEFAULT_DROPOUT_RATE);
        if dropout >= 1.0 {
            warn!("dropout_rate {} is not below 1, using default {}", dropout, DEFAULT_DROPOUT_RATE);
            dropout = DEFAULT_DROPOUT_RATE;
        }

        let training = TrainingConfig {
            learning_rate: positive_or_default("learning_rate", self.learning_rate, DEFAULT_LEARNING_RATE),
            batch_size: count_or_default("batch_size", self.batch_size, DEFAULT_BATCH_SIZE),
            epochs: count_or_default("epochs", self.epochs, DEFAULT_EPOCHS),
            validation_split,
            patience: count_or_default("patience", self.patience, EARLY_STOPPING_PATIENCE),
            sequence_length: count_or_default("seq_len", self.seq_len, DEFAULT_SEQUENCE_LENGTH),
            hidden_size: count_or_default("hidden_size", self.hidden_size, DEFAULT_HIDDEN_SIZE),
            dropout,
            cell,
            mode,
            ..TrainingConfig::default()
        };

        Ok(ResolvedTrainParams {
            days_back: count_or_default("days_back", self.days_back, DEFAULT_DAYS_BACK),
            prediction_horizon,
            training,
        })
    }
}

/// `value` when it is a positive finite number, otherwise `default`
pub fn positive_or_default(name: &str, value: Option<f64>, default: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => v,
        Some(v) => {
            warn!("Parameter {} = {} is not positive, using default {}", name, v, default);
            default
        }
        None => default,
    }
}

/// Integer flavour of [`positive_or_default`]; fractions are truncated
pub fn count_or_default(name: &str, value: Option<f64>, default: usize) -> usize {
    match value {
        Some(v) if v.is_finite() && v >= 1.0 => v as usize,
        Some(v) => {
            warn!("Parameter {} = {} is not positive, using default {}", name, v, default);
            default
        }
        None => default,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchDataRequest {
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default, alias = "daysBack")]
    pub days_back: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareDataRequest {
    #[serde(default)]
    pub ticker: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainRequest {
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(flatten)]
    pub params: TrainParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictRequest {
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default, alias = "predictDays")]
    pub predict_days: Option<f64>,
    /// Must match the trained window length when given
    #[serde(default, alias = "seqLen")]
    pub seq_len: Option<f64>,
}

impl PredictRequest {
    /// Unlike training parameters, `predict_days = 0` is rejected
    pub fn resolved_predict_days(&self) -> Result<usize> {
        match self.predict_days {
            None => Ok(DEFAULT_PREDICT_DAYS),
            Some(v) if v.is_finite() && v >= 1.0 => Ok(v as usize),
            Some(v) => Err(ForecastError::invalid_parameter(
                "predict_days",
                format!("{} is not a positive number of days", v),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainMultipleRequest {
    #[serde(default, alias = "fileList")]
    pub file_list: Vec<String>,
    #[serde(flatten)]
    pub params: TrainParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardRequest {
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub day: Option<i64>,
}

/// Historical bars for a symbol; `from` and `to` are unix seconds, `to` exclusive
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandleRequest {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_and_snake_case_are_accepted() {
        let camel: TrainMultipleRequest = serde_json::from_str(
            r#"{"fileList": ["a.txt"], "batchSize": 16, "seqLen": 20, "predictionHorizon": 5}"#,
        )
        .unwrap();
        let snake: TrainMultipleRequest = serde_json::from_str(
            r#"{"file_list": ["a.txt"], "batch_size": 16, "seq_len": 20, "prediction_horizon": 5}"#,
        )
        .unwrap();

        assert_eq!(camel.file_list, snake.file_list);
        assert_eq!(camel.params, snake.params);
        let resolved = camel.params.resolve().unwrap();
        assert_eq!(resolved.training.batch_size, 16);
        assert_eq!(resolved.training.sequence_length, 20);
        assert_eq!(resolved.training.mode, OutputMode::MultiStep(5));
    }

    #[test]
    fn test_non_positive_values_fall_back() {
        let params = TrainParams {
            epochs: Some(0.0),
            batch_size: Some(-4.0),
            learning_rate: Some(0.0),
            validation_split: Some(1.5),
            ..TrainParams::default()
        };
        let resolved = params.resolve().unwrap();

        assert_eq!(resolved.training.epochs, DEFAULT_EPOCHS);
        assert_eq!(resolved.training.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(resolved.training.learning_rate, DEFAULT_LEARNING_RATE);
        assert_eq!(resolved.training.validation_split, DEFAULT_VALIDATION_SPLIT);
        assert_eq!(resolved.days_back, DEFAULT_DAYS_BACK);
    }

    #[test]
    fn test_cell_and_mode_selection() {
        let params = TrainParams {
            cell: Some("LSTM".into()),
            mode: Some("single_step".into()),
            ..TrainParams::default()
        };
        let resolved = params.resolve().unwrap();
        assert_eq!(resolved.training.cell, CellKind::Lstm);
        assert_eq!(resolved.training.mode, OutputMode::SingleStep);

        let bad = TrainParams {
            mode: Some("sideways".into()),
            ..TrainParams::default()
        };
        assert!(bad.resolve().is_err());
    }

    #[test]
    fn test_predict_days() {
        let request = PredictRequest::default();
        assert_eq!(request.resolved_predict_days().unwrap(), DEFAULT_PREDICT_DAYS);

        let zero = PredictRequest {
            predict_days: Some(0.0),
            ..PredictRequest::default()
        };
        assert!(matches!(
            zero.resolved_predict_days(),
            Err(ForecastError::InvalidParameter { .. })
        ));
    }
}
