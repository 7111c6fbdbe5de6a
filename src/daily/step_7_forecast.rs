// External imports
use burn::tensor::{backend::Backend, Tensor, TensorData};
use log::debug;
use ndarray::{concatenate, s, Array2, Axis};

// Internal imports
use super::step_1_indicator_engine::FeatureTable;
use super::step_2_scaler::MinMaxScaler;
use super::step_3_window_builder::OutputMode;
use super::step_5_sequence_model::SequenceModel;
use super::step_8_model_serialization::{
    load_model_with_metadata, ArtifactKind, ArtifactStore, ModelMetadata,
};
use crate::error::{ForecastError, Result};
use crate::util::run_cache::CacheKey;

/// A trained model bundled with the scaler and metadata it was saved with
pub struct Forecaster<B: Backend> {
    model: SequenceModel<B>,
    scaler: MinMaxScaler,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> Forecaster<B> {
    pub fn new(
        model: SequenceModel<B>,
        scaler: MinMaxScaler,
        metadata: ModelMetadata,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            scaler,
            metadata,
            device,
        }
    }

    /// Load model, metadata and scaler persisted under `key`
    pub fn load<S: ArtifactStore + ?Sized>(store: &S, key: &CacheKey, device: B::Device) -> Result<Self> {
        let (model, metadata) = load_model_with_metadata::<B, S>(store, key, &device)?;
        let scaler = MinMaxScaler::from_json(&store.get(key, ArtifactKind::Scaler)?)?;
        Ok(Self::new(model, scaler, metadata, device))
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn sequence_length(&self) -> usize {
        self.metadata.sequence_length
    }

    /// Forecast `predict_days` closing prices after the last row of `table`
    ///
    /// `table` is the unscaled feature table; only its last `L` rows are used.
    /// Single-step models feed each prediction back as the next row's close,
    /// copying every other feature forward from the last known row.
    ///
    /// # Returns
    ///
    /// Predicted prices, earliest first
    pub fn forecast(&self, table: &FeatureTable, predict_days: usize) -> Result<Vec<f64>> {
        if predict_days == 0 {
            return Err(ForecastError::invalid_parameter(
                "predict_days",
                "must be at least 1",
            ));
        }
        if table.num_features() != self.metadata.num_features() {
            return Err(ForecastError::ShapeMismatch {
                expected: self.metadata.num_features(),
                actual: table.num_features(),
            });
        }

        let sequence_length = self.sequence_length();
        if table.len() < sequence_length {
            return Err(ForecastError::InsufficientData(format!(
                "{} rows available, the model needs the last {}",
                table.len(),
                sequence_length
            )));
        }

        let scaled = self.scaler.transform(table)?;
        let window = scaled.tail(sequence_length).to_owned();

        let scaled_predictions = match self.metadata.mode {
            OutputMode::MultiStep(horizon) => {
                if predict_days > horizon {
                    return Err(ForecastError::UnsupportedHorizon {
                        requested: predict_days,
                        horizon,
                    });
                }
                let mut outputs = self.predict_window(&window)?;
                outputs.truncate(predict_days);
                outputs
            }
            OutputMode::SingleStep => {
                self.recursive_forecast(window, scaled.close_index(), predict_days)?
            }
        };

        debug!("Scaled predictions: {:?}", scaled_predictions);
        Ok(self.scaler.inverse_transform_close(&scaled_predictions))
    }

    fn recursive_forecast(
        &self,
        mut window: Array2<f64>,
        close_index: usize,
        predict_days: usize,
    ) -> Result<Vec<f64>> {
        let mut predictions = Vec::with_capacity(predict_days);
        for _ in 0..predict_days {
            let next_close = self
                .predict_window(&window)?
                .first()
                .copied()
                .ok_or_else(|| ForecastError::Model("model produced no output".to_string()))?;
            predictions.push(next_close);

            let last = window.nrows() - 1;
            let mut next_row = window.slice(s![last..last + 1, ..]).to_owned();
            next_row[[0, close_index]] = next_close;
            window = concatenate(Axis(0), &[window.slice(s![1.., ..]), next_row.view()])
                .map_err(|e| ForecastError::Model(e.to_string()))?;
        }
        Ok(predictions)
    }

    /// One forward pass over a single [L, F] window
    fn predict_window(&self, window: &Array2<f64>) -> Result<Vec<f64>> {
        let (rows, features) = window.dim();
        let values: Vec<f32> = window.iter().map(|v| *v as f32).collect();
        let input = Tensor::<B, 3>::from_data(TensorData::new(values, [1, rows, features]), &self.device);

        let output = self.model.predict(input);
        let values = output
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| ForecastError::Model(format!("{:?}", e)))?;
        Ok(values.into_iter().map(f64::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daily::step_1_indicator_engine::compute_feature_table;
    use crate::daily::step_4_recurrent_cell::CellKind;
    use crate::daily::step_5_sequence_model::SequenceModelConfig;
    use crate::util::test_utils::linear_price_frame;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn forecaster(table: &FeatureTable, sequence_length: usize, mode: OutputMode) -> Forecaster<TestBackend> {
        let device = NdArrayDevice::default();
        let config = SequenceModelConfig::new(
            table.num_features(),
            8,
            mode.output_size(),
            0.2,
            CellKind::Gru,
        );
        let model = config.init::<TestBackend>(&device);
        let scaler = MinMaxScaler::fit(table).unwrap();
        let metadata = ModelMetadata::new(sequence_length, table.columns().to_vec(), config, mode, 0.001);
        Forecaster::new(model, scaler, metadata, device)
    }

    #[test]
    fn test_single_step_is_deterministic() {
        let table = compute_feature_table(&linear_price_frame(90)).unwrap();
        let forecaster = forecaster(&table, 10, OutputMode::SingleStep);

        let first = forecaster.forecast(&table, 5).unwrap();
        let second = forecaster.forecast(&table, 5).unwrap();

        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
        assert!(first.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_multi_step_horizon() {
        let table = compute_feature_table(&linear_price_frame(90)).unwrap();
        let forecaster = forecaster(&table, 10, OutputMode::MultiStep(4));

        assert_eq!(forecaster.forecast(&table, 4).unwrap().len(), 4);
        assert_eq!(forecaster.forecast(&table, 2).unwrap().len(), 2);
        assert!(matches!(
            forecaster.forecast(&table, 5),
            Err(ForecastError::UnsupportedHorizon { requested: 5, horizon: 4 })
        ));
        assert!(matches!(
            forecaster.forecast(&table, 0),
            Err(ForecastError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_multi_step_prefix_matches_full_pass() {
        let table = compute_feature_table(&linear_price_frame(90)).unwrap();
        let forecaster = forecaster(&table, 10, OutputMode::MultiStep(4));
        let full = forecaster.forecast(&table, 4).unwrap();
        let prefix = forecaster.forecast(&table, 2).unwrap();
        assert_eq!(&full[..2], prefix.as_slice());
    }

    #[test]
    fn test_feature_count_mismatch() {
        let table = compute_feature_table(&linear_price_frame(90)).unwrap();
        let forecaster = forecaster(&table, 10, OutputMode::SingleStep);

        let narrow_values = table.values().slice(s![.., 0..5]).to_owned();
        let narrow = FeatureTable::new(
            table.dates().to_vec(),
            table.columns()[0..5].to_vec(),
            narrow_values,
        )
        .unwrap();

        assert!(matches!(
            forecaster.forecast(&narrow, 1),
            Err(ForecastError::ShapeMismatch { expected: 23, actual: 5 })
        ));
    }

    #[test]
    fn test_too_few_rows() {
        let table = compute_feature_table(&linear_price_frame(90)).unwrap();
        let forecaster = forecaster(&table, 60, OutputMode::SingleStep);
        assert!(matches!(
            forecaster.forecast(&table, 1),
            Err(ForecastError::InsufficientData(_))
        ));
    }
}
