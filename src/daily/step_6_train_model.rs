// External imports
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::cast::ToElement;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

// Internal imports
use super::step_1_indicator_engine::FeatureTable;
use super::step_2_scaler::MinMaxScaler;
use super::step_3_window_builder::{build_windows, OutputMode, WindowSet};
use super::step_4_recurrent_cell::CellKind;
use super::step_5_sequence_model::{SequenceModel, SequenceModelConfig};
use super::step_8_model_serialization::{
    model_artifacts, ArtifactKind, ArtifactStore, ModelMetadata,
};
use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_DROPOUT_RATE, DEFAULT_EPOCHS, DEFAULT_HIDDEN_SIZE,
    DEFAULT_LEARNING_RATE, DEFAULT_PREDICTION_HORIZON, DEFAULT_SEED, DEFAULT_SEQUENCE_LENGTH,
    DEFAULT_VALIDATION_SPLIT, EARLY_STOPPING_PATIENCE,
};
use crate::error::{ForecastError, Result};
use crate::util::run_cache::CacheKey;

/// Configuration for training the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub validation_split: f64,
    pub patience: usize,
    pub min_delta: f64,
    pub sequence_length: usize,
    pub hidden_size: usize,
    pub dropout: f64,
    pub cell: CellKind,
    pub mode: OutputMode,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: DEFAULT_LEARNING_RATE,
            batch_size: DEFAULT_BATCH_SIZE,
            epochs: DEFAULT_EPOCHS,
            validation_split: DEFAULT_VALIDATION_SPLIT,
            patience: EARLY_STOPPING_PATIENCE,
            min_delta: 0.0,
            sequence_length: DEFAULT_SEQUENCE_LENGTH,
            hidden_size: DEFAULT_HIDDEN_SIZE,
            dropout: DEFAULT_DROPOUT_RATE,
            cell: CellKind::Gru,
            mode: OutputMode::MultiStep(DEFAULT_PREDICTION_HORIZON),
        }
    }
}

impl TrainingConfig {
    fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(ForecastError::invalid_parameter("epochs", "must be positive"));
        }
        if self.batch_size == 0 {
            return Err(ForecastError::invalid_parameter("batch_size", "must be positive"));
        }
        if self.hidden_size == 0 {
            return Err(ForecastError::invalid_parameter("hidden_size", "must be positive"));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(ForecastError::invalid_parameter(
                "validation_split",
                "must be in [0, 1)",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ForecastError::invalid_parameter("dropout_rate", "must be in [0, 1)"));
        }
        if self.learning_rate <= 0.0 {
            return Err(ForecastError::invalid_parameter("learning_rate", "must be positive"));
        }
        Ok(())
    }
}

/// Seed shared by weight initialisation, dropout and batch shuffling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomnessContext {
    pub seed: u64,
}

impl Default for RandomnessContext {
    fn default() -> Self {
        Self { seed: DEFAULT_SEED }
    }
}

impl RandomnessContext {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// Seed the tensor backend's generator
    pub fn seed_backend<B: Backend>(&self) {
        B::seed(self.seed);
    }
}

/// Lifecycle of one training run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Idle,
    FittingScaler,
    BuildingWindows,
    Training,
    Saved,
    Failed,
}

/// Per-epoch losses of a finished run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub loss: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub best_epoch: usize,
    pub stopped_early: bool,
}

/// Result of a successful run, already persisted
#[derive(Debug)]
pub struct TrainingOutcome<B: Backend> {
    pub model: SequenceModel<B>,
    pub scaler: MinMaxScaler,
    pub metadata: ModelMetadata,
    pub history: TrainingHistory,
}

/// Fits scaler and model for one run key
pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    randomness: RandomnessContext,
    device: B::Device,
    state: TrainerState,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, randomness: RandomnessContext, device: B::Device) -> Self {
        Self {
            config,
            randomness,
            device,
            state: TrainerState::Idle,
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Run the whole pipeline and persist the artifacts under `key`
    ///
    /// Nothing is written to `store` unless every step succeeds.
    pub fn fit<S: ArtifactStore + ?Sized>(
        &mut self,
        table: &FeatureTable,
        store: &S,
        key: &CacheKey,
    ) -> Result<TrainingOutcome<B::InnerBackend>> {
        match self.run(table, store, key) {
            Ok(outcome) => {
                self.state = TrainerState::Saved;
                Ok(outcome)
            }
            Err(err) => {
                warn!("Training failed for {}: {}", key, err);
                self.state = TrainerState::Failed;
                Err(err)
            }
        }
    }

    fn run<S: ArtifactStore + ?Sized>(
        &mut self,
        table: &FeatureTable,
        store: &S,
        key: &CacheKey,
    ) -> Result<TrainingOutcome<B::InnerBackend>> {
        self.config.validate()?;

        self.state = TrainerState::FittingScaler;
        let scaler = MinMaxScaler::fit(table)?;
        let scaled = scaler.transform(table)?;

        self.state = TrainerState::BuildingWindows;
        let windows = build_windows(&scaled, self.config.sequence_length, self.config.mode)?;
        let (train, valid) = windows.split(self.config.validation_split);
        if train.is_empty() {
            return Err(ForecastError::InsufficientData(format!(
                "{} windows leave no training samples at validation split {}",
                windows.len(),
                self.config.validation_split
            )));
        }
        info!(
            "Windows for {}: {} total, {} train, {} validation",
            key,
            windows.len(),
            train.len(),
            valid.len()
        );

        self.state = TrainerState::Training;
        let model_config = SequenceModelConfig::new(
            table.num_features(),
            self.config.hidden_size,
            self.config.mode.output_size(),
            self.config.dropout,
            self.config.cell,
        );
        let (model, history) = self.train_model(&model_config, &train, &valid)?;

        let mut metadata = ModelMetadata::new(
            self.config.sequence_length,
            table.columns().to_vec(),
            model_config,
            self.config.mode,
            self.config.learning_rate,
        );
        metadata.loss_history = history.loss.clone();
        metadata.val_loss_history = history.val_loss.clone();

        // serialize everything before the first write
        let mut artifacts = vec![(ArtifactKind::Scaler, scaler.to_json()?)];
        artifacts.extend(model_artifacts(&model, &metadata)?);
        store.put_all(key, &artifacts)?;
        info!("Saved scaler and model for {}", key);

        Ok(TrainingOutcome {
            model,
            scaler,
            metadata,
            history,
        })
    }

    /// Adam + MSE with early stopping, restoring the best weights
    ///
    /// Early stopping watches validation loss, or training loss when there
    /// is no validation segment.
    fn train_model(
        &self,
        model_config: &SequenceModelConfig,
        train: &WindowSet,
        valid: &WindowSet,
    ) -> Result<(SequenceModel<B::InnerBackend>, TrainingHistory)> {
        let config = &self.config;
        self.randomness.seed_backend::<B>();
        let mut rng = self.randomness.rng();

        let mut model: SequenceModel<B> = model_config.init(&self.device);
        let mut optimizer = AdamConfig::new().init();

        let mut best_model = model.clone();
        let mut best_loss = f64::INFINITY;
        let mut epochs_no_improve = 0;
        let mut history = TrainingHistory::default();

        let mut order: Vec<usize> = (0..train.len()).collect();
        for epoch in 1..=config.epochs {
            order.shuffle(&mut rng);

            let mut epoch_loss = 0.0;
            let mut num_batches = 0;
            for batch in order.chunks(config.batch_size) {
                let (features, targets) = train.batch::<B>(batch, &self.device);
                let predictions = model.forward(features, true);
                let diff = predictions - targets;
                let loss_tensor = (diff.clone() * diff).mean();
                epoch_loss += loss_tensor.clone().into_scalar().to_f64();
                num_batches += 1;

                let grads = loss_tensor.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optimizer.step(config.learning_rate, model, grads);
            }
            let train_loss = epoch_loss / num_batches as f64;
            if !train_loss.is_finite() {
                return Err(ForecastError::Model(format!(
                    "training loss diverged at epoch {}",
                    epoch
                )));
            }
            history.loss.push(train_loss);

            let monitored = if valid.is_empty() {
                train_loss
            } else {
                let val_loss =
                    evaluate_model(&model.valid(), valid, config.batch_size, &self.device);
                history.val_loss.push(val_loss);
                val_loss
            };

            debug!(
                "Epoch {}/{}: loss = {:.6}, monitored = {:.6}",
                epoch, config.epochs, train_loss, monitored
            );

            if best_loss - monitored > config.min_delta {
                best_loss = monitored;
                best_model = model.clone();
                history.best_epoch = epoch;
                epochs_no_improve = 0;
            } else {
                epochs_no_improve += 1;
                if epochs_no_improve >= config.patience {
                    info!(
                        "Early stopping at epoch {} (best loss {:.6} at epoch {})",
                        epoch, best_loss, history.best_epoch
                    );
                    history.stopped_early = true;
                    break;
                }
            }
        }

        Ok((best_model.valid(), history))
    }
}

/// Mean squared error over every window in `windows`, dropout disabled
pub fn evaluate_model<B: Backend>(
    model: &SequenceModel<B>,
    windows: &WindowSet,
    batch_size: usize,
    device: &B::Device,
) -> f64 {
    let indices: Vec<usize> = (0..windows.len()).collect();
    let mut total = 0.0;
    for batch in indices.chunks(batch_size.max(1)) {
        let (features, targets) = windows.batch::<B>(batch, device);
        let diff = model.predict(features) - targets;
        let batch_mse = (diff.clone() * diff).mean().into_scalar().to_f64();
        total += batch_mse * batch.len() as f64;
    }
    if windows.is_empty() {
        0.0
    } else {
        total / windows.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daily::step_1_indicator_engine::compute_feature_table;
    use crate::daily::step_8_model_serialization::InMemoryArtifactStore;
    use crate::util::test_utils::linear_price_frame;
    use burn_autodiff::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use chrono::NaiveDate;

    type TrainBackend = Autodiff<NdArray<f32>>;

    fn key() -> CacheKey {
        CacheKey::new("TEST", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()).unwrap()
    }

    fn small_config() -> TrainingConfig {
        TrainingConfig {
            epochs: 2,
            batch_size: 16,
            sequence_length: 10,
            hidden_size: 8,
            mode: OutputMode::MultiStep(3),
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_fit_persists_and_reaches_saved() {
        let table = compute_feature_table(&linear_price_frame(100)).unwrap();
        let store = InMemoryArtifactStore::new();
        let mut trainer =
            Trainer::<TrainBackend>::new(small_config(), RandomnessContext::default(), NdArrayDevice::default());
        assert_eq!(trainer.state(), TrainerState::Idle);

        let outcome = trainer.fit(&table, &store, &key()).unwrap();

        assert_eq!(trainer.state(), TrainerState::Saved);
        assert_eq!(outcome.history.loss.len(), 2);
        assert_eq!(outcome.history.val_loss.len(), 2);
        assert!(store.contains(&key(), ArtifactKind::Scaler));
        assert!(store.contains(&key(), ArtifactKind::Model));
        assert!(store.contains(&key(), ArtifactKind::Metadata));
        assert_eq!(outcome.metadata.feature_columns, table.columns().to_vec());
    }

    #[test]
    fn test_failure_persists_nothing() {
        let table = compute_feature_table(&linear_price_frame(60)).unwrap();
        let store = InMemoryArtifactStore::new();
        let config = TrainingConfig {
            sequence_length: 20,
            ..small_config()
        };
        let mut trainer =
            Trainer::<TrainBackend>::new(config, RandomnessContext::default(), NdArrayDevice::default());

        let result = trainer.fit(&table, &store, &key());

        assert!(matches!(result, Err(ForecastError::InsufficientData(_))));
        assert_eq!(trainer.state(), TrainerState::Failed);
        assert!(store.is_empty());
    }

    /// Rejects model weights, accepts everything else
    struct RejectingModelStore {
        inner: InMemoryArtifactStore,
    }

    impl ArtifactStore for RejectingModelStore {
        fn put(&self, key: &CacheKey, kind: ArtifactKind, bytes: &[u8]) -> Result<()> {
            if kind == ArtifactKind::Model {
                return Err(ForecastError::Io(std::io::Error::other("disk full")));
            }
            self.inner.put(key, kind, bytes)
        }

        fn get(&self, key: &CacheKey, kind: ArtifactKind) -> Result<Vec<u8>> {
            self.inner.get(key, kind)
        }

        fn contains(&self, key: &CacheKey, kind: ArtifactKind) -> bool {
            self.inner.contains(key, kind)
        }

        fn remove(&self, key: &CacheKey, kind: ArtifactKind) -> Result<()> {
            self.inner.remove(key, kind)
        }
    }

    #[test]
    fn test_failed_model_write_leaves_no_scaler_behind() {
        let table = compute_feature_table(&linear_price_frame(100)).unwrap();
        let store = RejectingModelStore {
            inner: InMemoryArtifactStore::new(),
        };
        let mut trainer =
            Trainer::<TrainBackend>::new(small_config(), RandomnessContext::default(), NdArrayDevice::default());

        let result = trainer.fit(&table, &store, &key());

        assert!(matches!(result, Err(ForecastError::Io(_))));
        assert_eq!(trainer.state(), TrainerState::Failed);
        assert!(store.inner.is_empty());
    }

    #[test]
    fn test_empty_validation_monitors_training_loss() {
        let table = compute_feature_table(&linear_price_frame(90)).unwrap();
        let store = InMemoryArtifactStore::new();
        let config = TrainingConfig {
            validation_split: 0.0,
            ..small_config()
        };
        let mut trainer =
            Trainer::<TrainBackend>::new(config, RandomnessContext::default(), NdArrayDevice::default());

        let outcome = trainer.fit(&table, &store, &key()).unwrap();
        assert!(outcome.history.val_loss.is_empty());
        assert_eq!(outcome.history.loss.len(), 2);
        assert!(outcome.history.best_epoch >= 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let table = compute_feature_table(&linear_price_frame(90)).unwrap();
        let store = InMemoryArtifactStore::new();
        let config = TrainingConfig {
            validation_split: 1.0,
            ..small_config()
        };
        let mut trainer =
            Trainer::<TrainBackend>::new(config, RandomnessContext::default(), NdArrayDevice::default());
        assert!(matches!(
            trainer.fit(&table, &store, &key()),
            Err(ForecastError::InvalidParameter { .. })
        ));
    }
}
