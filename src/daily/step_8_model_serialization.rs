use burn::module::Module;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use super::step_3_window_builder::OutputMode;
use super::step_4_recurrent_cell::CellKind;
use super::step_5_sequence_model::{SequenceModel, SequenceModelConfig};
use crate::build_info;
use crate::error::{ForecastError, Result};
use crate::util::run_cache::{lock_ignoring_poison, CacheFile, CacheKey, RunCache};

type ModelRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// Everything needed to rebuild a model and interpret its inputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    pub version: String,
    pub timestamp: u64,
    pub sequence_length: usize,
    pub feature_columns: Vec<String>,
    pub model: SequenceModelConfig,
    pub mode: OutputMode,
    pub learning_rate: f64,
    pub loss_history: Vec<f64>,
    pub val_loss_history: Vec<f64>,
}

impl ModelMetadata {
    pub fn new(
        sequence_length: usize,
        feature_columns: Vec<String>,
        model: SequenceModelConfig,
        mode: OutputMode,
        learning_rate: f64,
    ) -> Self {
        Self {
            version: build_info::PKG_VERSION.to_string(),
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            sequence_length,
            feature_columns,
            model,
            mode,
            learning_rate,
            loss_history: Vec::new(),
            val_loss_history: Vec::new(),
        }
    }

    pub fn cell(&self) -> CellKind {
        self.model.cell
    }

    pub fn num_features(&self) -> usize {
        self.feature_columns.len()
    }
}

/// Artifacts persisted per run key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Scaler,
    Model,
    Metadata,
}

impl From<ArtifactKind> for CacheFile {
    fn from(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::Scaler => CacheFile::Scaler,
            ArtifactKind::Model => CacheFile::Model,
            ArtifactKind::Metadata => CacheFile::ModelMetadata,
        }
    }
}

/// Load/save of serialized artifacts by run key
pub trait ArtifactStore {
    fn put(&self, key: &CacheKey, kind: ArtifactKind, bytes: &[u8]) -> Result<()>;

    /// Missing artifacts are `MissingArtifact`
    fn get(&self, key: &CacheKey, kind: ArtifactKind) -> Result<Vec<u8>>;

    fn contains(&self, key: &CacheKey, kind: ArtifactKind) -> bool;

    /// Removing an absent artifact is not an error
    fn remove(&self, key: &CacheKey, kind: ArtifactKind) -> Result<()>;

    /// Write a group of artifacts that only make sense together
    ///
    /// Either every artifact is stored or none of the group is left behind:
    /// artifacts written before a failing `put` are removed again.
    fn put_all(&self, key: &CacheKey, artifacts: &[(ArtifactKind, Vec<u8>)]) -> Result<()> {
        for (i, (kind, bytes)) in artifacts.iter().enumerate() {
            if let Err(err) = self.put(key, *kind, bytes) {
                for (written, _) in &artifacts[..i] {
                    if let Err(cleanup) = self.remove(key, *written) {
                        warn!("Could not remove {:?} for {}: {}", written, key, cleanup);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Stores artifacts as files inside the run cache directory
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    cache: Arc<RunCache>,
}

impl FileArtifactStore {
    pub fn new(cache: Arc<RunCache>) -> Self {
        Self { cache }
    }
}

impl ArtifactStore for FileArtifactStore {
    fn put(&self, key: &CacheKey, kind: ArtifactKind, bytes: &[u8]) -> Result<()> {
        self.cache.ensure_dir(key)?;
        fs::write(self.cache.path(key, kind.into()), bytes)?;
        Ok(())
    }

    fn get(&self, key: &CacheKey, kind: ArtifactKind) -> Result<Vec<u8>> {
        let path = self.cache.existing_path(key, kind.into())?;
        Ok(fs::read(path)?)
    }

    fn contains(&self, key: &CacheKey, kind: ArtifactKind) -> bool {
        self.cache.path(key, kind.into()).exists()
    }

    fn remove(&self, key: &CacheKey, kind: ArtifactKind) -> Result<()> {
        let path = self.cache.path(key, kind.into());
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Stages every artifact in a `.tmp` file and renames them into place only
    /// once all of them were written, so a failed write never replaces part of
    /// a previous run's group
    fn put_all(&self, key: &CacheKey, artifacts: &[(ArtifactKind, Vec<u8>)]) -> Result<()> {
        self.cache.ensure_dir(key)?;
        let staged: Vec<(PathBuf, PathBuf)> = artifacts
            .iter()
            .map(|(kind, _)| {
                let target = self.cache.path(key, (*kind).into());
                let mut tmp = target.clone().into_os_string();
                tmp.push(".tmp");
                (PathBuf::from(tmp), target)
            })
            .collect();

        for ((tmp, _), (_, bytes)) in staged.iter().zip(artifacts) {
            if let Err(err) = fs::write(tmp, bytes) {
                for (tmp, _) in &staged {
                    let _ = fs::remove_file(tmp);
                }
                return Err(err.into());
            }
        }
        for (tmp, target) in &staged {
            fs::rename(tmp, target)?;
        }
        Ok(())
    }
}

/// Keeps artifacts in memory; used in tests
#[derive(Default)]
pub struct InMemoryArtifactStore {
    artifacts: Mutex<HashMap<(CacheKey, ArtifactKind), Vec<u8>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock_ignoring_poison(&self.artifacts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put(&self, key: &CacheKey, kind: ArtifactKind, bytes: &[u8]) -> Result<()> {
        lock_ignoring_poison(&self.artifacts).insert((key.clone(), kind), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &CacheKey, kind: ArtifactKind) -> Result<Vec<u8>> {
        lock_ignoring_poison(&self.artifacts)
            .get(&(key.clone(), kind))
            .cloned()
            .ok_or_else(|| {
                ForecastError::MissingArtifact(
                    format!("{}/{:?}", key, kind).into(),
                )
            })
    }

    fn contains(&self, key: &CacheKey, kind: ArtifactKind) -> bool {
        lock_ignoring_poison(&self.artifacts).contains_key(&(key.clone(), kind))
    }

    fn remove(&self, key: &CacheKey, kind: ArtifactKind) -> Result<()> {
        lock_ignoring_poison(&self.artifacts).remove(&(key.clone(), kind));
        Ok(())
    }

    fn put_all(&self, key: &CacheKey, artifacts: &[(ArtifactKind, Vec<u8>)]) -> Result<()> {
        let mut stored = lock_ignoring_poison(&self.artifacts);
        for (kind, bytes) in artifacts {
            stored.insert((key.clone(), *kind), bytes.clone());
        }
        Ok(())
    }
}

/// Serialize model weights into a binary record
pub fn model_to_bytes<B: Backend>(model: &SequenceModel<B>) -> Result<Vec<u8>> {
    let record = model.clone().into_record();
    Ok(Recorder::<B>::record(&ModelRecorder::default(), record, ())?)
}

/// Rebuild a model from its configuration and a binary record
pub fn model_from_bytes<B: Backend>(
    config: &SequenceModelConfig,
    bytes: Vec<u8>,
    device: &B::Device,
) -> Result<SequenceModel<B>> {
    let record = Recorder::<B>::load(&ModelRecorder::default(), bytes, device)?;
    Ok(config.init::<B>(device).load_record(record))
}

/// Serialized model weights and metadata, ready for [`ArtifactStore::put_all`]
pub fn model_artifacts<B: Backend>(
    model: &SequenceModel<B>,
    metadata: &ModelMetadata,
) -> Result<Vec<(ArtifactKind, Vec<u8>)>> {
    Ok(vec![
        (ArtifactKind::Model, model_to_bytes(model)?),
        (ArtifactKind::Metadata, serde_json::to_vec_pretty(metadata)?),
    ])
}

/// Save the model weights and metadata under `key`
pub fn save_model_with_metadata<B: Backend, S: ArtifactStore + ?Sized>(
    store: &S,
    key: &CacheKey,
    model: &SequenceModel<B>,
    metadata: &ModelMetadata,
) -> Result<()> {
    store.put_all(key, &model_artifacts(model, metadata)?)
}

/// Load the model weights and metadata saved under `key`
pub fn load_model_with_metadata<B: Backend, S: ArtifactStore + ?Sized>(
    store: &S,
    key: &CacheKey,
    device: &B::Device,
) -> Result<(SequenceModel<B>, ModelMetadata)> {
    let metadata: ModelMetadata =
        serde_json::from_slice(&store.get(key, ArtifactKind::Metadata)?)?;
    let model = model_from_bytes::<B>(&metadata.model, store.get(key, ArtifactKind::Model)?, device)?;
    Ok((model, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Tensor;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use chrono::NaiveDate;
    use tempfile::tempdir;

    type TestBackend = NdArray<f32>;

    fn key() -> CacheKey {
        CacheKey::new("aapl", NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()).unwrap()
    }

    fn create_test_model(device: &NdArrayDevice) -> (SequenceModel<TestBackend>, ModelMetadata) {
        let config = SequenceModelConfig::new(4, 6, 3, 0.2, CellKind::Gru);
        let model = config.init::<TestBackend>(device);
        let metadata = ModelMetadata::new(
            5,
            vec!["open".into(), "high".into(), "close".into(), "volume".into()],
            config,
            OutputMode::MultiStep(3),
            0.001,
        );
        (model, metadata)
    }

    fn assert_same_predictions(a: &SequenceModel<TestBackend>, b: &SequenceModel<TestBackend>) {
        let device = NdArrayDevice::default();
        let x = Tensor::<TestBackend, 3>::ones([2, 5, 4], &device).mul_scalar(0.3);
        let pa = a.predict(x.clone()).into_data().convert::<f32>().to_vec::<f32>().unwrap();
        let pb = b.predict(x).into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert_eq!(pa, pb);
    }

    #[test]
    fn test_model_serialization_in_memory() {
        let device = NdArrayDevice::default();
        let (model, metadata) = create_test_model(&device);
        let store = InMemoryArtifactStore::new();

        save_model_with_metadata(&store, &key(), &model, &metadata).unwrap();
        assert_eq!(store.len(), 2);

        let (loaded, loaded_meta) =
            load_model_with_metadata::<TestBackend, _>(&store, &key(), &device).unwrap();
        assert_eq!(loaded_meta, metadata);
        assert_eq!(loaded_meta.version, env!("CARGO_PKG_VERSION"));
        assert_same_predictions(&model, &loaded);
    }

    #[test]
    fn test_model_serialization_on_disk() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(RunCache::new(dir.path()));
        let store = FileArtifactStore::new(cache.clone());
        let device = NdArrayDevice::default();
        let (model, metadata) = create_test_model(&device);

        save_model_with_metadata(&store, &key(), &model, &metadata).unwrap();
        assert!(cache.path(&key(), CacheFile::Model).exists());
        assert!(cache.path(&key(), CacheFile::ModelMetadata).exists());

        let (loaded, _) = load_model_with_metadata::<TestBackend, _>(&store, &key(), &device).unwrap();
        assert_same_predictions(&model, &loaded);
    }

    #[test]
    fn test_file_store_group_write_leaves_no_staging_files() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(RunCache::new(dir.path()));
        let store = FileArtifactStore::new(cache.clone());

        store.put(&key(), ArtifactKind::Scaler, b"old").unwrap();
        store
            .put_all(
                &key(),
                &[
                    (ArtifactKind::Scaler, b"new".to_vec()),
                    (ArtifactKind::Model, b"weights".to_vec()),
                ],
            )
            .unwrap();

        assert_eq!(store.get(&key(), ArtifactKind::Scaler).unwrap(), b"new".to_vec());
        assert_eq!(store.get(&key(), ArtifactKind::Model).unwrap(), b"weights".to_vec());
        let names: Vec<String> = fs::read_dir(cache.key_dir(&key()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{:?}", names);

        store.remove(&key(), ArtifactKind::Model).unwrap();
        assert!(!store.contains(&key(), ArtifactKind::Model));
        store.remove(&key(), ArtifactKind::Model).unwrap();
    }

    #[test]
    fn test_missing_model_is_reported() {
        let dir = tempdir().unwrap();
        let store = FileArtifactStore::new(Arc::new(RunCache::new(dir.path())));
        let result = load_model_with_metadata::<TestBackend, _>(&store, &key(), &NdArrayDevice::default());
        assert!(matches!(result, Err(ForecastError::MissingArtifact(_))));
    }
}
