// External crates
use chrono::{Duration, NaiveDate};
use log::{debug, info};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

// Internal modules
use crate::constants::DATE_FORMAT;
use crate::error::{ForecastError, Result};

/// Identity of one run: upper-cased ticker and the calendar day it ran on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    ticker: String,
    day: NaiveDate,
}

impl CacheKey {
    pub fn new(ticker: &str, day: NaiveDate) -> Result<Self> {
        let ticker = ticker.trim().to_uppercase();
        if ticker.is_empty() {
            return Err(ForecastError::invalid_parameter("ticker", "ticker must not be empty"));
        }
        if ticker.contains(['/', '\\']) || ticker.contains("..") {
            return Err(ForecastError::invalid_parameter(
                "ticker",
                format!("'{}' is not a valid ticker symbol", ticker),
            ));
        }
        Ok(Self { ticker, day })
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn day(&self) -> NaiveDate {
        self.day
    }

    /// Same ticker, one calendar day earlier
    pub fn previous_day(&self) -> Self {
        Self {
            ticker: self.ticker.clone(),
            day: self.day - Duration::days(1),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ticker, self.day.format(DATE_FORMAT))
    }
}

/// Per-run artifact kinds stored in a cache directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheFile {
    RawPrices,
    Indicators,
    Scaler,
    Model,
    ModelMetadata,
}

impl CacheFile {
    fn file_name(&self, ticker: &str) -> String {
        match self {
            CacheFile::RawPrices => format!("{}_data.csv", ticker),
            CacheFile::Indicators => format!("{}_data_with_indicators.csv", ticker),
            CacheFile::Scaler => format!("{}_scaler.json", ticker),
            CacheFile::Model => format!("{}_model.bin", ticker),
            CacheFile::ModelMetadata => format!("{}_model.meta.json", ticker),
        }
    }
}

/// Filesystem layout `<data_dir>/<TICKER>/<YYYY-MM-DD>/` plus per-key write locks
#[derive(Debug)]
pub struct RunCache {
    data_dir: PathBuf,
    locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl RunCache {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn key_dir(&self, key: &CacheKey) -> PathBuf {
        self.data_dir
            .join(key.ticker())
            .join(key.day().format(DATE_FORMAT).to_string())
    }

    /// Create the directory for `key` if needed
    pub fn ensure_dir(&self, key: &CacheKey) -> Result<PathBuf> {
        let dir = self.key_dir(key);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn path(&self, key: &CacheKey, file: CacheFile) -> PathBuf {
        self.key_dir(key).join(file.file_name(key.ticker()))
    }

    /// Path of an artifact that must already exist
    pub fn existing_path(&self, key: &CacheKey, file: CacheFile) -> Result<PathBuf> {
        let path = self.path(key, file);
        if path.exists() {
            Ok(path)
        } else {
            Err(ForecastError::MissingArtifact(path))
        }
    }

    /// Handle to the write lock of `key`
    ///
    /// The caller holds the returned mutex for the whole write sequence.
    /// Locks nobody holds a handle to any more are dropped from the map.
    pub fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = lock_ignoring_poison(&self.locks);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of keys with a live lock handle
    pub fn tracked_locks(&self) -> usize {
        lock_ignoring_poison(&self.locks).len()
    }

    /// Delete the previous day's directory for the same ticker
    ///
    /// Returns whether anything was removed; a missing directory is not an error.
    pub fn purge_previous_day(&self, key: &CacheKey) -> Result<bool> {
        let previous = key.previous_day();
        let dir = self.key_dir(&previous);
        if !dir.exists() {
            debug!("No previous run directory at {}", dir.display());
            return Ok(false);
        }

        let lock = self.key_lock(&previous);
        let _guard = lock_ignoring_poison(&lock);
        fs::remove_dir_all(&dir)?;
        info!("Removed previous run directory {}", dir.display());
        Ok(true)
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    #[test]
    fn test_key_normalises_ticker() {
        let key = CacheKey::new(" aapl ", day("2024-03-05")).unwrap();
        assert_eq!(key.ticker(), "AAPL");
        assert_eq!(key.to_string(), "AAPL@2024-03-05");
        assert!(CacheKey::new("  ", day("2024-03-05")).is_err());
        assert!(CacheKey::new("../etc", day("2024-03-05")).is_err());
    }

    #[test]
    fn test_layout() {
        let cache = RunCache::new("/srv/data");
        let key = CacheKey::new("msft", day("2024-03-05")).unwrap();
        assert_eq!(
            cache.path(&key, CacheFile::Indicators),
            PathBuf::from("/srv/data/MSFT/2024-03-05/MSFT_data_with_indicators.csv")
        );
        assert_eq!(
            cache.path(&key, CacheFile::ModelMetadata),
            PathBuf::from("/srv/data/MSFT/2024-03-05/MSFT_model.meta.json")
        );
    }

    #[test]
    fn test_purge_previous_day() {
        let dir = tempdir().unwrap();
        let cache = RunCache::new(dir.path());
        let today = CacheKey::new("AAPL", day("2024-03-05")).unwrap();

        // nothing to remove yet
        assert!(!cache.purge_previous_day(&today).unwrap());

        let yesterday_dir = cache.ensure_dir(&today.previous_day()).unwrap();
        fs::write(yesterday_dir.join("AAPL_data.csv"), "date\n").unwrap();
        let today_dir = cache.ensure_dir(&today).unwrap();

        assert!(cache.purge_previous_day(&today).unwrap());
        assert!(!yesterday_dir.exists());
        assert!(today_dir.exists());
    }

    #[test]
    fn test_same_key_shares_lock() {
        let cache = RunCache::new("/tmp");
        let key = CacheKey::new("AAPL", day("2024-03-05")).unwrap();
        let a = cache.key_lock(&key);
        let b = cache.key_lock(&key);
        assert!(Arc::ptr_eq(&a, &b));
        let other = cache.key_lock(&key.previous_day());
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn test_released_locks_are_evicted() {
        let cache = RunCache::new("/tmp");
        let first = CacheKey::new("AAPL", day("2024-03-05")).unwrap();

        for offset in 1..=50 {
            let key = CacheKey::new("AAPL", day("2024-03-05") + Duration::days(offset)).unwrap();
            let lock = cache.key_lock(&key);
            let _guard = lock_ignoring_poison(&lock);
        }
        // only the entry created by the last call can still be in the map
        assert!(cache.tracked_locks() <= 1);

        let held = cache.key_lock(&first);
        let _ = cache.key_lock(&first.previous_day());
        // the held key survives a sweep, the released one is gone
        let again = cache.key_lock(&first);
        assert!(Arc::ptr_eq(&held, &again));
        assert_eq!(cache.tracked_locks(), 1);
    }
}
