//! Request/response operations over the forecasting pipeline
//!
//! Every operation returns a serializable response or an [`ApiError`]
//! carrying an HTTP-style status. Pipeline errors never escape as panics.

pub mod request;
pub mod response;

// External imports
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, Weekday};
use log::{error, info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

// Internal imports
use crate::config::ServiceConfig;
use crate::constants::DATE_FORMAT;
use crate::daily::step_1_indicator_engine::add_technical_indicators;
use crate::daily::step_6_train_model::{RandomnessContext, Trainer, TrainingHistory};
use crate::daily::step_7_forecast::Forecaster;
use crate::daily::step_8_model_serialization::{ArtifactStore, FileArtifactStore};
use crate::error::{ForecastError, Result};
use crate::util::file_utils::{
    read_feature_table, read_predictions, read_price_series, write_csv_file, write_predictions,
    PredictionRecord,
};
use crate::util::market_data::{Interval, MarketDataProvider};
use crate::util::run_cache::{lock_ignoring_poison, CacheFile, CacheKey, RunCache};

use request::{
    count_or_default, CandleRequest, DashboardRequest, FetchDataRequest, PredictRequest, PrepareDataRequest,
    ResolvedTrainParams, TrainMultipleRequest, TrainParams, TrainRequest,
};
use response::{
    ApiError, ApiResult, BatchItemResult, Candle, DashboardResponse, FetchDataResponse, PredictResponse,
    PrepareDataResponse, TrainResponse,
};

pub type TrainBackend = Autodiff<NdArray<f32>>;
pub type InferenceBackend = NdArray<f32>;

/// The forecasting service: market data in, persisted predictions out
pub struct ForecastService<P: MarketDataProvider, S: ArtifactStore = FileArtifactStore> {
    config: ServiceConfig,
    provider: P,
    cache: Arc<RunCache>,
    store: S,
    run_day: Option<NaiveDate>,
}

impl<P: MarketDataProvider> ForecastService<P, FileArtifactStore> {
    /// Service persisting every artifact into the run cache directory
    pub fn new(config: ServiceConfig, provider: P) -> Self {
        let cache = Arc::new(RunCache::new(config.data_dir.clone()));
        let store = FileArtifactStore::new(cache.clone());
        Self {
            config,
            provider,
            cache,
            store,
            run_day: None,
        }
    }
}

impl<P: MarketDataProvider, S: ArtifactStore> ForecastService<P, S> {
    /// Service with a caller-provided artifact store
    pub fn with_store(config: ServiceConfig, provider: P, store: S) -> Self {
        let cache = Arc::new(RunCache::new(config.data_dir.clone()));
        Self {
            config,
            provider,
            cache,
            store,
            run_day: None,
        }
    }

    /// Pin the run day instead of reading the local clock
    pub fn with_run_day(mut self, day: NaiveDate) -> Self {
        self.run_day = Some(day);
        self
    }

    pub fn run_day(&self) -> NaiveDate {
        self.run_day.unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn cache(&self) -> &RunCache {
        &self.cache
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn key(&self, ticker: &str) -> Result<CacheKey> {
        CacheKey::new(ticker, self.run_day())
    }

    fn with_key_lock<T>(&self, key: &CacheKey, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.cache.key_lock(key);
        let _guard = lock_ignoring_poison(&lock);
        f()
    }

    /// Path of the persisted prediction table for `ticker`
    pub fn prediction_file(&self, ticker: &str) -> PathBuf {
        let ticker = ticker.to_uppercase();
        self.config
            .predictions_dir
            .join(&ticker)
            .join(format!("{}_predictions.csv", ticker))
    }

    pub fn fetch_data(&self, request: &FetchDataRequest) -> ApiResult<FetchDataResponse> {
        let ticker = require_ticker(request.ticker.as_deref())?;
        let days_back = count_or_default(
            "days_back",
            request.days_back,
            crate::constants::DEFAULT_DAYS_BACK,
        );
        let key = self.key(&ticker)?;
        let (rows, file) = self.with_key_lock(&key, || self.fetch_prices(&key, days_back))?;
        Ok(FetchDataResponse {
            ticker: key.ticker().to_string(),
            rows,
            file: file.display().to_string(),
        })
    }

    pub fn prepare_data(&self, request: &PrepareDataRequest) -> ApiResult<PrepareDataResponse> {
        let ticker = require_ticker(request.ticker.as_deref())?;
        let key = self.key(&ticker)?;
        let (rows, columns, file) = self.with_key_lock(&key, || self.prepare_features(&key))?;
        Ok(PrepareDataResponse {
            ticker: key.ticker().to_string(),
            rows,
            columns,
            file: file.display().to_string(),
        })
    }

    pub fn train(&self, request: &TrainRequest) -> ApiResult<TrainResponse> {
        let ticker = require_ticker(request.ticker.as_deref())?;
        let params = request.params.resolve()?;
        let key = self.key(&ticker)?;
        let history = self.with_key_lock(&key, || self.train_model(&key, &params))?;
        Ok(TrainResponse::from_history(key.ticker(), history))
    }

    /// Fetch, prepare and train in one call
    pub fn complete_training(&self, request: &TrainRequest) -> ApiResult<TrainResponse> {
        let ticker = require_ticker(request.ticker.as_deref())?;
        let params = request.params.resolve()?;
        let key = self.key(&ticker)?;
        let history = self.with_key_lock(&key, || {
            self.fetch_prices(&key, params.days_back)?;
            self.prepare_features(&key)?;
            self.train_model(&key, &params)
        })?;
        Ok(TrainResponse::from_history(key.ticker(), history))
    }

    pub fn predict(&self, request: &PredictRequest) -> ApiResult<PredictResponse> {
        let ticker = require_ticker(request.ticker.as_deref())?;
        let predict_days = request.resolved_predict_days()?;
        let seq_len = request.seq_len.filter(|v| *v >= 1.0).map(|v| v as usize);
        let key = self.key(&ticker)?;

        let (predictions, file) =
            self.with_key_lock(&key, || self.forecast_and_persist(&key, predict_days, seq_len))?;
        Ok(PredictResponse {
            ticker: key.ticker().to_string(),
            predictions,
            prediction_file: file.display().to_string(),
        })
    }

    /// Train and forecast every ticker listed in the given files
    ///
    /// Files are processed in order, one ticker per non-blank line. A missing
    /// file or a failing ticker is reported in its own entry and never stops
    /// the batch.
    pub fn train_multiple_tickers(
        &self,
        request: &TrainMultipleRequest,
    ) -> ApiResult<Vec<BatchItemResult>> {
        if request.file_list.is_empty() {
            return Err(ApiError::bad_request("fileList is required and cannot be empty"));
        }
        let params = request.params.resolve()?;

        let mut results = Vec::new();
        for file_name in &request.file_list {
            let contents = match fs::read_to_string(file_name) {
                Ok(contents) => contents,
                Err(err) => {
                    warn!("Cannot read ticker list {}: {}", file_name, err);
                    results.push(BatchItemResult::FileError {
                        file: file_name.clone(),
                        error: "File not found".to_string(),
                    });
                    continue;
                }
            };

            for ticker in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
                info!("Processing ticker {} from {}", ticker, file_name);
                match self.run_ticker(ticker, &params) {
                    Ok(prediction_file) => results.push(BatchItemResult::Success {
                        ticker: ticker.to_string(),
                        status: "success".to_string(),
                        prediction_file: prediction_file.display().to_string(),
                    }),
                    Err(err) => {
                        error!("Ticker {} failed: {}", ticker, err);
                        results.push(BatchItemResult::TickerError {
                            ticker: ticker.to_string(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        }
        Ok(results)
    }

    /// Serve previously persisted predictions, all of them or a single day
    pub fn take_predict_dashboard(&self, request: &DashboardRequest) -> ApiResult<DashboardResponse> {
        let ticker = match request.ticker.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_uppercase(),
            _ => return Err(ApiError::bad_request("Ticker parameter is required")),
        };

        let file = self.prediction_file(&ticker);
        let folder_exists = file.parent().map(|p| p.exists()).unwrap_or(false);
        if !folder_exists {
            return Err(ApiError::not_found(format!(
                "Folder for ticker '{}' does not exist",
                ticker
            )));
        }
        if !file.exists() {
            return Err(ApiError::not_found(format!(
                "Prediction file for ticker '{}' not found",
                ticker
            )));
        }

        let predictions = read_predictions(&file)?;
        match request.day {
            Some(day) => {
                if day < 1 || day as usize > predictions.len() {
                    return Err(ApiError::bad_request(format!(
                        "Day parameter must be between 1 and {}",
                        predictions.len()
                    )));
                }
                let day = day as usize;
                Ok(DashboardResponse::Day {
                    ticker,
                    day,
                    prediction: predictions[day - 1].clone(),
                })
            }
            None => Ok(DashboardResponse::All { ticker, predictions }),
        }
    }

    /// Historical OHLCV bars between two unix timestamps, end exclusive
    pub fn historical_candles(&self, request: &CandleRequest) -> ApiResult<Vec<Candle>> {
        let symbol = match request.symbol.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_uppercase(),
            _ => return Err(ApiError::bad_request("Symbol parameter is required")),
        };
        let interval = request
            .resolution
            .as_deref()
            .and_then(|r| Interval::from_resolution(r).ok())
            .ok_or_else(|| ApiError::bad_request("Invalid resolution"))?;

        let day_of = |stamp: Option<i64>, name: &str| {
            stamp
                .and_then(|s| DateTime::from_timestamp(s, 0))
                .map(|t| t.date_naive())
                .ok_or_else(|| ApiError::bad_request(format!("'{}' must be a unix timestamp", name)))
        };
        let start = day_of(request.from, "from")?;
        let end = day_of(request.to, "to")?
            .pred_opt()
            .ok_or_else(|| ApiError::bad_request("'to' must be a unix timestamp"))?;
        if end < start {
            return Err(ApiError::not_found("No data found for the given parameters"));
        }

        info!("Fetching {} candles for {} from {} to {}", interval, symbol, start, end);
        let bars = match self.provider.fetch(&symbol, start, end, interval) {
            Ok(bars) => bars,
            Err(ForecastError::NoDataFound(reason)) => {
                info!("No candles for {}: {}", symbol, reason);
                return Err(ApiError::not_found("No data found for the given parameters"));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Candle::from_frame(&bars)?)
    }

    fn run_ticker(&self, ticker: &str, params: &ResolvedTrainParams) -> Result<PathBuf> {
        let key = self.key(ticker)?;
        let (_, file) = self.with_key_lock(&key, || {
            self.fetch_prices(&key, params.days_back)?;
            self.prepare_features(&key)?;
            self.train_model(&key, params)?;
            self.forecast_and_persist(&key, params.prediction_horizon, None)
        })?;
        // retention is best-effort once the predictions are written
        if let Err(err) = self.cache.purge_previous_day(&key) {
            warn!("Could not remove the previous run of {}: {}", key, err);
        }
        Ok(file)
    }

    fn fetch_prices(&self, key: &CacheKey, days_back: usize) -> Result<(usize, PathBuf)> {
        let out_of_range = || {
            ForecastError::invalid_parameter(
                "days_back",
                format!("{} days before {} is outside the calendar", days_back, key.day()),
            )
        };
        let start = i64::try_from(days_back)
            .ok()
            .and_then(Duration::try_days)
            .and_then(|back| key.day().checked_sub_signed(back))
            .ok_or_else(out_of_range)?;
        let end = key.day().pred_opt().ok_or_else(out_of_range)?;
        info!(
            "Fetching {} from {} to {}",
            key.ticker(),
            start.format(DATE_FORMAT),
            end.format(DATE_FORMAT)
        );

        let mut prices = self.provider.fetch_daily(key.ticker(), start, end)?;
        if prices.height() == 0 {
            return Err(ForecastError::NoDataFound(format!(
                "no rows for {} between {} and {}",
                key.ticker(),
                start,
                end
            )));
        }

        self.cache.ensure_dir(key)?;
        let path = self.cache.path(key, CacheFile::RawPrices);
        write_csv_file(&mut prices, &path)?;
        Ok((prices.height(), path))
    }

    fn prepare_features(&self, key: &CacheKey) -> Result<(usize, usize, PathBuf)> {
        let raw = self.cache.existing_path(key, CacheFile::RawPrices)?;
        let prices = read_price_series(&raw)?;
        let mut indicators = add_technical_indicators(&prices)?;
        if indicators.height() == 0 {
            return Err(ForecastError::InsufficientData(format!(
                "{} price rows are not enough for the indicator warm-up",
                prices.height()
            )));
        }

        let path = self.cache.path(key, CacheFile::Indicators);
        write_csv_file(&mut indicators, &path)?;
        info!(
            "Prepared {} indicator rows for {} at {}",
            indicators.height(),
            key,
            path.display()
        );
        Ok((indicators.height(), indicators.width(), path))
    }

    fn train_model(&self, key: &CacheKey, params: &ResolvedTrainParams) -> Result<TrainingHistory> {
        let indicators = self.cache.existing_path(key, CacheFile::Indicators)?;
        let table = read_feature_table(&indicators)?;

        let mut trainer = Trainer::<TrainBackend>::new(
            params.training.clone(),
            RandomnessContext::new(self.config.seed),
            NdArrayDevice::default(),
        );
        let outcome = trainer.fit(&table, &self.store, key)?;
        Ok(outcome.history)
    }

    fn forecast_and_persist(
        &self,
        key: &CacheKey,
        predict_days: usize,
        seq_len: Option<usize>,
    ) -> Result<(Vec<PredictionRecord>, PathBuf)> {
        let forecaster =
            Forecaster::<InferenceBackend>::load(&self.store, key, NdArrayDevice::default())?;
        if let Some(requested) = seq_len {
            if requested != forecaster.sequence_length() {
                return Err(ForecastError::invalid_parameter(
                    "seq_len",
                    format!(
                        "model was trained with windows of {} rows, got {}",
                        forecaster.sequence_length(),
                        requested
                    ),
                ));
            }
        }

        let indicators = self.cache.existing_path(key, CacheFile::Indicators)?;
        let table = read_feature_table(&indicators)?;
        let prices = forecaster.forecast(&table, predict_days)?;

        let records: Vec<PredictionRecord> = future_weekdays(key.day(), prices.len())
            .into_iter()
            .zip(prices)
            .map(|(date, predicted_price)| PredictionRecord {
                date: date.format(DATE_FORMAT).to_string(),
                predicted_price,
            })
            .collect();

        let file = self.prediction_file(key.ticker());
        write_predictions(&records, &file)?;
        info!("Wrote {} predictions for {} to {}", records.len(), key, file.display());
        Ok((records, file))
    }
}

impl TrainRequest {
    pub fn new(ticker: &str, params: TrainParams) -> Self {
        Self {
            ticker: Some(ticker.to_string()),
            params,
        }
    }
}

fn require_ticker(ticker: Option<&str>) -> ApiResult<String> {
    match ticker.map(str::trim) {
        Some(t) if !t.is_empty() => Ok(t.to_string()),
        _ => Err(ApiError::bad_request("Ticker is required")),
    }
}

/// The first `count` weekdays strictly after `after`
pub fn future_weekdays(after: NaiveDate, count: usize) -> Vec<NaiveDate> {
    let mut dates = Vec::with_capacity(count);
    let mut day = after;
    while dates.len() < count {
        day += Duration::days(1);
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            dates.push(day);
        }
    }
    dates
}
