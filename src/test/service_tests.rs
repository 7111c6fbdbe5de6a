// External imports
use chrono::NaiveDate;
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

// Internal imports
use crate::config::ServiceConfig;
use crate::service::request::{
    CandleRequest, DashboardRequest, FetchDataRequest, PredictRequest, PrepareDataRequest, TrainMultipleRequest,
    TrainParams, TrainRequest,
};
use crate::service::response::{BatchItemResult, DashboardResponse};
use crate::service::ForecastService;
use crate::util::file_utils::read_predictions;
use crate::util::market_data::InMemoryProvider;
use crate::util::run_cache::{CacheFile, CacheKey};
use crate::util::test_utils::linear_price_frame;

// linear_price_frame(120) covers 2023-01-02 ..= 2023-05-01
fn run_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 5, 2).unwrap()
}

fn service(dir: &TempDir) -> ForecastService<InMemoryProvider> {
    let provider = InMemoryProvider::new().with_series("AAPL", linear_price_frame(120));
    ForecastService::new(ServiceConfig::rooted_at(dir.path(), 42), provider).with_run_day(run_day())
}

fn quick_params() -> TrainParams {
    TrainParams {
        epochs: Some(1.0),
        batch_size: Some(16.0),
        seq_len: Some(20.0),
        hidden_size: Some(8.0),
        prediction_horizon: Some(5.0),
        ..TrainParams::default()
    }
}

fn write_ticker_list(dir: &Path, name: &str, contents: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path.display().to_string()
}

#[test]
fn test_step_by_step_operations() {
    let dir = tempdir().unwrap();
    let service = service(&dir);

    let fetched = service
        .fetch_data(&FetchDataRequest {
            ticker: Some("aapl".into()),
            days_back: None,
        })
        .unwrap();
    assert_eq!(fetched.ticker, "AAPL");
    assert_eq!(fetched.rows, 120);

    let prepared = service
        .prepare_data(&PrepareDataRequest {
            ticker: Some("AAPL".into()),
        })
        .unwrap();
    assert_eq!(prepared.rows, 71);
    // date + adjusted_close + 23 features
    assert_eq!(prepared.columns, 25);

    let trained = service.train(&TrainRequest::new("AAPL", quick_params())).unwrap();
    assert_eq!(trained.status, "success");
    assert_eq!(trained.epochs_run, 1);

    let predicted = service
        .predict(&PredictRequest {
            ticker: Some("AAPL".into()),
            predict_days: Some(3.0),
            seq_len: None,
        })
        .unwrap();
    assert_eq!(predicted.predictions.len(), 3);
    // 2023-05-02 is a Tuesday
    assert_eq!(predicted.predictions[0].date, "2023-05-03");
    assert_eq!(read_predictions(&predicted.prediction_file).unwrap(), predicted.predictions);
}

#[test]
fn test_predict_errors() {
    let dir = tempdir().unwrap();
    let service = service(&dir);

    let missing = service
        .predict(&PredictRequest {
            ticker: Some("AAPL".into()),
            ..PredictRequest::default()
        })
        .unwrap_err();
    assert_eq!(missing.status, 404);

    service.complete_training(&TrainRequest::new("AAPL", quick_params())).unwrap();

    let too_long = service
        .predict(&PredictRequest {
            ticker: Some("AAPL".into()),
            predict_days: Some(10.0),
            seq_len: None,
        })
        .unwrap_err();
    assert_eq!(too_long.status, 400);

    let wrong_window = service
        .predict(&PredictRequest {
            ticker: Some("AAPL".into()),
            predict_days: Some(2.0),
            seq_len: Some(60.0),
        })
        .unwrap_err();
    assert_eq!(wrong_window.status, 400);
}

#[test]
fn test_unknown_ticker_has_no_data() {
    let dir = tempdir().unwrap();
    let err = service(&dir)
        .fetch_data(&FetchDataRequest {
            ticker: Some("ZZZZ".into()),
            days_back: Some(30.0),
        })
        .unwrap_err();
    assert_eq!(err.status, 404);
    assert!(err.error.starts_with("No data found"));
}

#[test]
fn test_huge_days_back_is_bad_request() {
    let dir = tempdir().unwrap();
    let service = service(&dir);
    for days_back in [1e9, 1e20] {
        let err = service
            .fetch_data(&FetchDataRequest {
                ticker: Some("AAPL".into()),
                days_back: Some(days_back),
            })
            .unwrap_err();
        assert_eq!(err.status, 400, "days_back = {}", days_back);
        assert!(err.error.contains("days_back"));
    }
}

#[test]
fn test_batch_with_missing_file_and_failing_ticker() {
    let dir = tempdir().unwrap();
    let service = service(&dir);
    let list = write_ticker_list(dir.path(), "tickers.txt", "AAPL\n\n  \nMSFT\n");
    let missing = dir.path().join("nope.txt").display().to_string();

    let results = service
        .train_multiple_tickers(&TrainMultipleRequest {
            file_list: vec![list, missing.clone()],
            params: quick_params(),
        })
        .unwrap();

    assert_eq!(results.len(), 3);
    match &results[0] {
        BatchItemResult::Success {
            ticker,
            status,
            prediction_file,
        } => {
            assert_eq!(ticker, "AAPL");
            assert_eq!(status, "success");
            assert_eq!(read_predictions(prediction_file).unwrap().len(), 5);
        }
        other => panic!("expected success, got {:?}", other),
    }
    assert!(matches!(&results[1], BatchItemResult::TickerError { ticker, .. } if ticker == "MSFT"));
    assert_eq!(
        results[2],
        BatchItemResult::FileError {
            file: missing,
            error: "File not found".to_string()
        }
    );
}

#[test]
fn test_empty_file_list_is_bad_request() {
    let dir = tempdir().unwrap();
    let err = service(&dir)
        .train_multiple_tickers(&TrainMultipleRequest::default())
        .unwrap_err();
    assert_eq!(err.status, 400);
}

#[test]
fn test_batch_purges_previous_day() {
    let dir = tempdir().unwrap();
    let service = service(&dir);
    let today = CacheKey::new("AAPL", run_day()).unwrap();
    let yesterday_dir = service.cache().ensure_dir(&today.previous_day()).unwrap();
    fs::write(yesterday_dir.join("AAPL_data.csv"), "date,close\n").unwrap();

    let list = write_ticker_list(dir.path(), "tickers.txt", "AAPL\n");
    let results = service
        .train_multiple_tickers(&TrainMultipleRequest {
            file_list: vec![list],
            params: quick_params(),
        })
        .unwrap();

    assert!(results[0].is_success());
    assert!(!yesterday_dir.exists());
    assert!(service.cache().path(&today, CacheFile::Indicators).exists());
    assert!(service.cache().path(&today, CacheFile::Model).exists());
}

#[test]
fn test_failed_retention_keeps_ticker_successful() {
    let dir = tempdir().unwrap();
    let service = service(&dir);
    let today = CacheKey::new("AAPL", run_day()).unwrap();
    // a plain file where the previous day's directory would be cannot be purged
    let blocker = service.cache().key_dir(&today.previous_day());
    fs::create_dir_all(blocker.parent().unwrap()).unwrap();
    fs::write(&blocker, "not a directory").unwrap();

    let list = write_ticker_list(dir.path(), "tickers.txt", "AAPL\n");
    let results = service
        .train_multiple_tickers(&TrainMultipleRequest {
            file_list: vec![list],
            params: quick_params(),
        })
        .unwrap();

    assert!(results[0].is_success(), "{:?}", results[0]);
    assert!(blocker.is_file());
}

#[test]
fn test_dashboard() {
    let dir = tempdir().unwrap();
    let service = service(&dir);

    let no_ticker = service.take_predict_dashboard(&DashboardRequest::default()).unwrap_err();
    assert_eq!(no_ticker.status, 400);

    let no_folder = service
        .take_predict_dashboard(&DashboardRequest {
            ticker: Some("AAPL".into()),
            day: None,
        })
        .unwrap_err();
    assert_eq!(no_folder.status, 404);

    fs::create_dir_all(dir.path().join("predictions").join("AAPL")).unwrap();
    let no_file = service
        .take_predict_dashboard(&DashboardRequest {
            ticker: Some("AAPL".into()),
            day: None,
        })
        .unwrap_err();
    assert_eq!(no_file.status, 404);

    let list = write_ticker_list(dir.path(), "tickers.txt", "AAPL\n");
    service
        .train_multiple_tickers(&TrainMultipleRequest {
            file_list: vec![list],
            params: quick_params(),
        })
        .unwrap();

    match service
        .take_predict_dashboard(&DashboardRequest {
            ticker: Some("aapl".into()),
            day: None,
        })
        .unwrap()
    {
        DashboardResponse::All { ticker, predictions } => {
            assert_eq!(ticker, "AAPL");
            assert_eq!(predictions.len(), 5);
        }
        other => panic!("expected all predictions, got {:?}", other),
    }

    match service
        .take_predict_dashboard(&DashboardRequest {
            ticker: Some("AAPL".into()),
            day: Some(2),
        })
        .unwrap()
    {
        DashboardResponse::Day { day, prediction, .. } => {
            assert_eq!(day, 2);
            assert_eq!(prediction.date, "2023-05-04");
        }
        other => panic!("expected one day, got {:?}", other),
    }

    for day in [0, 6] {
        let err = service
            .take_predict_dashboard(&DashboardRequest {
                ticker: Some("AAPL".into()),
                day: Some(day),
            })
            .unwrap_err();
        assert_eq!(err.status, 400);
    }
}

fn candle_request(resolution: Option<&str>, from: i64, to: i64) -> CandleRequest {
    CandleRequest {
        symbol: Some("aapl".into()),
        resolution: resolution.map(str::to_string),
        from: Some(from),
        to: Some(to),
    }
}

#[test]
fn test_daily_candles_exclude_the_end_day() {
    let dir = tempdir().unwrap();
    let service = service(&dir);

    // 2023-01-05 00:00 UTC to 2023-01-10 00:00 UTC
    let candles = service
        .historical_candles(&candle_request(Some("D"), 1672876800, 1673308800))
        .unwrap();
    let dates: Vec<&str> = candles.iter().map(|c| c.date.as_str()).collect();
    assert_eq!(dates, vec!["2023-01-05", "2023-01-06", "2023-01-07", "2023-01-08", "2023-01-09"]);
    assert!(candles.iter().all(|c| c.low <= c.close && c.close <= c.high));
}

#[test]
fn test_weekly_candles() {
    let dir = tempdir().unwrap();
    let service = service(&dir);

    // 2023-01-02 (Monday) to 2023-01-16
    let candles = service
        .historical_candles(&candle_request(Some("W"), 1672617600, 1673827200))
        .unwrap();
    assert_eq!(candles.len(), 2);
    assert_eq!(candles[1].date, "2023-01-09");
}

#[test]
fn test_candle_errors() {
    let dir = tempdir().unwrap();
    let service = service(&dir);

    let err = service
        .historical_candles(&candle_request(Some("H"), 1672876800, 1673308800))
        .unwrap_err();
    assert_eq!((err.status, err.error.as_str()), (400, "Invalid resolution"));

    let err = service
        .historical_candles(&candle_request(None, 1672876800, 1673308800))
        .unwrap_err();
    assert_eq!(err.status, 400);

    let missing_symbol = CandleRequest {
        symbol: None,
        ..candle_request(Some("D"), 1672876800, 1673308800)
    };
    assert_eq!(service.historical_candles(&missing_symbol).unwrap_err().status, 400);

    let err = service
        .historical_candles(&candle_request(Some("D"), 1893456000, 1896134400))
        .unwrap_err();
    assert_eq!((err.status, err.error.as_str()), (404, "No data found for the given parameters"));

    // no intraday export for AAPL
    let err = service
        .historical_candles(&candle_request(Some("5"), 1672876800, 1673308800))
        .unwrap_err();
    assert_eq!(err.status, 404);
}
