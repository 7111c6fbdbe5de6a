// External crates
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use std::path::PathBuf;

// Local modules
use stockflow_forecast::config::ServiceConfig;
use stockflow_forecast::service::request::{
    CandleRequest, DashboardRequest, FetchDataRequest, PredictRequest, PrepareDataRequest, TrainMultipleRequest,
    TrainParams, TrainRequest,
};
use stockflow_forecast::service::response::ApiResult;
use stockflow_forecast::service::ForecastService;
use stockflow_forecast::util::market_data::CsvDirectoryProvider;

#[derive(Parser, Debug)]
#[command(author, version, about = "Daily closing-price forecaster", long_about = None)]
struct Cli {
    /// TOML file with data_dir, predictions_dir, market_data_dir and seed
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    predictions_dir: Option<PathBuf>,

    /// Directory holding <TICKER>.csv daily and <TICKER>_<interval>.csv intraday exports
    #[arg(long)]
    market_data_dir: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone)]
struct TrainArgs {
    #[arg(long)]
    days_back: Option<f64>,
    #[arg(long)]
    epochs: Option<f64>,
    #[arg(long)]
    batch_size: Option<f64>,
    #[arg(long)]
    seq_len: Option<f64>,
    #[arg(long)]
    validation_split: Option<f64>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    dropout_rate: Option<f64>,
    #[arg(long)]
    prediction_horizon: Option<f64>,
    #[arg(long)]
    hidden_size: Option<f64>,
    #[arg(long)]
    patience: Option<f64>,
    /// gru or lstm
    #[arg(long)]
    cell: Option<String>,
    /// single_step or multi_step
    #[arg(long)]
    mode: Option<String>,
}

impl From<TrainArgs> for TrainParams {
    fn from(args: TrainArgs) -> Self {
        Self {
            days_back: args.days_back,
            epochs: args.epochs,
            batch_size: args.batch_size,
            seq_len: args.seq_len,
            validation_split: args.validation_split,
            learning_rate: args.learning_rate,
            dropout_rate: args.dropout_rate,
            prediction_horizon: args.prediction_horizon,
            hidden_size: args.hidden_size,
            patience: args.patience,
            cell: args.cell,
            mode: args.mode,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download daily prices into today's run directory
    FetchData {
        ticker: String,
        #[arg(long)]
        days_back: Option<f64>,
    },
    /// Compute indicators from the fetched prices
    PrepareData { ticker: String },
    /// Train from the prepared indicators
    Train {
        ticker: String,
        #[command(flatten)]
        params: TrainArgs,
    },
    /// Fetch, prepare and train
    CompleteTraining {
        ticker: String,
        #[command(flatten)]
        params: TrainArgs,
    },
    /// Forecast closing prices with today's model
    Predict {
        ticker: String,
        #[arg(long)]
        predict_days: Option<f64>,
        #[arg(long)]
        seq_len: Option<f64>,
    },
    /// Run the full pipeline for every ticker listed in the given files
    TrainMultipleTickers {
        files: Vec<String>,
        #[command(flatten)]
        params: TrainArgs,
    },
    /// Historical bars between two unix timestamps, `to` exclusive
    Candle {
        symbol: String,
        /// 1, 5, 15, 30, 60, D, W or M
        #[arg(long, default_value = "D")]
        resolution: String,
        #[arg(long)]
        from: i64,
        #[arg(long)]
        to: i64,
    },
    /// Show persisted predictions
    Dashboard {
        ticker: String,
        #[arg(long)]
        day: Option<i64>,
    },
}

fn load_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.predictions_dir {
        config.predictions_dir = dir.clone();
    }
    if let Some(dir) = &cli.market_data_dir {
        config.market_data_dir = dir.clone();
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    Ok(config)
}

/// Print the JSON body; errors also set a non-zero exit status
fn emit<T: Serialize>(result: ApiResult<T>) -> Result<()> {
    match result {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&err)?);
            Err(anyhow::Error::new(err))
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(
        "Using data_dir={} predictions_dir={} market_data_dir={} seed={}",
        config.data_dir.display(),
        config.predictions_dir.display(),
        config.market_data_dir.display(),
        config.seed
    );

    let provider = CsvDirectoryProvider::new(config.market_data_dir.clone());
    let service = ForecastService::new(config, provider);

    match cli.command {
        Command::FetchData { ticker, days_back } => emit(service.fetch_data(&FetchDataRequest {
            ticker: Some(ticker),
            days_back,
        })),
        Command::PrepareData { ticker } => emit(service.prepare_data(&PrepareDataRequest {
            ticker: Some(ticker),
        })),
        Command::Train { ticker, params } => {
            emit(service.train(&TrainRequest::new(&ticker, params.into())))
        }
        Command::CompleteTraining { ticker, params } => {
            emit(service.complete_training(&TrainRequest::new(&ticker, params.into())))
        }
        Command::Predict {
            ticker,
            predict_days,
            seq_len,
        } => emit(service.predict(&PredictRequest {
            ticker: Some(ticker),
            predict_days,
            seq_len,
        })),
        Command::TrainMultipleTickers { files, params } => {
            emit(service.train_multiple_tickers(&TrainMultipleRequest {
                file_list: files,
                params: params.into(),
            }))
        }
        Command::Candle {
            symbol,
            resolution,
            from,
            to,
        } => emit(service.historical_candles(&CandleRequest {
            symbol: Some(symbol),
            resolution: Some(resolution),
            from: Some(from),
            to: Some(to),
        })),
        Command::Dashboard { ticker, day } => emit(service.take_predict_dashboard(&DashboardRequest {
            ticker: Some(ticker),
            day,
        })),
    }
}
