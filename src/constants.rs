// Raw price columns as stored in the per-run CSV
pub const PRICE_COLUMNS: [&str; 7] = [
    "date",
    "open",
    "high",
    "low",
    "close",
    "adjusted_close",
    "volume",
];

// Model input features, in column order of the feature table
pub const FEATURE_COLUMNS: [&str; 23] = [
    "open",
    "high",
    "low",
    "close",
    "volume",
    "sma_10",
    "sma_50",
    "ema_10",
    "ema_50",
    "bb_upper",
    "bb_middle",
    "bb_lower",
    "atr_14",
    "rsi_14",
    "macd",
    "macd_signal",
    "adx_14",
    "di_plus_14",
    "di_minus_14",
    "cci_14",
    "obv",
    "stoch_k",
    "stoch_d",
];

// Predictions are written into this slot during recursive forecasting
pub const CLOSE_COLUMN: &str = "close";
pub const DATE_COLUMN: &str = "date";

// Request defaults
pub const DEFAULT_DAYS_BACK: usize = 500;
pub const DEFAULT_EPOCHS: usize = 100;
pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_SEQUENCE_LENGTH: usize = 60;
pub const DEFAULT_VALIDATION_SPLIT: f64 = 0.1;
pub const DEFAULT_LEARNING_RATE: f64 = 0.001;
pub const DEFAULT_DROPOUT_RATE: f64 = 0.2;
pub const DEFAULT_PREDICTION_HORIZON: usize = 30;
pub const DEFAULT_PREDICT_DAYS: usize = 10;

// Model parameters
pub const DEFAULT_HIDDEN_SIZE: usize = 50;
pub const EARLY_STOPPING_PATIENCE: usize = 10;
pub const DEFAULT_SEED: u64 = 42;

// Storage layout
pub const DATA_DIR: &str = "data";
pub const PREDICTIONS_DIR: &str = "predictions";
pub const MARKET_DATA_DIR: &str = "market_data";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
