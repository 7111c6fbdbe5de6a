// External crates
use log::debug;
use ndarray::{Array2, ArrayView2, Axis};
use polars::prelude::*;
use rustalib::indicators::moving_averages::{calculate_ema, calculate_sma};
use rustalib::indicators::oscillators::{calculate_macd, calculate_rsi};
use rustalib::indicators::volatility::{calculate_atr, calculate_bollinger_bands};

// Internal modules
use crate::constants::{CLOSE_COLUMN, DATE_COLUMN, FEATURE_COLUMNS};
use crate::error::{ForecastError, Result};

/// Columns that stay in the price CSV but never reach the model
const EXCLUDED_COLUMNS: [&str; 2] = [DATE_COLUMN, "adjusted_close"];

/// Scaled or unscaled model inputs, one row per trading day
///
/// Rows are aligned with a trailing suffix of the source price series: the
/// indicator warm-up rows are already gone. Every row carries the same feature
/// set and the position of `close` is kept so forecasting can write into it.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    dates: Vec<String>,
    columns: Vec<String>,
    close_index: usize,
    values: Array2<f64>,
}

impl FeatureTable {
    pub fn new(dates: Vec<String>, columns: Vec<String>, values: Array2<f64>) -> Result<Self> {
        let close_index = columns
            .iter()
            .position(|c| c == CLOSE_COLUMN)
            .ok_or_else(|| {
                ForecastError::invalid_parameter("columns", "feature table has no 'close' column")
            })?;

        if values.ncols() != columns.len() {
            return Err(ForecastError::ShapeMismatch {
                expected: columns.len(),
                actual: values.ncols(),
            });
        }
        if values.nrows() != dates.len() {
            return Err(ForecastError::invalid_parameter(
                "dates",
                format!("{} dates for {} rows", dates.len(), values.nrows()),
            ));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ForecastError::invalid_parameter(
                "values",
                "feature table contains undefined values",
            ));
        }

        Ok(Self {
            dates,
            columns,
            close_index,
            values,
        })
    }

    /// Build a table from an indicator frame, keeping every column except the
    /// date and adjusted close
    pub fn from_dataframe(df: &DataFrame) -> Result<Self> {
        let dates = if df.schema().contains(DATE_COLUMN) {
            let date_col = df.column(DATE_COLUMN)?.cast(&DataType::String)?;
            date_col
                .str()?
                .into_iter()
                .map(|d| d.unwrap_or_default().to_string())
                .collect()
        } else {
            vec![String::new(); df.height()]
        };

        let columns: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|c| c.to_string())
            .filter(|c| !EXCLUDED_COLUMNS.contains(&c.as_str()))
            .collect();

        let mut values = Array2::<f64>::zeros((df.height(), columns.len()));
        for (j, name) in columns.iter().enumerate() {
            let casted = df.column(name)?.cast(&DataType::Float64)?;
            for (i, value) in casted.f64()?.into_iter().enumerate() {
                values[[i, j]] = value.unwrap_or(f64::NAN);
            }
        }

        Self::new(dates, columns, values)
    }

    /// Convert back into a polars frame (date column first)
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let mut columns: Vec<Column> = Vec::with_capacity(self.columns.len() + 1);
        columns.push(Series::new(DATE_COLUMN.into(), self.dates.clone()).into_column());
        for (j, name) in self.columns.iter().enumerate() {
            let values: Vec<f64> = self.values.column(j).to_vec();
            columns.push(Series::new(name.as_str().into(), values).into_column());
        }
        Ok(DataFrame::new(columns)?)
    }

    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    pub fn num_features(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn close_index(&self) -> usize {
        self.close_index
    }

    pub fn dates(&self) -> &[String] {
        &self.dates
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn close(&self) -> Vec<f64> {
        self.values.column(self.close_index).to_vec()
    }

    pub fn last_date(&self) -> Option<&str> {
        self.dates.last().map(|d| d.as_str())
    }

    /// The last `n` rows
    pub fn tail(&self, n: usize) -> ArrayView2<'_, f64> {
        let start = self.len().saturating_sub(n);
        self.values.slice_axis(Axis(0), (start..).into())
    }

    /// Same dates and columns, new values (used for the scaled copy)
    pub fn with_values(&self, values: Array2<f64>) -> Result<Self> {
        Self::new(self.dates.clone(), self.columns.clone(), values)
    }
}

/// Trailing window that stays undefined until `window` rows are present
fn fixed_window(window: usize) -> RollingOptionsFixedWindow {
    RollingOptionsFixedWindow {
        window_size: window,
        min_periods: window,
        center: false,
        weights: None,
        fn_params: None,
    }
}

/// Average directional index with the +DI / -DI lines, as (adx, di_plus, di_minus)
///
/// +DM/-DM and the true range are Wilder-smoothed over `window`; DX is then
/// averaged the same way.
pub fn calculate_adx(df: &DataFrame, window: usize) -> Result<(Series, Series, Series)> {
    let high = column_values(df, "high")?;
    let low = column_values(df, "low")?;
    let close = column_values(df, CLOSE_COLUMN)?;

    let n = close.len();
    let mut plus_dm = vec![None; n];
    let mut minus_dm = vec![None; n];
    for i in 1..n {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        plus_dm[i] = Some(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm[i] = Some(if down > up && down > 0.0 { down } else { 0.0 });
    }

    let smoothed_tr = wilder_smooth(&true_range(&high, &low, &close), window);
    let smoothed_plus = wilder_smooth(&plus_dm, window);
    let smoothed_minus = wilder_smooth(&minus_dm, window);

    let directional = |dm: &[Option<f64>]| -> Vec<Option<f64>> {
        dm.iter()
            .zip(&smoothed_tr)
            .map(|(d, tr)| {
                let (d, tr) = ((*d)?, (*tr)?);
                Some(if tr == 0.0 { 0.0 } else { 100.0 * d / tr })
            })
            .collect()
    };
    let di_plus = directional(&smoothed_plus);
    let di_minus = directional(&smoothed_minus);

    let dx: Vec<Option<f64>> = di_plus
        .iter()
        .zip(&di_minus)
        .map(|(p, m)| {
            let (p, m) = ((*p)?, (*m)?);
            let sum = p + m;
            Some(if sum == 0.0 { 0.0 } else { 100.0 * (p - m).abs() / sum })
        })
        .collect();
    let adx = wilder_smooth(&dx, window);

    Ok((
        Series::new("adx".into(), adx),
        Series::new("di_plus".into(), di_plus),
        Series::new("di_minus".into(), di_minus),
    ))
}

/// Commodity channel index over the typical price `(high + low + close) / 3`
pub fn calculate_cci(df: &DataFrame, window: usize) -> Result<Series> {
    let high = df.column("high")?.f64()?;
    let low = df.column("low")?.f64()?;
    let close = df.column(CLOSE_COLUMN)?.f64()?;
    let typical: Vec<Option<f64>> = high
        .into_iter()
        .zip(low.into_iter())
        .zip(close.into_iter())
        .map(|((h, l), c)| Some((h? + l? + c?) / 3.0))
        .collect();
    let typical = Series::new("typical_price".into(), typical);
    let typical_mean = typical.rolling_mean(fixed_window(window))?;

    let values: Vec<f64> = typical
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect();
    let cci: Vec<Option<f64>> = typical_mean
        .f64()?
        .into_iter()
        .enumerate()
        .map(|(i, mean)| {
            let mean = mean?;
            let start = (i + 1).checked_sub(window)?;
            let span = &values[start..=i];
            let mean_dev = span.iter().map(|v| (v - mean).abs()).sum::<f64>() / span.len() as f64;
            Some(if mean_dev == 0.0 {
                0.0
            } else {
                (values[i] - mean) / (0.015 * mean_dev)
            })
        })
        .collect();

    Ok(Series::new("cci".into(), cci))
}

/// On-balance volume; the first row is 0
pub fn calculate_obv(df: &DataFrame) -> Result<Series> {
    let prev_close = col(CLOSE_COLUMN).shift(lit(1));
    let signed_volume = when(col(CLOSE_COLUMN).gt(prev_close.clone()))
        .then(col("volume"))
        .when(col(CLOSE_COLUMN).lt(prev_close))
        .then(lit(0.0) - col("volume"))
        .otherwise(lit(0.0));

    let out = df
        .clone()
        .lazy()
        .select([signed_volume.cum_sum(false).alias("obv")])
        .collect()?;
    Ok(out.column("obv")?.cast(&DataType::Float64)?.as_materialized_series().clone())
}

/// Stochastic oscillator (%K, %D); %K is undefined when the window range is zero
pub fn calculate_stochastic(df: &DataFrame, window: usize, smooth: usize) -> Result<(Series, Series)> {
    let lowest = df
        .column("low")?
        .as_materialized_series()
        .rolling_min(fixed_window(window))?;
    let highest = df
        .column("high")?
        .as_materialized_series()
        .rolling_max(fixed_window(window))?;
    let close = df.column(CLOSE_COLUMN)?.f64()?;

    let k: Vec<Option<f64>> = close
        .into_iter()
        .zip(lowest.f64()?.into_iter())
        .zip(highest.f64()?.into_iter())
        .map(|((c, lo), hi)| {
            let (c, lo, hi) = (c?, lo?, hi?);
            let range = hi - lo;
            if range == 0.0 {
                None
            } else {
                Some(100.0 * (c - lo) / range)
            }
        })
        .collect();
    let k = Series::new("stoch_k".into(), k);
    let d = k.rolling_mean(fixed_window(smooth))?.with_name("stoch_d".into());

    Ok((k, d))
}

/// Adds every model indicator to a price frame and drops warm-up rows
///
/// Moving averages, RSI, MACD, Bollinger bands and ATR come from rustalib;
/// ADX, CCI, OBV and the stochastic oscillator are computed here.
///
/// # Arguments
///
/// * `prices` - Frame with `date, open, high, low, close, volume` (and optionally `adjusted_close`)
///
/// # Returns
///
/// The indicator frame: date, adjusted close (when present) and the model
/// feature columns, containing only rows where every indicator is defined
pub fn add_technical_indicators(prices: &DataFrame) -> Result<DataFrame> {
    if prices.height() == 0 {
        return Err(ForecastError::NoDataFound("empty price series".to_string()));
    }

    let mut df = ohlcv_frame(prices)?;
    let height = df.height();

    let sma_10 = calculate_sma(&df, CLOSE_COLUMN, 10)?;
    let sma_50 = calculate_sma(&df, CLOSE_COLUMN, 50)?;
    let ema_10 = calculate_ema(&df, CLOSE_COLUMN, 10)?;
    let ema_50 = calculate_ema(&df, CLOSE_COLUMN, 50)?;
    let (bb_middle, bb_upper, bb_lower) = calculate_bollinger_bands(&df, 20, 2.0, CLOSE_COLUMN)?;
    let atr_14 = calculate_atr(&df, 14)?;
    let rsi_14 = calculate_rsi(&df, 14, CLOSE_COLUMN)?;
    let (macd, macd_signal) = calculate_macd(&df, 12, 26, 9, CLOSE_COLUMN)?;
    let (adx_14, di_plus_14, di_minus_14) = calculate_adx(&df, 14)?;
    let cci_14 = calculate_cci(&df, 14)?;
    let obv = calculate_obv(&df)?;
    let (stoch_k, stoch_d) = calculate_stochastic(&df, 14, 3)?;

    let indicators = [
        ("sma_10", sma_10),
        ("sma_50", sma_50),
        ("ema_10", ema_10),
        ("ema_50", ema_50),
        ("bb_upper", bb_upper),
        ("bb_middle", bb_middle),
        ("bb_lower", bb_lower),
        ("atr_14", atr_14),
        ("rsi_14", rsi_14),
        ("macd", macd),
        ("macd_signal", macd_signal),
        ("adx_14", adx_14),
        ("di_plus_14", di_plus_14),
        ("di_minus_14", di_minus_14),
        ("cci_14", cci_14),
        ("obv", obv),
        ("stoch_k", stoch_k),
        ("stoch_d", stoch_d),
    ];
    for (name, series) in indicators {
        df.with_column(align_to_height(series, name, height)?)?;
    }

    let mut columns: Vec<Column> = Vec::with_capacity(FEATURE_COLUMNS.len() + 2);
    if prices.schema().contains(DATE_COLUMN) {
        columns.push(prices.column(DATE_COLUMN)?.cast(&DataType::String)?);
    }
    if prices.schema().contains("adjusted_close") {
        columns.push(prices.column("adjusted_close")?.cast(&DataType::Float64)?);
    }
    for name in FEATURE_COLUMNS {
        // NaN and inf from degenerate inputs count as undefined too
        let values: Vec<Option<f64>> = df
            .column(name)?
            .f64()?
            .into_iter()
            .map(|v| v.filter(|x| x.is_finite()))
            .collect();
        columns.push(Series::new(name.into(), values).into_column());
    }

    let with_indicators = DataFrame::new(columns)?;
    let result = with_indicators.drop_nulls::<String>(None)?;

    debug!(
        "Indicators computed: {} input rows, {} rows after warm-up",
        prices.height(),
        result.height()
    );

    Ok(result)
}

/// Runs [`add_technical_indicators`] and converts the result into a feature table
pub fn compute_feature_table(prices: &DataFrame) -> Result<FeatureTable> {
    let indicators = add_technical_indicators(prices)?;
    FeatureTable::from_dataframe(&indicators)
}

/// The raw OHLCV columns cast to Float64, as the indicator functions expect
fn ohlcv_frame(prices: &DataFrame) -> Result<DataFrame> {
    let mut columns = Vec::with_capacity(5);
    for name in ["open", "high", "low", CLOSE_COLUMN, "volume"] {
        columns.push(prices.column(name)?.cast(&DataType::Float64)?);
    }
    Ok(DataFrame::new(columns)?)
}

/// Renames an indicator and pads it with leading nulls up to the frame height
fn align_to_height(series: Series, name: &str, height: usize) -> Result<Series> {
    let series = series.cast(&DataType::Float64)?;
    let len = series.len();
    if len >= height {
        return Ok(series.slice((len - height) as i64, height).with_name(name.into()));
    }

    let mut padded: Vec<Option<f64>> = vec![None; height - len];
    padded.extend(series.f64()?.into_iter());
    Ok(Series::new(name.into(), padded))
}

fn column_values(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let casted = df.column(name)?.cast(&DataType::Float64)?;
    let values = casted
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect();
    Ok(values)
}

fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<Option<f64>> {
    let mut tr = vec![None; close.len()];
    for i in 1..close.len() {
        let prev_close = close[i - 1];
        let range = (high[i] - low[i])
            .max((high[i] - prev_close).abs())
            .max((low[i] - prev_close).abs());
        tr[i] = Some(range);
    }
    tr
}

/// Wilder smoothing seeded with the mean of the first `window` defined values
fn wilder_smooth(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    let Some(start) = values.iter().position(|v| v.is_some()) else {
        return out;
    };
    let run = values[start..].iter().take_while(|v| v.is_some()).count();
    if window == 0 || run < window {
        return out;
    }

    let alpha = 1.0 / window as f64;
    let seed_idx = start + window - 1;
    let mut prev = values[start..=seed_idx].iter().flatten().sum::<f64>() / window as f64;
    out[seed_idx] = Some(prev);

    for i in seed_idx + 1..start + run {
        if let Some(v) = values[i] {
            prev = alpha * v + (1.0 - alpha) * prev;
            out[i] = Some(prev);
        }
    }
    out
}
