// External crates
use chrono::{Datelike, Days, NaiveDate};
use log::info;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

// Internal modules
use crate::constants::{DATE_COLUMN, DATE_FORMAT};
use crate::error::{ForecastError, Result};
use crate::util::file_utils::{
    read_csv_file, read_price_series, standardize_bars, standardize_price_frame,
    INTRADAY_STAMP_WIDTH,
};

/// Bar size of a price request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    Minute1,
    Minute5,
    Minute15,
    Minute30,
    Minute60,
    Daily,
    Weekly,
    Monthly,
}

impl Interval {
    /// Parse a candle resolution code: `1`, `5`, `15`, `30`, `60`, `D`, `W` or `M`
    pub fn from_resolution(resolution: &str) -> Result<Self> {
        match resolution.trim() {
            "1" => Ok(Interval::Minute1),
            "5" => Ok(Interval::Minute5),
            "15" => Ok(Interval::Minute15),
            "30" => Ok(Interval::Minute30),
            "60" => Ok(Interval::Minute60),
            "D" => Ok(Interval::Daily),
            "W" => Ok(Interval::Weekly),
            "M" => Ok(Interval::Monthly),
            other => Err(ForecastError::invalid_parameter(
                "resolution",
                format!("'{}' is not one of 1, 5, 15, 30, 60, D, W, M", other),
            )),
        }
    }

    /// Short interval name, also used as the suffix of intraday export files
    pub fn code(&self) -> &'static str {
        match self {
            Interval::Minute1 => "1m",
            Interval::Minute5 => "5m",
            Interval::Minute15 => "15m",
            Interval::Minute30 => "30m",
            Interval::Minute60 => "60m",
            Interval::Daily => "1d",
            Interval::Weekly => "1wk",
            Interval::Monthly => "1mo",
        }
    }

    pub fn is_intraday(&self) -> bool {
        !matches!(self, Interval::Daily | Interval::Weekly | Interval::Monthly)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Source of OHLCV history
pub trait MarketDataProvider {
    /// Bars for `ticker` at `interval` whose day lies in `[start, end]`
    ///
    /// An empty result is `NoDataFound`.
    fn fetch(&self, ticker: &str, start: NaiveDate, end: NaiveDate, interval: Interval)
        -> Result<DataFrame>;

    fn fetch_daily(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<DataFrame> {
        self.fetch(ticker, start, end, Interval::Daily)
    }
}

/// Reads `<dir>/<TICKER>.csv` daily exports and `<dir>/<TICKER>_<interval>.csv`
/// intraday exports; weekly and monthly bars are built from the daily file
#[derive(Debug, Clone)]
pub struct CsvDirectoryProvider {
    dir: PathBuf,
}

impl CsvDirectoryProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn export_path(&self, ticker: &str, interval: Interval) -> Result<PathBuf> {
        let ticker = ticker.trim().to_uppercase();
        if ticker.is_empty() || ticker.contains(['/', '\\']) || ticker.contains("..") {
            return Err(ForecastError::invalid_parameter(
                "ticker",
                format!("'{}' is not a valid ticker symbol", ticker),
            ));
        }
        let file_name = if interval.is_intraday() {
            format!("{}_{}.csv", ticker, interval.code())
        } else {
            format!("{}.csv", ticker)
        };
        Ok(self.dir.join(file_name))
    }
}

impl MarketDataProvider for CsvDirectoryProvider {
    fn fetch(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Interval,
    ) -> Result<DataFrame> {
        let path = self.export_path(ticker, interval)?;
        if !path.exists() {
            return Err(ForecastError::NoDataFound(format!(
                "no {} market data for {} in {}",
                interval,
                ticker,
                self.dir.display()
            )));
        }

        let bars = if interval.is_intraday() {
            standardize_bars(&read_csv_file(&path)?, INTRADAY_STAMP_WIDTH)?
        } else {
            read_price_series(&path)?
        };
        let bars = select_bars(ticker, &bars, start, end, interval)?;
        info!(
            "Fetched {} {} bars for {} from {}",
            bars.height(),
            interval,
            ticker,
            path.display()
        );
        Ok(bars)
    }
}

/// Serves fixed frames per ticker; used in tests
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvider {
    series: HashMap<String, DataFrame>,
    intraday: HashMap<(String, Interval), DataFrame>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Daily history, also the source of weekly and monthly bars
    pub fn with_series(mut self, ticker: &str, prices: DataFrame) -> Self {
        self.series.insert(ticker.to_uppercase(), prices);
        self
    }

    pub fn with_intraday(mut self, ticker: &str, interval: Interval, bars: DataFrame) -> Self {
        self.intraday.insert((ticker.to_uppercase(), interval), bars);
        self
    }
}

impl MarketDataProvider for InMemoryProvider {
    fn fetch(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Interval,
    ) -> Result<DataFrame> {
        let ticker_key = ticker.to_uppercase();
        let no_data = || ForecastError::NoDataFound(format!("no {} market data for {}", interval, ticker));

        let bars = if interval.is_intraday() {
            let raw = self.intraday.get(&(ticker_key, interval)).ok_or_else(no_data)?;
            standardize_bars(raw, INTRADAY_STAMP_WIDTH)?
        } else {
            standardize_price_frame(self.series.get(&ticker_key).ok_or_else(no_data)?)?
        };
        select_bars(ticker, &bars, start, end, interval)
    }
}

/// Range filter, weekly/monthly aggregation and the empty-result check shared by providers
fn select_bars(
    ticker: &str,
    bars: &DataFrame,
    start: NaiveDate,
    end: NaiveDate,
    interval: Interval,
) -> Result<DataFrame> {
    let filtered = filter_date_range(bars, start, end)?;
    let selected = match interval {
        Interval::Weekly | Interval::Monthly => resample(&filtered, interval)?,
        _ => filtered,
    };
    if selected.height() == 0 {
        return Err(ForecastError::NoDataFound(format!(
            "{} has no {} bars between {} and {}",
            ticker, interval, start, end
        )));
    }
    Ok(selected)
}

/// Keep rows whose day (first ten characters of the stamp) lies within `[start, end]`
pub fn filter_date_range(prices: &DataFrame, start: NaiveDate, end: NaiveDate) -> Result<DataFrame> {
    let day = col(DATE_COLUMN).str().slice(lit(0), lit(10u64));
    let start = start.format(DATE_FORMAT).to_string();
    let end = end.format(DATE_FORMAT).to_string();

    let filtered = prices
        .clone()
        .lazy()
        .filter(day.clone().gt_eq(lit(start)).and(day.lt_eq(lit(end))))
        .collect()?;
    Ok(filtered)
}

/// Aggregate daily bars into weekly (Monday) or monthly (first day) bars
///
/// The bar date is the start of its period.
pub fn resample(daily: &DataFrame, interval: Interval) -> Result<DataFrame> {
    let periods = daily
        .column(DATE_COLUMN)?
        .str()?
        .into_iter()
        .map(|stamp| {
            let stamp = stamp.unwrap_or_default();
            let day = NaiveDate::parse_from_str(stamp, DATE_FORMAT).map_err(|_| {
                ForecastError::invalid_parameter("date", format!("'{}' is not a daily date", stamp))
            })?;
            let start = match interval {
                Interval::Weekly => {
                    day.checked_sub_days(Days::new(day.weekday().num_days_from_monday() as u64))
                }
                Interval::Monthly => day.with_day(1),
                _ => Some(day),
            };
            start
                .map(|d| d.format(DATE_FORMAT).to_string())
                .ok_or_else(|| ForecastError::invalid_parameter("date", "period start out of range"))
        })
        .collect::<Result<Vec<String>>>()?;

    let mut with_period = daily.clone();
    with_period.with_column(Series::new("period".into(), periods))?;

    let bars = with_period
        .lazy()
        .group_by_stable([col("period")])
        .agg([
            col("open").first(),
            col("high").max(),
            col("low").min(),
            col("close").last(),
            col("adjusted_close").last(),
            col("volume").sum(),
        ])
        .select([
            col("period").alias(DATE_COLUMN),
            col("open"),
            col("high"),
            col("low"),
            col("close"),
            col("adjusted_close"),
            col("volume"),
        ])
        .collect()?;
    Ok(bars)
}
