// External crates
use log::debug;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::Path;

// Internal modules
use crate::constants::{DATE_COLUMN, PRICE_COLUMNS};
use crate::daily::step_1_indicator_engine::FeatureTable;
use crate::error::{ForecastError, Result};

/// Map a vendor column header onto the canonical lowercase price column
///
/// Matching is case-insensitive and accepts the usual abbreviations.
pub fn standard_column_name(column_name: &str) -> Option<&'static str> {
    let col_lower = column_name.trim().to_lowercase();
    let standard_name = match col_lower.as_str() {
        "open" | "o" | "op" | "openprice" | "open_price" => "open",
        "high" | "h" | "highprice" | "high_price" | "max" => "high",
        "low" | "l" | "lowprice" | "low_price" | "min" => "low",
        "close" | "c" | "cl" | "closeprice" | "close_price" => "close",
        "volume" | "vol" | "v" | "volumes" => "volume",
        "timestamp" | "time" | "date" | "t" | "datetime" | "dt" | "day" => DATE_COLUMN,
        "adj close" | "adj_close" | "adjusted close" | "adjusted_close" | "adjclose" | "adj" => {
            "adjusted_close"
        }
        _ => return None,
    };
    Some(standard_name)
}

/// Width of a `YYYY-MM-DD` stamp
pub const DAILY_STAMP_WIDTH: usize = 10;
/// Width of a `YYYY-MM-DD HH:MM:SS` stamp
pub const INTRADAY_STAMP_WIDTH: usize = 19;

/// Normalise a raw daily price frame into the canonical PriceSeries layout
///
/// Columns are renamed, numeric columns cast to Float64, `adjusted_close`
/// falls back to `close`, dates are cut to `YYYY-MM-DD`, rows are sorted by
/// date and duplicate dates keep their first occurrence.
pub fn standardize_price_frame(df: &DataFrame) -> Result<DataFrame> {
    standardize_bars(df, DAILY_STAMP_WIDTH)
}

/// [`standardize_price_frame`] for bars of any size, keeping the first
/// `stamp_width` characters of each timestamp
pub fn standardize_bars(df: &DataFrame, stamp_width: usize) -> Result<DataFrame> {
    let mut renamed: Vec<Column> = Vec::new();
    let mut seen = HashSet::new();
    for column in df.get_columns() {
        if let Some(standard) = standard_column_name(column.name()) {
            if seen.insert(standard) {
                renamed.push(column.clone().with_name(standard.into()));
            }
        }
    }
    let mut df = DataFrame::new(renamed)?;
    debug!("Price columns after renaming: {:?}", df.get_column_names());

    for required in PRICE_COLUMNS.iter().filter(|c| **c != "adjusted_close") {
        if !df.schema().contains(required) {
            return Err(ForecastError::invalid_parameter(
                "prices",
                format!("price data has no '{}' column", required),
            ));
        }
    }

    // Add the adjusted_close column if it doesn't exist (using close as a fallback)
    if !df.schema().contains("adjusted_close") {
        let close = df.column("close")?.clone();
        df.with_column(close.with_name("adjusted_close".into()))?;
    }

    let mut selection = vec![col(DATE_COLUMN)
        .cast(DataType::String)
        .str()
        .slice(lit(0), lit(stamp_width as u64))
        .alias(DATE_COLUMN)];
    selection.extend(
        PRICE_COLUMNS
            .iter()
            .filter(|c| **c != DATE_COLUMN)
            .map(|c| col(*c).cast(DataType::Float64)),
    );

    // maintain_order keeps the first occurrence of a duplicate date in front
    let sorted = df
        .lazy()
        .select(selection)
        .filter(col(DATE_COLUMN).neq(lit("")))
        .sort(
            [DATE_COLUMN],
            SortMultipleOptions::default().with_maintain_order(true),
        )
        .collect()?;
    let unique = sorted.unique_stable(
        Some(&[DATE_COLUMN.to_string()]),
        UniqueKeepStrategy::First,
        None,
    )?;
    Ok(unique.drop_nulls::<String>(None)?)
}

/// Read a CSV file into a DataFrame
///
/// # Arguments
///
/// * `file_path` - Path to the CSV file
///
/// # Returns
///
/// Returns a DataFrame containing the CSV data, or `MissingArtifact` when the
/// file does not exist
pub fn read_csv_file<P: AsRef<Path>>(file_path: P) -> Result<DataFrame> {
    let path = file_path.as_ref();
    if !path.exists() {
        return Err(ForecastError::MissingArtifact(path.to_path_buf()));
    }
    let file = File::open(path)?;
    Ok(CsvReader::new(file).finish()?)
}

/// Write a DataFrame as CSV with a header row, creating parent directories
pub fn write_csv_file<P: AsRef<Path>>(df: &mut DataFrame, file_path: P) -> Result<()> {
    let path = file_path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    Ok(())
}

/// Load a price CSV in any supported header style as a PriceSeries
pub fn read_price_series<P: AsRef<Path>>(file_path: P) -> Result<DataFrame> {
    let raw = read_csv_file(&file_path)?;
    let prices = standardize_price_frame(&raw)?;
    if prices.height() == 0 {
        return Err(ForecastError::NoDataFound(format!(
            "no price rows in {}",
            file_path.as_ref().display()
        )));
    }
    Ok(prices)
}

/// Load an indicator CSV written by the pipeline as a feature table
pub fn read_feature_table<P: AsRef<Path>>(file_path: P) -> Result<FeatureTable> {
    let df = read_csv_file(&file_path)?;
    if df.height() == 0 {
        return Err(ForecastError::NoDataFound(format!(
            "no indicator rows in {}",
            file_path.as_ref().display()
        )));
    }
    FeatureTable::from_dataframe(&df)
}

/// One persisted forecast point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub date: String,
    pub predicted_price: f64,
}

/// Persist predictions as a `date,predicted_price` table
pub fn write_predictions<P: AsRef<Path>>(records: &[PredictionRecord], file_path: P) -> Result<()> {
    let dates: Vec<String> = records.iter().map(|r| r.date.clone()).collect();
    let prices: Vec<f64> = records.iter().map(|r| r.predicted_price).collect();
    let mut df = DataFrame::new(vec![
        Series::new("date".into(), dates).into_column(),
        Series::new("predicted_price".into(), prices).into_column(),
    ])?;
    write_csv_file(&mut df, file_path)
}

/// Read a predictions table written by [`write_predictions`]
pub fn read_predictions<P: AsRef<Path>>(file_path: P) -> Result<Vec<PredictionRecord>> {
    let df = read_csv_file(file_path)?;
    let dates = df.column("date")?.cast(&DataType::String)?;
    let prices = df.column("predicted_price")?.cast(&DataType::Float64)?;

    let records = dates
        .str()?
        .into_iter()
        .zip(prices.f64()?.into_iter())
        .filter_map(|(date, price)| {
            Some(PredictionRecord {
                date: date?.to_string(),
                predicted_price: price?,
            })
        })
        .collect();
    Ok(records)
}
