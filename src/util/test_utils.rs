// External imports
use chrono::{Duration, NaiveDate};
use polars::prelude::*;

// Internal imports
use crate::constants::DATE_FORMAT;

/// Generate a deterministic daily price frame
///
/// Close follows a slow upward trend with a small oscillation so that every
/// indicator has a non-degenerate range. Dates are consecutive calendar days
/// starting 2023-01-02.
pub fn linear_price_frame(num_rows: usize) -> DataFrame {
    let base_date = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let dates: Vec<String> = (0..num_rows)
        .map(|i| (base_date + Duration::days(i as i64)).format(DATE_FORMAT).to_string())
        .collect();

    let close: Vec<f64> = (0..num_rows)
        .map(|i| 100.0 + 0.5 * i as f64 + 2.0 * (i as f64 / 3.0).sin())
        .collect();
    let open: Vec<f64> = close.iter().map(|c| c - 0.2).collect();
    let high: Vec<f64> = close.iter().map(|c| c + 1.0).collect();
    let low: Vec<f64> = close.iter().map(|c| c - 1.0).collect();
    let volume: Vec<f64> = (0..num_rows)
        .map(|i| 1_000_000.0 + 1_000.0 * (i % 17) as f64)
        .collect();

    DataFrame::new(vec![
        Series::new("date".into(), dates).into_column(),
        Series::new("open".into(), open).into_column(),
        Series::new("high".into(), high).into_column(),
        Series::new("low".into(), low).into_column(),
        Series::new("close".into(), close.clone()).into_column(),
        Series::new("adjusted_close".into(), close).into_column(),
        Series::new("volume".into(), volume).into_column(),
    ])
    .unwrap()
}

/// Price frame whose close rises by exactly one per day from 100
pub fn linear_ramp_frame(num_rows: usize) -> DataFrame {
    let base_date = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let dates: Vec<String> = (0..num_rows)
        .map(|i| (base_date + Duration::days(i as i64)).format(DATE_FORMAT).to_string())
        .collect();
    let close: Vec<f64> = (0..num_rows).map(|i| 100.0 + i as f64).collect();

    DataFrame::new(vec![
        Series::new("date".into(), dates).into_column(),
        Series::new("open".into(), close.iter().map(|c| c - 0.5).collect::<Vec<f64>>()).into_column(),
        Series::new("high".into(), close.iter().map(|c| c + 1.0).collect::<Vec<f64>>()).into_column(),
        Series::new("low".into(), close.iter().map(|c| c - 1.0).collect::<Vec<f64>>()).into_column(),
        Series::new("close".into(), close.clone()).into_column(),
        Series::new("adjusted_close".into(), close).into_column(),
        Series::new("volume".into(), vec![1_000_000.0; num_rows]).into_column(),
    ])
    .unwrap()
}

/// Write a price frame the way a vendor export looks (capitalised headers)
pub fn write_vendor_csv(df: &DataFrame, path: &std::path::Path) {
    let mut renamed = df.clone();
    for (old, new) in [
        ("date", "Date"),
        ("open", "Open"),
        ("high", "High"),
        ("low", "Low"),
        ("close", "Close"),
        ("adjusted_close", "Adj Close"),
        ("volume", "Volume"),
    ] {
        renamed.rename(old, new.into()).unwrap();
    }
    let mut file = std::fs::File::create(path).unwrap();
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut renamed)
        .unwrap();
}
