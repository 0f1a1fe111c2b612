//! Daily weather observations and a loosely typed table view of them.
//!
//! Column names follow the provider export, units included, so files written
//! here can be read by the dashboard unchanged.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use crate::PipelineError;

pub const DATE: &str = "date";
pub const TEMPERATURE_MAX: &str = "temperature_2m_max (°C)";
pub const TEMPERATURE_MIN: &str = "temperature_2m_min (°C)";
pub const RAIN_SUM: &str = "rain_sum (mm)";
pub const HUMIDITY_MAX: &str = "relative_humidity_2m_max (%)";
pub const HUMIDITY_MIN: &str = "relative_humidity_2m_min (%)";
pub const WIND_SPEED_MAX: &str = "wind_speed_10m_max (m/s)";
pub const WIND_SPEED_MIN: &str = "wind_speed_10m_min (m/s)";
pub const WIND_SPEED_MEAN: &str = "wind_speed_10m_mean (m/s)";
pub const HUMIDITY_MEAN: &str = "relative_humidity_2m_mean (%)";
pub const CLOUD_COVER_MEAN: &str = "cloudcover_mean (%)";
pub const SURFACE_PRESSURE_MEAN: &str = "surface_pressure_mean (hPa)";
pub const PRECIPITATION_HOURS: &str = "precipitation_hours";

/// Numeric columns in file order.
pub const NUMERIC_COLUMNS: [&str; 12] = [
    TEMPERATURE_MAX,
    TEMPERATURE_MIN,
    RAIN_SUM,
    HUMIDITY_MAX,
    HUMIDITY_MIN,
    WIND_SPEED_MAX,
    WIND_SPEED_MIN,
    WIND_SPEED_MEAN,
    HUMIDITY_MEAN,
    CLOUD_COVER_MEAN,
    SURFACE_PRESSURE_MEAN,
    PRECIPITATION_HOURS,
];

pub fn all_columns() -> Vec<String> {
    std::iter::once(DATE)
        .chain(NUMERIC_COLUMNS)
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    #[serde(rename = "date")]
    pub date: NaiveDate,
    #[serde(rename = "temperature_2m_max (°C)")]
    pub temperature_max: f64,
    #[serde(rename = "temperature_2m_min (°C)")]
    pub temperature_min: f64,
    #[serde(rename = "rain_sum (mm)")]
    pub rain_sum: f64,
    #[serde(rename = "relative_humidity_2m_max (%)")]
    pub humidity_max: f64,
    #[serde(rename = "relative_humidity_2m_min (%)")]
    pub humidity_min: f64,
    #[serde(rename = "wind_speed_10m_max (m/s)")]
    pub wind_speed_max: f64,
    #[serde(rename = "wind_speed_10m_min (m/s)")]
    pub wind_speed_min: f64,
    #[serde(rename = "wind_speed_10m_mean (m/s)")]
    pub wind_speed_mean: f64,
    #[serde(rename = "relative_humidity_2m_mean (%)")]
    pub humidity_mean: f64,
    #[serde(rename = "cloudcover_mean (%)")]
    pub cloud_cover_mean: f64,
    #[serde(rename = "surface_pressure_mean (hPa)")]
    pub surface_pressure_mean: f64,
    #[serde(rename = "precipitation_hours")]
    pub precipitation_hours: f64,
}

impl WeatherRecord {
    pub fn values(&self) -> [f64; 12] {
        [
            self.temperature_max,
            self.temperature_min,
            self.rain_sum,
            self.humidity_max,
            self.humidity_min,
            self.wind_speed_max,
            self.wind_speed_min,
            self.wind_speed_mean,
            self.humidity_mean,
            self.cloud_cover_mean,
            self.surface_pressure_mean,
            self.precipitation_hours,
        ]
    }

    pub fn value(&self, column: &str) -> Option<f64> {
        NUMERIC_COLUMNS
            .iter()
            .position(|c| *c == column)
            .map(|i| self.values()[i])
    }

    /// Builds a record from values in [`NUMERIC_COLUMNS`] order.
    pub fn from_values(date: NaiveDate, v: [f64; 12]) -> Self {
        Self {
            date,
            temperature_max: v[0],
            temperature_min: v[1],
            rain_sum: v[2],
            humidity_max: v[3],
            humidity_min: v[4],
            wind_speed_max: v[5],
            wind_speed_min: v[6],
            wind_speed_mean: v[7],
            humidity_mean: v[8],
            cloud_cover_mean: v[9],
            surface_pressure_mean: v[10],
            precipitation_hours: v[11],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl Cell {
    /// Infers the most specific type for a raw CSV field.
    pub fn parse(raw: &str) -> Cell {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("nan") || raw.eq_ignore_ascii_case("null") {
            return Cell::Null;
        }
        if let Some(date) = parse_date(raw) {
            return Cell::Date(date);
        }
        match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => Cell::Number(n),
            _ => Cell::Text(raw.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Cell::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Cell::Null => "null",
            Cell::Number(_) => "number",
            Cell::Date(_) => "date",
            Cell::Text(_) => "text",
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => f.write_str("null"),
            Cell::Number(n) => write!(f, "{}", n),
            Cell::Date(d) => write!(f, "{}", d),
            Cell::Text(t) => f.write_str(t),
        }
    }
}

/// Accepts plain dates as well as the timestamped form pandas writes for a
/// UTC date index (`2024-01-01 00:00:00+00:00`).
fn parse_date(raw: &str) -> Option<NaiveDate> {
    if raw.len() < 10 {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%:z") {
        return Some(ts.date_naive());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|ts| ts.date())
}

static NULL_CELL: Cell = Cell::Null;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column<'a>(&'a self, name: &str) -> Option<impl Iterator<Item = &'a Cell> + use<'a>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| row.get(idx).unwrap_or(&NULL_CELL)))
    }

    pub fn read_csv(path: &Path) -> Result<Self, PipelineError> {
        Self::from_reader(File::open(path)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, PipelineError> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let columns: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let mut table = Table::new(columns);
        for record in reader.records() {
            let record = record?;
            let mut row: Vec<Cell> = record.iter().map(Cell::parse).collect();
            row.resize(table.columns.len(), Cell::Null);
            table.rows.push(row);
        }
        Ok(table)
    }

    pub fn from_records(records: &[WeatherRecord]) -> Self {
        let mut table = Table::new(all_columns());
        for record in records {
            let mut row = Vec::with_capacity(13);
            row.push(Cell::Date(record.date));
            row.extend(record.values().into_iter().map(Cell::Number));
            table.rows.push(row);
        }
        table
    }

    /// Converts rows into records. Rows with a missing or mistyped field are
    /// dropped; the second value is how many.
    pub fn to_records(&self) -> Result<(Vec<WeatherRecord>, usize), PipelineError> {
        let mut indices = Vec::with_capacity(13);
        for column in all_columns() {
            let idx = self.column_index(&column).ok_or_else(|| {
                PipelineError::Configuration(format!("table has no column {}", column))
            })?;
            indices.push(idx);
        }

        let mut records = Vec::with_capacity(self.rows.len());
        let mut dropped = 0;
        'rows: for row in &self.rows {
            let Some(date) = row.get(indices[0]).and_then(Cell::as_date) else {
                dropped += 1;
                continue;
            };
            let mut values = [0.0; 12];
            for (slot, idx) in values.iter_mut().zip(&indices[1..]) {
                match row.get(*idx).and_then(Cell::as_number) {
                    Some(v) => *slot = v,
                    None => {
                        dropped += 1;
                        continue 'rows;
                    }
                }
            }
            records.push(WeatherRecord::from_values(date, values));
        }
        Ok((records, dropped))
    }
}

pub fn read_records(path: &Path) -> Result<(Vec<WeatherRecord>, usize), PipelineError> {
    Table::read_csv(path)?.to_records()
}

pub fn write_records(path: &Path, records: &[WeatherRecord]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}
