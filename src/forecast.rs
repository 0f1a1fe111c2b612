//! Rainfall forecasting behind a narrow [`Forecaster`] seam.
//!
//! The production model is a smoothed day-of-year climatology. Whatever the
//! model, callers go through [`forecast_or_persist`], which falls back to a
//! persistence forecast instead of failing the pipeline.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use crate::PipelineError;
use crate::weather::{self, WeatherRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub index: Vec<NaiveDate>,
    pub values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(index: Vec<NaiveDate>, values: Vec<f64>) -> Result<Self, PipelineError> {
        if index.len() != values.len() {
            return Err(PipelineError::Prediction(format!(
                "index has {} entries but there are {} values",
                index.len(),
                values.len()
            )));
        }
        if index.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PipelineError::Prediction("index is not strictly increasing".into()));
        }
        Ok(Self { index, values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn last(&self) -> Option<(NaiveDate, f64)> {
        Some((*self.index.last()?, *self.values.last()?))
    }

    pub fn head(&self, n: usize) -> TimeSeries {
        let n = n.min(self.len());
        TimeSeries {
            index: self.index[..n].to_vec(),
            values: self.values[..n].to_vec(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, f64)> + '_ {
        self.index.iter().copied().zip(self.values.iter().copied())
    }
}

pub type Covariates = BTreeMap<String, TimeSeries>;

/// Covariates fed to the model alongside the rain target.
pub const PAST_COVARIATES: [&str; 4] = [
    weather::TEMPERATURE_MAX,
    weather::WIND_SPEED_MIN,
    weather::SURFACE_PRESSURE_MEAN,
    weather::PRECIPITATION_HOURS,
];

/// Day of year plus `order` sine/cosine pairs of the given period, computed
/// on the position in the index.
pub fn seasonal_features(index: &[NaiveDate], period: f64, order: usize) -> Covariates {
    let mut out = Covariates::new();
    let day_of_year: Vec<f64> = index.iter().map(|d| f64::from(d.ordinal())).collect();
    out.insert(
        "day_of_year".to_string(),
        TimeSeries {
            index: index.to_vec(),
            values: day_of_year,
        },
    );
    for k in 1..=order {
        let (mut sin, mut cos) = (Vec::with_capacity(index.len()), Vec::with_capacity(index.len()));
        for t in 0..index.len() {
            let angle = 2.0 * PI * (k as f64) * (t as f64) / period;
            sin.push(angle.sin());
            cos.push(angle.cos());
        }
        out.insert(format!("sin_{}_{}", period, k), TimeSeries { index: index.to_vec(), values: sin });
        out.insert(format!("cos_{}_{}", period, k), TimeSeries { index: index.to_vec(), values: cos });
    }
    out
}

/// Splits sorted records into the rain target and its past covariates.
pub fn training_frame(records: &[WeatherRecord]) -> Result<(TimeSeries, Covariates), PipelineError> {
    let index: Vec<NaiveDate> = records.iter().map(|r| r.date).collect();
    let target = TimeSeries::new(index.clone(), records.iter().map(|r| r.rain_sum).collect())?;

    let mut covariates = seasonal_features(&index, 365.25, 2);
    covariates.retain(|name, _| name == "day_of_year" || name.starts_with("cos_"));
    for column in PAST_COVARIATES {
        let values = records.iter().filter_map(|r| r.value(column)).collect();
        covariates.insert(column.to_string(), TimeSeries::new(index.clone(), values)?);
    }
    Ok((target, covariates))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_name: String,
    pub trained_at: DateTime<Utc>,
    /// Last date seen in training; monitoring compares predictions before
    /// and after it.
    pub trained_until: NaiveDate,
    pub training_rows: usize,
    pub params: serde_json::Value,
}

pub trait Forecaster: Send + Sync {
    fn name(&self) -> &str;

    fn fit(
        &self,
        series: &TimeSeries,
        past_covariates: &Covariates,
    ) -> Result<ModelArtifact, PipelineError>;

    /// Returns `horizon` values on the days following the last date of
    /// `series`.
    fn predict(
        &self,
        model: &ModelArtifact,
        series: &TimeSeries,
        past_covariates: &Covariates,
        horizon: usize,
    ) -> Result<TimeSeries, PipelineError>;
}

fn future_index(last: NaiveDate, horizon: usize) -> Vec<NaiveDate> {
    (1..=horizon as i64).map(|i| last + Duration::days(i)).collect()
}

/// Repeats the last observation for `horizon` days.
pub fn persistence_forecast(series: &TimeSeries, horizon: usize) -> Result<TimeSeries, PipelineError> {
    let (last_date, last_value) = series
        .last()
        .ok_or_else(|| PipelineError::EmptySlice("no observation to persist".into()))?;
    Ok(TimeSeries {
        index: future_index(last_date, horizon),
        values: vec![last_value; horizon],
    })
}

/// Predicts with `model` when there is one, and falls back to persistence
/// when there is none or prediction fails.
pub fn forecast_or_persist(
    forecaster: &dyn Forecaster,
    model: Option<&ModelArtifact>,
    series: &TimeSeries,
    past_covariates: &Covariates,
    horizon: usize,
) -> Result<TimeSeries, PipelineError> {
    let Some(model) = model else {
        warn!("no trained model available, using persistence forecast");
        return persistence_forecast(series, horizon);
    };
    match forecaster.predict(model, series, past_covariates, horizon) {
        Ok(forecast) => Ok(forecast),
        Err(PipelineError::Prediction(reason)) => {
            warn!(model = %model.model_name, %reason, "prediction failed, using persistence forecast");
            persistence_forecast(series, horizon)
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClimatologyParams {
    window: u32,
    mean: f64,
    profile: Vec<f64>,
}

/// Mean rain per day of year, smoothed over `window` days on each side.
#[derive(Debug, Clone)]
pub struct ClimatologyForecaster {
    pub window: u32,
}

impl Default for ClimatologyForecaster {
    fn default() -> Self {
        Self { window: 3 }
    }
}

fn check_covariates(series: &TimeSeries, past_covariates: &Covariates) -> Result<(), PipelineError> {
    for (name, covariate) in past_covariates {
        if covariate.len() < series.len() {
            return Err(PipelineError::Prediction(format!(
                "past covariate {} has {} values for a series of {}",
                name,
                covariate.len(),
                series.len()
            )));
        }
    }
    Ok(())
}

impl Forecaster for ClimatologyForecaster {
    fn name(&self) -> &str {
        "ClimatologyForecaster"
    }

    fn fit(
        &self,
        series: &TimeSeries,
        past_covariates: &Covariates,
    ) -> Result<ModelArtifact, PipelineError> {
        let (trained_until, _) = series
            .last()
            .ok_or_else(|| PipelineError::Prediction("cannot fit on an empty series".into()))?;
        check_covariates(series, past_covariates)?;

        let mean = series.values.iter().sum::<f64>() / series.len() as f64;
        let window = i64::from(self.window);
        let profile: Vec<f64> = (1..=366i64)
            .map(|doy| {
                let near: Vec<f64> = series
                    .iter()
                    .filter(|(date, _)| {
                        let d = (i64::from(date.ordinal()) - doy).abs();
                        d.min(366 - d) <= window
                    })
                    .map(|(_, v)| v)
                    .collect();
                if near.is_empty() {
                    mean
                } else {
                    near.iter().sum::<f64>() / near.len() as f64
                }
            })
            .collect();

        let params = ClimatologyParams {
            window: self.window,
            mean,
            profile,
        };
        Ok(ModelArtifact {
            model_name: self.name().to_string(),
            trained_at: Utc::now(),
            trained_until,
            training_rows: series.len(),
            params: serde_json::to_value(params)?,
        })
    }

    fn predict(
        &self,
        model: &ModelArtifact,
        series: &TimeSeries,
        past_covariates: &Covariates,
        horizon: usize,
    ) -> Result<TimeSeries, PipelineError> {
        let params: ClimatologyParams = serde_json::from_value(model.params.clone())
            .map_err(|e| PipelineError::Prediction(format!("unreadable model params: {}", e)))?;
        if params.profile.len() != 366 {
            return Err(PipelineError::Prediction("model profile must cover 366 days".into()));
        }
        let (last, _) = series
            .last()
            .ok_or_else(|| PipelineError::Prediction("cannot predict from an empty series".into()))?;
        check_covariates(series, past_covariates)?;

        let index = future_index(last, horizon);
        let values = index
            .iter()
            .map(|d| params.profile[d.ordinal0() as usize])
            .collect();
        Ok(TimeSeries { index, values })
    }
}

/// Stores the current model as `<dir>/model.json` and keeps a JSON-lines
/// log of every training run.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join("model.json")
    }

    pub fn save(&self, model: &ModelArtifact) -> Result<PathBuf, PipelineError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.model_path();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(model)?)?;
        std::fs::rename(&tmp, &path)?;

        let entry = json!({
            "model_name": model.model_name,
            "trained_at": model.trained_at,
            "trained_until": model.trained_until,
            "training_rows": model.training_rows,
        });
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("training_runs.jsonl"))?;
        writeln!(log, "{}", entry)?;

        info!(path = %path.display(), trained_until = %model.trained_until, "model saved");
        Ok(path)
    }

    pub fn load(&self) -> Result<Option<ModelArtifact>, PipelineError> {
        load_model(&self.model_path())
    }
}

fn load_model(path: &Path) -> Result<Option<ModelArtifact>, PipelineError> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedForecaster, synthetic_records};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn series(start: &str, values: &[f64]) -> TimeSeries {
        let start = date(start);
        let index = (0..values.len() as i64).map(|i| start + Duration::days(i)).collect();
        TimeSeries::new(index, values.to_vec()).unwrap()
    }

    #[test]
    fn persistence_repeats_last_value_on_following_days() {
        let s = series("2024-12-30", &[1.0, 4.5]);
        let forecast = persistence_forecast(&s, 3).unwrap();
        assert_eq!(forecast.values, vec![4.5, 4.5, 4.5]);
        assert_eq!(
            forecast.index,
            vec![date("2025-01-01"), date("2025-01-02"), date("2025-01-03")]
        );
    }

    #[test]
    fn failed_prediction_falls_back_to_persistence() {
        let s = series("2024-06-01", &[2.0, 0.0, 7.25]);
        let forecaster = ScriptedForecaster::failing("model file corrupt");
        let model = forecaster.fit(&s, &Covariates::new()).unwrap();
        let forecast = forecast_or_persist(&forecaster, Some(&model), &s, &Covariates::new(), 2).unwrap();
        assert_eq!(forecast.values, vec![7.25, 7.25]);
        assert_eq!(forecast.index, vec![date("2024-06-04"), date("2024-06-05")]);
    }

    #[test]
    fn climatology_extends_index_by_horizon() {
        let records = synthetic_records(date("2023-01-01"), 400);
        let (target, covariates) = training_frame(&records).unwrap();
        let forecaster = ClimatologyForecaster::default();
        let model = forecaster.fit(&target, &covariates).unwrap();
        assert_eq!(model.trained_until, records.last().unwrap().date);

        let forecast = forecaster.predict(&model, &target, &covariates, 7).unwrap();
        assert_eq!(forecast.len(), 7);
        assert_eq!(forecast.index[0], model.trained_until + Duration::days(1));
        assert!(forecast.values.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn short_covariates_are_a_prediction_error() {
        let s = series("2024-06-01", &[1.0, 2.0, 3.0]);
        let forecaster = ClimatologyForecaster::default();
        let model = forecaster.fit(&s, &Covariates::new()).unwrap();
        let mut covariates = Covariates::new();
        covariates.insert("x".into(), s.head(1));
        let err = forecaster.predict(&model, &s, &covariates, 2).unwrap_err();
        assert!(matches!(err, PipelineError::Prediction(_)));
    }

    #[test]
    fn training_frame_has_seasonal_and_weather_covariates() {
        let records = synthetic_records(date("2024-01-01"), 10);
        let (target, covariates) = training_frame(&records).unwrap();
        assert_eq!(target.len(), 10);
        assert!(covariates.contains_key("day_of_year"));
        assert!(covariates.contains_key("cos_365.25_1"));
        assert!(!covariates.contains_key("sin_365.25_1"));
        assert!(covariates.contains_key(weather::SURFACE_PRESSURE_MEAN));
    }

    #[test]
    fn model_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        assert!(store.load().unwrap().is_none());

        let s = series("2024-06-01", &[1.0, 2.0]);
        let model = ClimatologyForecaster::default().fit(&s, &Covariates::new()).unwrap();
        store.save(&model).unwrap();
        assert_eq!(store.load().unwrap(), Some(model));
        assert!(dir.path().join("training_runs.jsonl").is_file());
    }
}
