//! Model decay detection.
//!
//! The canonical dataset is replayed through the current model, the
//! resulting (actual, predicted) pairs are split at a cutoff date, and error
//! metrics on the recent slice are compared against fixed thresholds.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;
use crate::PipelineError;
use crate::forecast::{Forecaster, ModelArtifact, forecast_or_persist, training_frame};
use crate::weather::{NUMERIC_COLUMNS, WeatherRecord};

/// Days of history handed to the model before its first prediction.
pub const WARM_UP_DAYS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub actual: f64,
    pub predicted: f64,
    pub features: BTreeMap<String, f64>,
}

/// Splits date-sorted observations into `before` (< cutoff) and `after`
/// (>= cutoff).
pub fn split_at_cutoff(observations: &[Observation], cutoff: NaiveDate) -> (&[Observation], &[Observation]) {
    let at = observations.partition_point(|o| o.date < cutoff);
    observations.split_at(at)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayThresholds {
    pub rmse: f64,
    pub mae: f64,
    /// When set, a feature whose KS statistic exceeds it also counts as
    /// decay.
    pub drift: Option<f64>,
}

impl Default for DecayThresholds {
    fn default() -> Self {
        Self {
            rmse: 0.3,
            mae: 0.3,
            drift: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecayStatus {
    Pass,
    Fail,
}

impl fmt::Display for DecayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecayStatus::Pass => write!(f, "PASS"),
            DecayStatus::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayReport {
    pub reference_rows: usize,
    pub current_rows: usize,
    /// `rmse` and `mae` on the current slice, `reference_*` on the other.
    pub metrics: BTreeMap<String, f64>,
    /// Pass/fail per thresholded metric.
    pub checks: BTreeMap<String, bool>,
    /// KS statistic per numeric feature.
    pub drift: BTreeMap<String, f64>,
    pub status: DecayStatus,
}

impl DecayReport {
    /// Report for a first run with no dataset to score. It fails so that the
    /// pipeline fetches data and trains an initial model.
    pub fn bootstrap() -> Self {
        Self {
            reference_rows: 0,
            current_rows: 0,
            metrics: BTreeMap::new(),
            checks: BTreeMap::from([("history_available".to_string(), false)]),
            drift: BTreeMap::new(),
            status: DecayStatus::Fail,
        }
    }

    pub fn is_decayed(&self) -> bool {
        self.status == DecayStatus::Fail
    }
}

#[derive(Debug, Clone, Default)]
pub struct DriftMonitor {
    thresholds: DecayThresholds,
}

impl DriftMonitor {
    pub fn new(thresholds: DecayThresholds) -> Self {
        Self { thresholds }
    }

    pub fn check(
        &self,
        reference: &[Observation],
        current: &[Observation],
    ) -> Result<DecayReport, PipelineError> {
        if reference.is_empty() {
            return Err(PipelineError::EmptySlice("reference slice has no observations".into()));
        }
        if current.is_empty() {
            return Err(PipelineError::EmptySlice("current slice has no observations".into()));
        }

        let (rmse, mae) = errors(current);
        let (reference_rmse, reference_mae) = errors(reference);
        let metrics = BTreeMap::from([
            ("rmse".to_string(), rmse),
            ("mae".to_string(), mae),
            ("reference_rmse".to_string(), reference_rmse),
            ("reference_mae".to_string(), reference_mae),
        ]);

        let mut drift = BTreeMap::new();
        for feature in reference.iter().flat_map(|o| o.features.keys()) {
            if drift.contains_key(feature) {
                continue;
            }
            let sample = |slice: &[Observation]| -> Vec<f64> {
                slice.iter().filter_map(|o| o.features.get(feature).copied()).collect()
            };
            let (a, b) = (sample(reference), sample(current));
            if !a.is_empty() && !b.is_empty() {
                drift.insert(feature.clone(), ks_statistic(&a, &b));
            }
        }

        let mut checks = BTreeMap::from([
            ("rmse".to_string(), rmse <= self.thresholds.rmse),
            ("mae".to_string(), mae <= self.thresholds.mae),
        ]);
        if let Some(limit) = self.thresholds.drift {
            let worst = drift.values().copied().fold(0.0, f64::max);
            checks.insert("max_drift".to_string(), worst <= limit);
        }

        let status = if checks.values().all(|passed| *passed) {
            DecayStatus::Pass
        } else {
            DecayStatus::Fail
        };
        info!(
            %status, rmse, mae, reference_rmse, reference_mae,
            current_rows = current.len(),
            "decay check finished"
        );
        Ok(DecayReport {
            reference_rows: reference.len(),
            current_rows: current.len(),
            metrics,
            checks,
            drift,
            status,
        })
    }
}

fn errors(slice: &[Observation]) -> (f64, f64) {
    let n = slice.len() as f64;
    let squared: f64 = slice.iter().map(|o| (o.predicted - o.actual).powi(2)).sum();
    let absolute: f64 = slice.iter().map(|o| (o.predicted - o.actual).abs()).sum();
    ((squared / n).sqrt(), absolute / n)
}

/// Two-sample Kolmogorov-Smirnov statistic: the largest gap between the
/// empirical CDFs of `a` and `b`.
pub fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);

    let (na, nb) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j, mut gap) = (0, 0, 0.0f64);
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        gap = gap.max((i as f64 / na - j as f64 / nb).abs());
    }
    gap
}

/// Replays `records` through the model: the first [`WARM_UP_DAYS`] days
/// seed one multi-step forecast covering the rest of the dataset.
pub fn backtest(
    forecaster: &dyn Forecaster,
    model: Option<&ModelArtifact>,
    records: &[WeatherRecord],
) -> Result<Vec<Observation>, PipelineError> {
    if records.len() <= WARM_UP_DAYS {
        return Err(PipelineError::EmptySlice(format!(
            "{} records do not cover the {} day warm-up",
            records.len(),
            WARM_UP_DAYS
        )));
    }
    let (target, covariates) = training_frame(records)?;
    let history = target.head(WARM_UP_DAYS);
    let (seed_date, _) = history
        .last()
        .ok_or_else(|| PipelineError::EmptySlice("empty warm-up window".into()))?;
    let last_date = records[records.len() - 1].date;
    let horizon = (last_date - seed_date).num_days().max(0) as usize;

    let forecast = forecast_or_persist(forecaster, model, &history, &covariates, horizon)?;
    let predicted: BTreeMap<NaiveDate, f64> = forecast.iter().collect();

    Ok(records[WARM_UP_DAYS..]
        .iter()
        .filter_map(|record| {
            let value = *predicted.get(&record.date)?;
            Some(Observation {
                date: record.date,
                actual: record.rain_sum,
                predicted: value,
                features: NUMERIC_COLUMNS
                    .iter()
                    .zip(record.values())
                    .map(|(name, v)| (name.to_string(), v))
                    .collect(),
            })
        })
        .collect())
}

/// Backtest, split at `cutoff`, then check. Used by the monitoring task.
pub fn assess(
    forecaster: &dyn Forecaster,
    model: Option<&ModelArtifact>,
    records: &[WeatherRecord],
    cutoff: NaiveDate,
    thresholds: DecayThresholds,
) -> Result<DecayReport, PipelineError> {
    let observations = backtest(forecaster, model, records)?;
    let (before, after) = split_at_cutoff(&observations, cutoff);
    if before.is_empty() || after.is_empty() {
        return Err(PipelineError::EmptySlice(format!(
            "cutoff {} leaves {} observations before and {} after",
            cutoff,
            before.len(),
            after.len()
        )));
    }
    DriftMonitor::new(thresholds).check(before, after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedForecaster, synthetic_records};
    use chrono::Duration;

    fn observations(start: NaiveDate, errors: &[f64]) -> Vec<Observation> {
        errors
            .iter()
            .enumerate()
            .map(|(i, e)| Observation {
                date: start + Duration::days(i as i64),
                actual: 1.0,
                predicted: 1.0 + e,
                features: BTreeMap::from([("x".to_string(), i as f64)]),
            })
            .collect()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn current_error_above_threshold_is_decay() {
        let reference = observations(day(2025, 1, 1), &[0.2; 10]);
        let current = observations(day(2025, 2, 1), &[0.35; 10]);
        let report = DriftMonitor::default().check(&reference, &current).unwrap();

        assert!((report.metrics["reference_rmse"] - 0.2).abs() < 1e-9);
        assert!((report.metrics["rmse"] - 0.35).abs() < 1e-9);
        assert!(!report.checks["rmse"]);
        assert_eq!(report.status, DecayStatus::Fail);
        assert!(report.is_decayed());
    }

    #[test]
    fn small_errors_pass() {
        let reference = observations(day(2025, 1, 1), &[0.1; 5]);
        let current = observations(day(2025, 2, 1), &[-0.1, 0.1, 0.0]);
        let report = DriftMonitor::default().check(&reference, &current).unwrap();
        assert_eq!(report.status, DecayStatus::Pass);
        assert!(report.drift.contains_key("x"));
    }

    #[test]
    fn empty_slice_is_an_error() {
        let reference = observations(day(2025, 1, 1), &[0.1; 5]);
        let err = DriftMonitor::default().check(&reference, &[]).unwrap_err();
        assert!(matches!(err, PipelineError::EmptySlice(_)));
    }

    #[test]
    fn drift_threshold_can_fail_on_its_own() {
        let reference = observations(day(2025, 1, 1), &[0.0; 5]);
        let mut current = observations(day(2025, 2, 1), &[0.0; 5]);
        for o in &mut current {
            o.features.insert("x".into(), 100.0);
        }
        let thresholds = DecayThresholds {
            drift: Some(0.5),
            ..DecayThresholds::default()
        };
        let report = DriftMonitor::new(thresholds).check(&reference, &current).unwrap();
        assert_eq!(report.drift["x"], 1.0);
        assert!(!report.checks["max_drift"]);
        assert_eq!(report.status, DecayStatus::Fail);
    }

    #[test]
    fn split_is_exclusive_before_inclusive_after() {
        let obs = observations(day(2025, 1, 1), &[0.0; 4]);
        let (before, after) = split_at_cutoff(&obs, day(2025, 1, 3));
        assert_eq!(before.len(), 2);
        assert_eq!(after[0].date, day(2025, 1, 3));
    }

    #[test]
    fn ks_statistic_of_identical_samples_is_zero() {
        assert_eq!(ks_statistic(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]), 0.0);
        assert_eq!(ks_statistic(&[1.0, 2.0], &[5.0, 6.0]), 1.0);
    }

    #[test]
    fn backtest_without_model_uses_persistence() {
        let records = synthetic_records(day(2025, 1, 1), 20);
        let forecaster = ScriptedForecaster::failing("unused");
        let observations = backtest(&forecaster, None, &records).unwrap();

        assert_eq!(observations.len(), 20 - WARM_UP_DAYS);
        assert_eq!(observations[0].date, records[WARM_UP_DAYS].date);
        let seed = records[WARM_UP_DAYS - 1].rain_sum;
        assert!(observations.iter().all(|o| o.predicted == seed));
    }

    #[test]
    fn cutoff_outside_data_is_empty_slice() {
        let records = synthetic_records(day(2025, 1, 1), 20);
        let forecaster = ScriptedForecaster::offset_from(&records, |_| 0.0);
        let err = assess(&forecaster, None, &records, day(2030, 1, 1), DecayThresholds::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptySlice(_)));
    }

    #[test]
    fn scripted_offsets_drive_the_decay_status() {
        let records = synthetic_records(day(2025, 1, 1), 40);
        let cutoff = day(2025, 1, 25);
        let forecaster = ScriptedForecaster::offset_from(&records, |d| if d < cutoff { 0.2 } else { 0.35 });
        let model = forecaster
            .fit(&crate::forecast::training_frame(&records).unwrap().0, &Default::default())
            .unwrap();
        let report = assess(&forecaster, Some(&model), &records, cutoff, DecayThresholds::default()).unwrap();
        assert!(report.is_decayed());
        assert!((report.metrics["reference_rmse"] - 0.2).abs() < 1e-9);
    }
}
