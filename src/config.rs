use chrono::{Duration as Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::dataset::CanonicalDataset;
use crate::forecast::ModelStore;
use crate::monitor::DecayThresholds;
use crate::source::Location;
use crate::validation::SuiteStore;
use crate::{OrchestratorOptions, PipelineError, RetryPolicy};

/// Everything a run needs to know. Missing keys in a config file take the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dag_name: String,
    pub dataset_path: PathBuf,
    /// Fetched batches are written here before validation.
    pub staging_dir: PathBuf,
    pub expectations_dir: PathBuf,
    pub suite_name: String,
    pub reports_dir: PathBuf,
    pub model_dir: PathBuf,

    pub location: Location,
    pub provider_url: String,
    pub provider_timeout_secs: u64,
    pub provider_retries: u32,
    /// Explicit fetch window. Without it the window ends at the logical date
    /// and reaches back `history_days`.
    pub fetch_start: Option<NaiveDate>,
    pub fetch_end: Option<NaiveDate>,
    pub history_days: i64,

    /// Overrides the trained-until date of the current model. Without it the
    /// cutoff is that date itself, so right after a retrain the current slice
    /// holds only the last training day and scores in-sample.
    pub monitoring_cutoff: Option<NaiveDate>,
    pub thresholds: DecayThresholds,

    pub task_retries: u32,
    pub retry_delay_secs: u64,
    pub task_timeout_secs: u64,
    pub max_parallel: usize,

    pub slack_webhook_url: Option<String>,
    pub slack_channel: Option<String>,
    pub slack_username: String,
    pub notify_timeout_secs: u64,
    pub log_base: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dag_name: "weather_data_ingestion".to_string(),
            dataset_path: PathBuf::from("data/weather_data.csv"),
            staging_dir: PathBuf::from("data/staging"),
            expectations_dir: PathBuf::from("expectations"),
            suite_name: "weather_data_expectations".to_string(),
            reports_dir: PathBuf::from("reports"),
            model_dir: PathBuf::from("models"),
            location: Location::default(),
            provider_url: "https://archive-api.open-meteo.com/v1/archive".to_string(),
            provider_timeout_secs: 30,
            provider_retries: 5,
            fetch_start: None,
            fetch_end: None,
            history_days: 730,
            monitoring_cutoff: None,
            thresholds: DecayThresholds::default(),
            task_retries: 3,
            retry_delay_secs: 5,
            task_timeout_secs: 600,
            max_parallel: 4,
            slack_webhook_url: None,
            slack_channel: Some("#issues".to_string()),
            slack_username: "rainwatch-bot".to_string(),
            notify_timeout_secs: 10,
            log_base: "logs".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            PipelineError::Configuration(format!("cannot parse config file {}: {}", path.display(), e))
        })
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let bad = |msg: String| Err(PipelineError::Configuration(msg));

        if self.dag_name.trim().is_empty() {
            return bad("dag_name must not be empty".into());
        }
        if self.suite_name.trim().is_empty() {
            return bad("suite_name must not be empty".into());
        }
        for (name, path) in [
            ("dataset_path", &self.dataset_path),
            ("staging_dir", &self.staging_dir),
            ("expectations_dir", &self.expectations_dir),
            ("reports_dir", &self.reports_dir),
            ("model_dir", &self.model_dir),
        ] {
            if path.as_os_str().is_empty() {
                return bad(format!("{} must be set", name));
            }
        }

        let thresholds = [
            ("rmse", Some(self.thresholds.rmse)),
            ("mae", Some(self.thresholds.mae)),
            ("drift", self.thresholds.drift),
        ];
        for (name, value) in thresholds {
            match value {
                Some(v) if !v.is_finite() || v < 0.0 => {
                    return bad(format!("{} threshold must be a non-negative number, got {}", name, v));
                }
                _ => {}
            }
        }
        if matches!(self.thresholds.drift, Some(drift) if drift > 1.0) {
            return bad("drift threshold is a KS statistic in [0, 1]".into());
        }

        if !(-90.0..=90.0).contains(&self.location.latitude)
            || !(-180.0..=180.0).contains(&self.location.longitude)
        {
            return bad(format!(
                "location {} has invalid coordinates ({}, {})",
                self.location.name, self.location.latitude, self.location.longitude
            ));
        }
        if self.history_days <= 0 {
            return bad("history_days must be positive".into());
        }
        if let (Some(start), Some(end)) = (self.fetch_start, self.fetch_end) {
            if start > end {
                return bad(format!("fetch_start {} is after fetch_end {}", start, end));
            }
        }
        if self.max_parallel == 0 {
            return bad("max_parallel must be at least 1".into());
        }
        if self.task_timeout_secs == 0 {
            return bad("task_timeout_secs must be at least 1".into());
        }
        Ok(())
    }

    /// Inclusive date range fetched for a run at `logical_date`.
    pub fn fetch_range(&self, logical_date: NaiveDate) -> Result<(NaiveDate, NaiveDate), PipelineError> {
        let end = self.fetch_end.unwrap_or(logical_date);
        let start = self
            .fetch_start
            .unwrap_or_else(|| end - Days::days(self.history_days));
        if start > end {
            return Err(PipelineError::Configuration(format!(
                "fetch range is inverted: {} > {}",
                start, end
            )));
        }
        Ok((start, end))
    }

    pub fn task_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.task_retries + 1, Duration::from_secs(self.retry_delay_secs))
    }

    pub fn provider_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.provider_retries.max(1),
            Duration::from_millis(200),
            Duration::from_secs(10),
        )
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            default_timeout: Duration::from_secs(self.task_timeout_secs),
            notify_timeout: Duration::from_secs(self.notify_timeout_secs),
            max_parallel: self.max_parallel,
            log_base: self.log_base.clone(),
        }
    }

    pub fn dataset(&self) -> CanonicalDataset {
        CanonicalDataset::new(&self.dataset_path)
    }

    pub fn suite_store(&self) -> SuiteStore {
        SuiteStore::new(&self.expectations_dir)
    }

    pub fn model_store(&self) -> ModelStore {
        ModelStore::new(&self.model_dir)
    }

    /// Points every path at a subdirectory of `root`.
    pub fn rooted_at(mut self, root: &Path) -> Self {
        self.dataset_path = root.join("data").join("weather_data.csv");
        self.staging_dir = root.join("data").join("staging");
        self.expectations_dir = root.join("expectations");
        self.reports_dir = root.join("reports");
        self.model_dir = root.join("models");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rainwatch.json");
        std::fs::write(&path, r#"{ "suite_name": "custom", "thresholds": { "rmse": 0.5 } }"#).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.suite_name, "custom");
        assert_eq!(config.thresholds.rmse, 0.5);
        assert_eq!(config.thresholds.mae, 0.3);
        assert_eq!(config.task_retries, 3);
        config.validate().unwrap();
    }

    #[test]
    fn negative_threshold_is_rejected() {
        let mut config = PipelineConfig::default();
        config.thresholds.mae = -1.0;
        assert!(matches!(config.validate(), Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn unreadable_file_is_a_configuration_error() {
        let err = PipelineConfig::load(Path::new("/nonexistent/rainwatch.json")).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn fetch_range_defaults_to_history_window() {
        let config = PipelineConfig::default();
        let logical = NaiveDate::from_ymd_opt(2025, 5, 23).unwrap();
        let (start, end) = config.fetch_range(logical).unwrap();
        assert_eq!(end, logical);
        assert_eq!((end - start).num_days(), 730);
    }

    #[test]
    fn task_policy_counts_the_first_attempt() {
        let config = PipelineConfig::default();
        let policy = config.task_retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.interval, Duration::from_secs(5));
    }
}
