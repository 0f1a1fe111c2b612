use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use crate::forecast::training_frame;
use crate::monitor::{self, DecayReport, DecayStatus};
use crate::pipeline::{
    CHECK_EXPECTATION_EXISTENCE, CREATE_EXPECTATION_SUITE, DATA_FETCHING, DATA_VALIDATION,
    DATA_VERSIONING, IS_MODEL_DECAY, MODEL_TRAINING, MONITOR_MODEL_DECAY, NOTIFY_MODEL_DECAY,
    SKIP_STEP, Services, UPDATE_DATASET, decay_branch, suite_branch, write_report,
};
use crate::validation::{ValidationResult, validate};
use crate::weather::{Table, read_records, write_records};
use crate::task::offload;
use crate::{Notification, PipelineError, RetryPolicy, Task, TaskContext, TaskOutcome, TriggerRule};

fn names(deps: &[&str]) -> Vec<String> {
    deps.iter().map(|d| d.to_string()).collect()
}

/// A task that does nothing but mark a point in the graph.
pub struct Marker {
    name: String,
    dependencies: Vec<String>,
}

impl Marker {
    pub fn new(name: &str, dependencies: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            dependencies: names(dependencies),
        }
    }
}

#[async_trait]
impl Task for Marker {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError> {
        info!(task = %self.name, run_id = %run.run_id, "reached");
        Ok(TaskOutcome::Completed)
    }
}

/// Scores the current model on the canonical dataset.
pub struct MonitorModelDecay {
    services: Arc<Services>,
}

impl MonitorModelDecay {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

fn assess_decay(services: &Services) -> Result<DecayReport, PipelineError> {
    let config = &services.config;
    let records = config.dataset().load()?;
    if records.is_empty() {
        warn!(path = %config.dataset_path.display(), "no canonical dataset yet, forcing a first training");
        return Ok(DecayReport::bootstrap());
    }

    let model = config.model_store().load()?;
    let cutoff = match (config.monitoring_cutoff, &model) {
        (Some(cutoff), _) => cutoff,
        (None, Some(model)) => model.trained_until,
        (None, None) => {
            return Err(PipelineError::Configuration(
                "no monitoring cutoff configured and no trained model to take it from".into(),
            ));
        }
    };
    monitor::assess(
        services.forecaster.as_ref(),
        model.as_ref(),
        &records,
        cutoff,
        config.thresholds,
    )
}

#[async_trait]
impl Task for MonitorModelDecay {
    fn name(&self) -> &str {
        MONITOR_MODEL_DECAY
    }

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(self.services.config.task_retry_policy())
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError> {
        let services = self.services.clone();
        let file_name = format!("decay_report_{}.json", run.run_id);
        let report = offload(MONITOR_MODEL_DECAY, move || {
            let report = assess_decay(&services)?;
            write_report(&services.config.reports_dir, &file_name, &report)?;
            Ok(report)
        })
        .await?;

        run.publish("decay_status", &report.status)?;
        run.publish("decay_report", &report)?;
        Ok(TaskOutcome::Completed)
    }
}

/// Branches on the decay status published by the monitoring task.
pub struct IsModelDecay;

#[async_trait]
impl Task for IsModelDecay {
    fn name(&self) -> &str {
        IS_MODEL_DECAY
    }

    fn dependencies(&self) -> Vec<String> {
        names(&[MONITOR_MODEL_DECAY])
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError> {
        let status: DecayStatus = run.pull_as(MONITOR_MODEL_DECAY, "decay_status").await?;
        match status {
            DecayStatus::Pass => info!("no model decay detected"),
            DecayStatus::Fail => warn!("model decay detected"),
        }
        Ok(TaskOutcome::Branch(decay_branch(status)))
    }
}

/// Tells the alert channel that retraining is about to start. A delivery
/// failure is logged and does not stop the retrain.
pub struct NotifyModelDecay {
    services: Arc<Services>,
}

impl NotifyModelDecay {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Task for NotifyModelDecay {
    fn name(&self) -> &str {
        NOTIFY_MODEL_DECAY
    }

    fn dependencies(&self) -> Vec<String> {
        names(&[IS_MODEL_DECAY])
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError> {
        let report: DecayReport = run.pull_as(MONITOR_MODEL_DECAY, "decay_report").await?;
        let mut message = Notification::new("Model Decay detected.")
            .field("Message", "Need attention! Instantiating retraining to mitigate it.")
            .field("Execution Date", Utc::now().to_rfc3339())
            .field("Dag Run", &run.run_id);
        for (metric, value) in &report.metrics {
            message = message.field(metric, format!("{:.4}", value));
        }

        let limit = std::time::Duration::from_secs(self.services.config.notify_timeout_secs);
        match tokio::time::timeout(limit, self.services.notifier.notify(&message)).await {
            Ok(Ok(())) => info!("decay alert sent"),
            Ok(Err(e)) => error!(error = %e, "decay alert could not be delivered"),
            Err(_) => error!("decay alert timed out"),
        }
        Ok(TaskOutcome::Completed)
    }
}

/// Pulls the configured date range from the provider into a staged CSV.
pub struct DataFetching {
    services: Arc<Services>,
}

impl DataFetching {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    fn staged_path(&self, start: NaiveDate, end: NaiveDate) -> PathBuf {
        let config = &self.services.config;
        let place = config.location.name.to_lowercase().replace(' ', "_");
        config
            .staging_dir
            .join(format!("{}_weather_data_{}-{}.csv", place, start, end))
    }
}

#[async_trait]
impl Task for DataFetching {
    fn name(&self) -> &str {
        DATA_FETCHING
    }

    fn dependencies(&self) -> Vec<String> {
        names(&[NOTIFY_MODEL_DECAY])
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(self.services.config.task_retry_policy())
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError> {
        let (start, end) = self.services.config.fetch_range(run.logical_date)?;
        let outcome = self.services.source.fetch(start, end).await?;
        if outcome.records.is_empty() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "provider returned no usable rows for {} to {} ({} dropped)",
                start, end, outcome.dropped_rows
            )));
        }

        let path = self.staged_path(start, end);
        let staging_dir = self.services.config.staging_dir.clone();
        let rows = outcome.records.len();
        let (target, records) = (path.clone(), outcome.records);
        offload(DATA_FETCHING, move || {
            std::fs::create_dir_all(&staging_dir)?;
            write_records(&target, &records)
        })
        .await?;
        info!(
            path = %path.display(),
            rows,
            dropped = outcome.dropped_rows,
            "batch staged"
        );

        run.publish("weather_filename", &path.display().to_string())?;
        run.publish("rows", &rows)?;
        run.publish("dropped_rows", &outcome.dropped_rows)?;
        Ok(TaskOutcome::Completed)
    }
}

/// Fingerprints the staged batch and writes a `.sha256` sidecar next to it.
pub struct DataVersioning {
    services: Arc<Services>,
}

impl DataVersioning {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Task for DataVersioning {
    fn name(&self) -> &str {
        DATA_VERSIONING
    }

    fn dependencies(&self) -> Vec<String> {
        names(&[DATA_FETCHING])
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(self.services.config.task_retry_policy())
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError> {
        let filename: String = run.pull_as(DATA_FETCHING, "weather_filename").await?;
        let path = PathBuf::from(&filename);
        let digest = offload(DATA_VERSIONING, move || {
            let bytes = std::fs::read(&path)?;
            let digest = hex::encode(Sha256::digest(&bytes));

            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut sidecar = path.into_os_string();
            sidecar.push(".sha256");
            std::fs::write(&sidecar, format!("{}  {}\n", digest, file_name))?;
            Ok(digest)
        })
        .await?;
        info!(file = %filename, version = %digest, "batch versioned");

        run.publish("data_version", &digest)?;
        Ok(TaskOutcome::Completed)
    }
}

pub struct CheckExpectationExistence {
    services: Arc<Services>,
}

impl CheckExpectationExistence {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Task for CheckExpectationExistence {
    fn name(&self) -> &str {
        CHECK_EXPECTATION_EXISTENCE
    }

    fn dependencies(&self) -> Vec<String> {
        names(&[DATA_VERSIONING])
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        _run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError> {
        let config = &self.services.config;
        let exists = config.suite_store().exists(&config.suite_name);
        Ok(TaskOutcome::Branch(suite_branch(exists)))
    }
}

pub struct CreateExpectationSuite {
    services: Arc<Services>,
}

impl CreateExpectationSuite {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Task for CreateExpectationSuite {
    fn name(&self) -> &str {
        CREATE_EXPECTATION_SUITE
    }

    fn dependencies(&self) -> Vec<String> {
        names(&[CHECK_EXPECTATION_EXISTENCE])
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError> {
        let config = &self.services.config;
        let (store, name) = (config.suite_store(), config.suite_name.clone());
        let suite = offload(CREATE_EXPECTATION_SUITE, move || store.ensure_suite(&name)).await?;
        run.publish("suite_version", &suite.version)?;
        Ok(TaskOutcome::Completed)
    }
}

/// Validates the staged batch. The full result lands in the reports
/// directory whether or not it passes.
pub struct DataValidation {
    services: Arc<Services>,
}

impl DataValidation {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Task for DataValidation {
    fn name(&self) -> &str {
        DATA_VALIDATION
    }

    fn dependencies(&self) -> Vec<String> {
        names(&[CREATE_EXPECTATION_SUITE, SKIP_STEP])
    }

    fn trigger_rule(&self) -> TriggerRule {
        TriggerRule::NoneFailedMinOneSuccess
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError> {
        let filename: String = run.pull_as(DATA_FETCHING, "weather_filename").await?;
        let services = self.services.clone();
        let file_name = format!("validation_{}.json", run.run_id);
        let (result, report) = offload(DATA_VALIDATION, move || {
            let config = &services.config;
            let table = Table::read_csv(&PathBuf::from(&filename))?;
            let suite = config.suite_store().get(&config.suite_name)?;

            let result: ValidationResult = validate(&table, &suite);
            let report = write_report(&config.reports_dir, &file_name, &result)?;
            Ok((result, report))
        })
        .await?;
        info!(
            report = %report.display(),
            success = result.success,
            rules = result.results.len(),
            "batch validated"
        );

        if !result.success {
            return Err(PipelineError::ValidationFailure(Box::new(result)));
        }
        run.publish("validation_result", &result)?;
        Ok(TaskOutcome::Completed)
    }
}

/// Merges the validated batch into the canonical dataset.
pub struct UpdateDataset {
    services: Arc<Services>,
}

impl UpdateDataset {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Task for UpdateDataset {
    fn name(&self) -> &str {
        UPDATE_DATASET
    }

    fn dependencies(&self) -> Vec<String> {
        names(&[DATA_VALIDATION])
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(self.services.config.task_retry_policy())
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError> {
        let filename: String = run.pull_as(DATA_FETCHING, "weather_filename").await?;
        let dataset = self.services.config.dataset();
        let summary = offload(UPDATE_DATASET, move || {
            let (records, dropped) = read_records(&PathBuf::from(&filename))?;
            if dropped > 0 {
                return Err(PipelineError::InvalidData(format!(
                    "validated batch {} has {} unreadable rows",
                    filename, dropped
                )));
            }

            if let Some(parent) = dataset.path().parent() {
                std::fs::create_dir_all(parent)?;
            }
            dataset.append(&records)
        })
        .await?;

        run.publish("appended_rows", &summary.appended)?;
        run.publish("skipped_duplicates", &summary.skipped_duplicates)?;
        Ok(TaskOutcome::Completed)
    }
}

/// Refits the model on the whole canonical dataset.
pub struct ModelTraining {
    services: Arc<Services>,
}

impl ModelTraining {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Task for ModelTraining {
    fn name(&self) -> &str {
        MODEL_TRAINING
    }

    fn dependencies(&self) -> Vec<String> {
        names(&[UPDATE_DATASET])
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(self.services.config.task_retry_policy())
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError> {
        let services = self.services.clone();
        let (model, path) = offload(MODEL_TRAINING, move || {
            let config = &services.config;
            let records = config.dataset().load()?;
            let (target, covariates) = training_frame(&records)?;
            let model = services.forecaster.fit(&target, &covariates)?;
            let path = config.model_store().save(&model)?;
            Ok((model, path))
        })
        .await?;
        info!(
            model = %model.model_name,
            rows = model.training_rows,
            trained_until = %model.trained_until,
            "model trained"
        );

        run.publish("model_path", &path.display().to_string())?;
        run.publish("trained_until", &model.trained_until)?;
        Ok(TaskOutcome::Completed)
    }
}
