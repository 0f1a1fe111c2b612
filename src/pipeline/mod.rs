//! The weather ingestion graph.
//!
//! ```text
//! MonitorModelDecay -> IsModelDecay -> notify_model_decay -> DataFetching
//!   -> DataVersioning -> CheckExpectationExistence
//!   -> {CreateExpectationSuite | SkipStep} -> DataValidation
//!   -> UpdateDataset -> ModelTraining
//! IsModelDecay -> stop_pipeline
//! ```
//!
//! Tasks only talk to each other through `(task, key)` artifacts. Branch
//! predicates are plain functions so they can be tested without a run.

mod tasks;

pub use tasks::{
    CheckExpectationExistence, CreateExpectationSuite, DataFetching, DataValidation,
    DataVersioning, IsModelDecay, Marker, ModelTraining, MonitorModelDecay, NotifyModelDecay,
    UpdateDataset,
};

use chrono::NaiveDate;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use crate::forecast::{ClimatologyForecaster, Forecaster};
use crate::monitor::DecayStatus;
use crate::notify::{LogNotifier, SlackNotifier};
use crate::source::{DataSource, OpenMeteoSource};
use crate::{
    BoxTask, BranchDecision, Notifier, Orchestrator, PipelineConfig, PipelineError, RunResult,
};

pub const MONITOR_MODEL_DECAY: &str = "MonitorModelDecay";
pub const IS_MODEL_DECAY: &str = "IsModelDecay";
pub const NOTIFY_MODEL_DECAY: &str = "notify_model_decay";
pub const STOP_PIPELINE: &str = "stop_pipeline";
pub const DATA_FETCHING: &str = "DataFetching";
pub const DATA_VERSIONING: &str = "DataVersioning";
pub const CHECK_EXPECTATION_EXISTENCE: &str = "CheckExpectationExistence";
pub const CREATE_EXPECTATION_SUITE: &str = "CreateExpectationSuite";
pub const SKIP_STEP: &str = "SkipStep";
pub const DATA_VALIDATION: &str = "DataValidation";
pub const UPDATE_DATASET: &str = "UpdateDataset";
pub const MODEL_TRAINING: &str = "ModelTraining";

/// Collaborators shared by every task of the graph.
pub struct Services {
    pub config: PipelineConfig,
    pub source: Arc<dyn DataSource>,
    pub forecaster: Arc<dyn Forecaster>,
    pub notifier: Arc<dyn Notifier>,
}

impl Services {
    /// Open-Meteo, the climatology model and Slack when a webhook is set.
    /// Nothing here touches the network until a task runs.
    pub fn production(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let source = OpenMeteoSource::new(
            config.provider_url.clone(),
            config.location.clone(),
            Duration::from_secs(config.provider_timeout_secs),
            config.provider_retry_policy(),
        )?;
        let notifier: Arc<dyn Notifier> = match &config.slack_webhook_url {
            Some(url) => Arc::new(SlackNotifier::new(
                url.clone(),
                config.slack_channel.clone(),
                config.slack_username.clone(),
                Duration::from_secs(config.notify_timeout_secs),
            )?),
            None => Arc::new(LogNotifier),
        };

        Ok(Self {
            config,
            source: Arc::new(source),
            forecaster: Arc::new(ClimatologyForecaster::default()),
            notifier,
        })
    }
}

/// Decay sends the run down the alert and retrain path, no decay stops it.
pub fn decay_branch(status: DecayStatus) -> BranchDecision {
    match status {
        DecayStatus::Fail => BranchDecision::to(NOTIFY_MODEL_DECAY),
        DecayStatus::Pass => BranchDecision::to(STOP_PIPELINE),
    }
}

pub fn suite_branch(suite_exists: bool) -> BranchDecision {
    if suite_exists {
        BranchDecision::to(SKIP_STEP)
    } else {
        BranchDecision::to(CREATE_EXPECTATION_SUITE)
    }
}

pub fn build_tasks(services: Arc<Services>) -> Vec<BoxTask> {
    vec![
        Arc::new(MonitorModelDecay::new(services.clone())),
        Arc::new(IsModelDecay),
        Arc::new(NotifyModelDecay::new(services.clone())),
        Arc::new(Marker::new(STOP_PIPELINE, &[IS_MODEL_DECAY])),
        Arc::new(DataFetching::new(services.clone())),
        Arc::new(DataVersioning::new(services.clone())),
        Arc::new(CheckExpectationExistence::new(services.clone())),
        Arc::new(CreateExpectationSuite::new(services.clone())),
        Arc::new(Marker::new(SKIP_STEP, &[CHECK_EXPECTATION_EXISTENCE])),
        Arc::new(DataValidation::new(services.clone())),
        Arc::new(UpdateDataset::new(services.clone())),
        Arc::new(ModelTraining::new(services)),
    ]
}

pub fn build_orchestrator(services: Arc<Services>) -> Result<Orchestrator, PipelineError> {
    let dag_name = services.config.dag_name.clone();
    let options = services.config.orchestrator_options();
    let notifier = services.notifier.clone();
    Orchestrator::new(dag_name, build_tasks(services), notifier, options)
}

/// Runs the graph once and leaves a JSON summary of the run in the reports
/// directory.
pub async fn run_pipeline(
    services: Arc<Services>,
    ctx: CancellationToken,
    logical_date: NaiveDate,
) -> Result<RunResult, PipelineError> {
    let reports_dir = services.config.reports_dir.clone();
    let orchestrator = build_orchestrator(services)?;
    let result = orchestrator.run(ctx, logical_date).await?;

    let path = write_report(&reports_dir, &format!("run_{}.json", result.run_id), &result)?;
    info!(path = %path.display(), succeeded = result.succeeded(), "run summary written");
    Ok(result)
}

pub fn write_report<T: Serialize>(dir: &Path, file_name: &str, value: &T) -> Result<PathBuf, PipelineError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name);
    std::fs::write(&path, serde_json::to_string_pretty(value)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{RecordingNotifier, ScriptedForecaster, StaticSource};
    use crate::{OrchestratorOptions, TriggerRule};

    fn services() -> Arc<Services> {
        Arc::new(Services {
            config: PipelineConfig::default(),
            source: Arc::new(StaticSource::new(Vec::new())),
            forecaster: Arc::new(ScriptedForecaster::failing("unused")),
            notifier: Arc::new(RecordingNotifier::default()),
        })
    }

    #[test]
    fn decay_routes_to_notification_and_pass_stops() {
        assert_eq!(decay_branch(DecayStatus::Fail).selected, vec![NOTIFY_MODEL_DECAY]);
        assert_eq!(decay_branch(DecayStatus::Pass).selected, vec![STOP_PIPELINE]);
    }

    #[test]
    fn missing_suite_routes_to_creation() {
        assert_eq!(suite_branch(false).selected, vec![CREATE_EXPECTATION_SUITE]);
        assert_eq!(suite_branch(true).selected, vec![SKIP_STEP]);
    }

    #[test]
    fn graph_is_valid_and_validation_tolerates_a_skipped_branch() {
        let tasks = build_tasks(services());
        assert_eq!(tasks.len(), 12);
        let validation = tasks.iter().find(|t| t.name() == DATA_VALIDATION).unwrap();
        assert_eq!(validation.trigger_rule(), TriggerRule::NoneFailedMinOneSuccess);

        let orchestrator = Orchestrator::new(
            "weather_data_ingestion",
            tasks,
            Arc::new(RecordingNotifier::default()),
            OrchestratorOptions::default(),
        )
        .unwrap();
        let rendered = orchestrator.render_graph();
        assert!(rendered.starts_with(MONITOR_MODEL_DECAY));
        assert!(rendered.contains("└─> stop_pipeline"));
    }

    #[test]
    fn production_services_reject_invalid_config() {
        let mut config = PipelineConfig::default();
        config.max_parallel = 0;
        assert!(matches!(
            Services::production(config),
            Err(PipelineError::Configuration(_))
        ));
    }
}
