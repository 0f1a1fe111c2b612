use chrono::NaiveDate;
use rainwatch::forecast::{Covariates, Forecaster, training_frame};
use rainwatch::mock::{RecordingNotifier, ScriptedForecaster, StaticSource, synthetic_records};
use rainwatch::pipeline::{self, Services};
use rainwatch::weather::WeatherRecord;
use rainwatch::{PipelineConfig, RunResult, TaskStatus};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default().rooted_at(root);
    config.task_retries = 1;
    config.retry_delay_secs = 0;
    config
}

/// Sixty days of history starting 2025-01-01, already in the canonical
/// dataset.
fn seed_history(config: &PipelineConfig) -> Vec<WeatherRecord> {
    let history = synthetic_records(day(2025, 1, 1), 60);
    std::fs::create_dir_all(config.dataset_path.parent().unwrap()).unwrap();
    config.dataset().append(&history).unwrap();
    history
}

/// Saves a model whose trained-until date is the last of `records`.
fn seed_model(config: &PipelineConfig, forecaster: &ScriptedForecaster, records: &[WeatherRecord]) {
    let (target, _) = training_frame(records).unwrap();
    let model = forecaster.fit(&target, &Covariates::new()).unwrap();
    config.model_store().save(&model).unwrap();
}

fn decaying_forecaster(history: &[WeatherRecord], cutoff: NaiveDate) -> ScriptedForecaster {
    ScriptedForecaster::offset_from(history, move |d| if d < cutoff { 0.2 } else { 0.35 })
}

async fn run(
    config: PipelineConfig,
    source: StaticSource,
    forecaster: ScriptedForecaster,
    notifier: Arc<RecordingNotifier>,
) -> RunResult {
    let services = Arc::new(Services {
        config,
        source: Arc::new(source),
        forecaster: Arc::new(forecaster),
        notifier,
    });
    pipeline::run_pipeline(services, CancellationToken::new(), day(2025, 4, 1))
        .await
        .unwrap()
}

fn titles(notifier: &RecordingNotifier, title: &str) -> usize {
    notifier.messages().iter().filter(|m| m.title == title).count()
}

fn reports_starting_with(dir: &Path, prefix: &str) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix))
        })
        .collect()
}

#[tokio::test]
async fn no_decay_stops_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let history = seed_history(&config);
    let forecaster = ScriptedForecaster::offset_from(&history, |_| 0.0);
    seed_model(&config, &forecaster, &history[..31]);
    let fits = forecaster.fits();

    let source = StaticSource::new(Vec::new());
    let fetches = source.calls();
    let notifier = Arc::new(RecordingNotifier::default());
    let reports_dir = config.reports_dir.clone();
    let result = run(config, source, forecaster, notifier.clone()).await;

    assert!(result.succeeded());
    assert_eq!(result.artifact("MonitorModelDecay", "decay_status"), Some(&json!("PASS")));
    assert_eq!(result.status("stop_pipeline"), Some(TaskStatus::Success));
    for skipped in ["notify_model_decay", "DataFetching", "DataValidation", "ModelTraining"] {
        assert_eq!(result.status(skipped), Some(TaskStatus::Skipped), "{}", skipped);
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
    assert_eq!(fits.load(Ordering::SeqCst), 1);
    assert!(notifier.messages().is_empty());
    assert_eq!(reports_starting_with(&reports_dir, "decay_report_").len(), 1);
    assert_eq!(reports_starting_with(&reports_dir, "run_").len(), 1);
}

#[tokio::test]
async fn decay_fetches_validates_and_retrains() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    let cutoff = day(2025, 2, 1);
    config.monitoring_cutoff = Some(cutoff);
    let history = seed_history(&config);
    let forecaster = decaying_forecaster(&history, cutoff);
    seed_model(&config, &forecaster, &history);
    let fits = forecaster.fits();

    let source = StaticSource::new(synthetic_records(day(2025, 3, 2), 30))
        .with_dropped_rows(2)
        .failing_times(1);
    let fetches = source.calls();
    let notifier = Arc::new(RecordingNotifier::default());
    let dataset = config.dataset();
    let model_store = config.model_store();
    let result = run(config, source, forecaster, notifier.clone()).await;

    assert!(result.succeeded(), "{:?}", result.failures);
    assert_eq!(result.artifact("MonitorModelDecay", "decay_status"), Some(&json!("FAIL")));
    assert_eq!(result.status("stop_pipeline"), Some(TaskStatus::Skipped));
    assert_eq!(result.status("CreateExpectationSuite"), Some(TaskStatus::Success));
    assert_eq!(result.status("SkipStep"), Some(TaskStatus::Skipped));
    assert_eq!(result.status("DataValidation"), Some(TaskStatus::Success));
    assert_eq!(result.status("ModelTraining"), Some(TaskStatus::Success));

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(result.artifact("DataFetching", "rows"), Some(&json!(30)));
    assert_eq!(result.artifact("DataFetching", "dropped_rows"), Some(&json!(2)));
    assert_eq!(result.artifact("UpdateDataset", "appended_rows"), Some(&json!(30)));
    assert_eq!(result.artifact("ModelTraining", "trained_until"), Some(&json!("2025-03-31")));
    let version = result.artifact("DataVersioning", "data_version").unwrap();
    assert_eq!(version.as_str().unwrap().len(), 64);

    assert_eq!(dataset.load().unwrap().len(), 90);
    assert_eq!(fits.load(Ordering::SeqCst), 2);
    assert_eq!(model_store.load().unwrap().unwrap().trained_until, day(2025, 3, 31));

    assert_eq!(titles(&notifier, "Model Decay detected."), 1);
    assert_eq!(titles(&notifier, "Task Failed."), 0);
}

#[tokio::test]
async fn duplicated_date_fails_validation_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    let cutoff = day(2025, 2, 1);
    config.monitoring_cutoff = Some(cutoff);
    let history = seed_history(&config);
    let forecaster = decaying_forecaster(&history, cutoff);
    seed_model(&config, &forecaster, &history);
    let fits = forecaster.fits();

    let mut batch = synthetic_records(day(2025, 3, 2), 29);
    batch.push(batch[5].clone());
    assert_eq!(batch.len(), 30);

    let notifier = Arc::new(RecordingNotifier::default());
    let dataset = config.dataset();
    let reports_dir = config.reports_dir.clone();
    let result = run(config, StaticSource::new(batch), forecaster, notifier.clone()).await;

    assert!(!result.succeeded());
    assert_eq!(result.status("DataValidation"), Some(TaskStatus::Failed));
    assert!(result.failures["DataValidation"].contains("date unique"));
    assert_eq!(result.status("UpdateDataset"), Some(TaskStatus::UpstreamFailed));
    assert_eq!(result.status("ModelTraining"), Some(TaskStatus::UpstreamFailed));
    assert!(!result.execution_order.iter().any(|t| t == "ModelTraining"));
    assert_eq!(fits.load(Ordering::SeqCst), 1);
    assert_eq!(dataset.load().unwrap().len(), 60);

    assert_eq!(titles(&notifier, "Task Failed."), 1);
    assert!(result.notified);

    let reports = reports_starting_with(&reports_dir, "validation_");
    assert_eq!(reports.len(), 1);
    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&reports[0]).unwrap()).unwrap();
    assert_eq!(saved["success"], json!(false));
}

#[tokio::test]
async fn existing_suite_takes_the_skip_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    let cutoff = day(2025, 2, 1);
    config.monitoring_cutoff = Some(cutoff);
    config.suite_store().ensure_suite(&config.suite_name).unwrap();
    let history = seed_history(&config);
    let forecaster = decaying_forecaster(&history, cutoff);
    seed_model(&config, &forecaster, &history);

    let source = StaticSource::new(synthetic_records(day(2025, 3, 2), 10));
    let result = run(config, source, forecaster, Arc::new(RecordingNotifier::default())).await;

    assert!(result.succeeded(), "{:?}", result.failures);
    assert_eq!(result.status("CreateExpectationSuite"), Some(TaskStatus::Skipped));
    assert_eq!(result.status("SkipStep"), Some(TaskStatus::Success));
    assert_eq!(result.status("DataValidation"), Some(TaskStatus::Success));
    assert_eq!(result.status("ModelTraining"), Some(TaskStatus::Success));
}

#[tokio::test]
async fn failing_model_falls_back_to_persistence_and_still_gates() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.monitoring_cutoff = Some(day(2025, 2, 1));
    let history = seed_history(&config);
    let forecaster = ScriptedForecaster::failing("model file corrupt");
    seed_model(&config, &forecaster, &history);

    let source = StaticSource::new(synthetic_records(day(2025, 3, 2), 10));
    let result = run(config, source, forecaster, Arc::new(RecordingNotifier::default())).await;

    let rmse = result.artifact("MonitorModelDecay", "decay_report").unwrap()["metrics"]["rmse"]
        .as_f64()
        .unwrap();
    assert!(rmse > 0.3);
    assert_eq!(result.status("MonitorModelDecay"), Some(TaskStatus::Success));
    assert_eq!(result.status("notify_model_decay"), Some(TaskStatus::Success));
    assert_eq!(result.status("stop_pipeline"), Some(TaskStatus::Skipped));
}

#[tokio::test]
async fn first_run_without_history_bootstraps_a_model() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let forecaster = ScriptedForecaster::failing("no model yet");
    let fits = forecaster.fits();
    let model_store = config.model_store();

    let source = StaticSource::new(synthetic_records(day(2025, 1, 1), 30));
    let result = run(config, source, forecaster, Arc::new(RecordingNotifier::default())).await;

    assert!(result.succeeded(), "{:?}", result.failures);
    assert_eq!(result.artifact("MonitorModelDecay", "decay_status"), Some(&json!("FAIL")));
    assert_eq!(result.status("ModelTraining"), Some(TaskStatus::Success));
    assert_eq!(fits.load(Ordering::SeqCst), 1);
    assert_eq!(model_store.load().unwrap().unwrap().training_rows, 30);
}

#[tokio::test]
async fn missing_cutoff_without_model_fails_and_alerts_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    seed_history(&config);

    let notifier = Arc::new(RecordingNotifier::failing());
    let result = run(
        config,
        StaticSource::new(Vec::new()),
        ScriptedForecaster::failing("unused"),
        notifier.clone(),
    )
    .await;

    assert_eq!(result.status("MonitorModelDecay"), Some(TaskStatus::Failed));
    assert_eq!(result.status("IsModelDecay"), Some(TaskStatus::UpstreamFailed));
    assert_eq!(result.status("stop_pipeline"), Some(TaskStatus::UpstreamFailed));
    assert!(result.failures["MonitorModelDecay"].contains("cutoff"));
    assert_eq!(titles(&notifier, "Task Failed."), 1);
}

#[tokio::test]
async fn fresh_model_is_scored_on_its_last_training_day() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let history = seed_history(&config);
    let forecaster = ScriptedForecaster::offset_from(&history, |_| 0.0);
    seed_model(&config, &forecaster, &history);

    let notifier = Arc::new(RecordingNotifier::default());
    let result = run(config, StaticSource::new(Vec::new()), forecaster, notifier).await;

    assert!(result.succeeded());
    let report = result.artifact("MonitorModelDecay", "decay_report").unwrap();
    assert_eq!(report["current_rows"], json!(1));
    assert_eq!(report["reference_rows"], json!(51));
    assert_eq!(report["status"], json!("PASS"));
}
