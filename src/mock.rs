//! Deterministic test doubles for the task graph and its collaborators.
//!
//! Nothing in here touches the network or the clock beyond `tokio::time`.

use async_trait::async_trait;
use chrono::{Duration as Days, NaiveDate, Utc};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::forecast::{Covariates, Forecaster, ModelArtifact, TimeSeries};
use crate::source::{DataSource, FetchOutcome};
use crate::task::offload;
use crate::weather::WeatherRecord;
use crate::{
    BranchDecision, Notification, Notifier, PipelineError, RetryPolicy, Task, TaskContext,
    TaskOutcome, TriggerRule,
};

/// How a [`MockTask`] fails, if at all.
enum Failure {
    None,
    Fatal(String),
    /// Fails with a retryable error for the first `n` calls.
    RetryableTimes(u32, String),
    Panic(String),
}

/// Work done on the calling thread instead of yielding to the runtime.
enum Blocking {
    None,
    /// `std::thread::sleep` straight inside the async body.
    InPlace(Duration),
    /// The same sleep handed to [`crate::task::offload`].
    Offloaded(Duration),
}

/// A task whose behaviour is assembled with builder methods.
pub struct MockTask {
    name: String,
    dependencies: Vec<String>,
    publishes: Vec<(String, Value)>,
    reads: Vec<(String, String)>,
    failure: Failure,
    publish_first: bool,
    blocking: Blocking,
    branch: Option<String>,
    trigger: TriggerRule,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
    sleep: Option<Duration>,
    calls: Arc<AtomicU32>,
}

impl MockTask {
    pub fn new(name: &str, dependencies: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            publishes: Vec::new(),
            reads: Vec::new(),
            failure: Failure::None,
            publish_first: false,
            blocking: Blocking::None,
            branch: None,
            trigger: TriggerRule::AllSuccess,
            retry: None,
            timeout: None,
            sleep: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn publishing(mut self, key: &str, value: Value) -> Self {
        self.publishes.push((key.to_string(), value));
        self
    }

    pub fn reading(mut self, task: &str, key: &str) -> Self {
        self.reads.push((task.to_string(), key.to_string()));
        self
    }

    pub fn failing_fatal(mut self, msg: &str) -> Self {
        self.failure = Failure::Fatal(msg.to_string());
        self
    }

    pub fn failing_retryable_times(mut self, times: u32, msg: &str) -> Self {
        self.failure = Failure::RetryableTimes(times, msg.to_string());
        self
    }

    pub fn panicking(mut self, msg: &str) -> Self {
        self.failure = Failure::Panic(msg.to_string());
        self
    }

    /// Stages the published values before the failure check, so a failing
    /// attempt has already published something.
    pub fn publishing_before_failure(mut self) -> Self {
        self.publish_first = true;
        self
    }

    pub fn blocking_in_place(mut self, duration: Duration) -> Self {
        self.blocking = Blocking::InPlace(duration);
        self
    }

    pub fn blocking_offloaded(mut self, duration: Duration) -> Self {
        self.blocking = Blocking::Offloaded(duration);
        self
    }

    pub fn branching(mut self, target: &str) -> Self {
        self.branch = Some(target.to_string());
        self
    }

    pub fn with_trigger(mut self, rule: TriggerRule) -> Self {
        self.trigger = rule;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn sleeping(mut self, duration: Duration) -> Self {
        self.sleep = Some(duration);
        self
    }

    /// Shared counter of `execute` calls, readable after the task has been
    /// moved into an orchestrator.
    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl Task for MockTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry.clone()
    }

    fn trigger_rule(&self) -> TriggerRule {
        self.trigger
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(
        &self,
        _ctx: CancellationToken,
        run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(duration) = self.sleep {
            tokio::time::sleep(duration).await;
        }
        match self.blocking {
            Blocking::None => {}
            Blocking::InPlace(duration) => std::thread::sleep(duration),
            Blocking::Offloaded(duration) => {
                offload(&self.name, move || {
                    std::thread::sleep(duration);
                    Ok(())
                })
                .await?
            }
        }
        for (task, key) in &self.reads {
            run.pull(task, key).await?;
        }
        if self.publish_first {
            for (key, value) in &self.publishes {
                run.publish(key, value)?;
            }
        }
        match &self.failure {
            Failure::None => {}
            Failure::Fatal(msg) => return Err(PipelineError::Configuration(msg.clone())),
            Failure::RetryableTimes(times, msg) if call <= *times => {
                return Err(PipelineError::UpstreamUnavailable(msg.clone()));
            }
            Failure::RetryableTimes(..) => {}
            Failure::Panic(msg) => panic!("{}", msg),
        }
        if !self.publish_first {
            for (key, value) in &self.publishes {
                run.publish(key, value)?;
            }
        }

        Ok(match &self.branch {
            Some(target) => TaskOutcome::Branch(BranchDecision::to(target.as_str())),
            None => TaskOutcome::Completed,
        })
    }
}

/// Keeps every notification it receives. Delivery can be made to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<Notification>>,
    fail_delivery: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            fail_delivery: true,
        }
    }

    pub fn messages(&self) -> Vec<Notification> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &Notification) -> Result<(), PipelineError> {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.clone());
        }
        if self.fail_delivery {
            return Err(PipelineError::UpstreamUnavailable("alert channel down".into()));
        }
        Ok(())
    }
}

/// Serves a fixed set of records, optionally failing the first calls.
pub struct StaticSource {
    records: Vec<WeatherRecord>,
    dropped_rows: usize,
    failures_left: AtomicU32,
    calls: Arc<AtomicU32>,
}

impl StaticSource {
    pub fn new(records: Vec<WeatherRecord>) -> Self {
        Self {
            records,
            dropped_rows: 0,
            failures_left: AtomicU32::new(0),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_dropped_rows(mut self, dropped_rows: usize) -> Self {
        self.dropped_rows = dropped_rows;
        self
    }

    pub fn failing_times(self, times: u32) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl DataSource for StaticSource {
    async fn fetch(
        &self,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<FetchOutcome, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PipelineError::UpstreamUnavailable("provider returned 503".into()));
        }
        Ok(FetchOutcome {
            records: self.records.clone(),
            dropped_rows: self.dropped_rows,
        })
    }
}

/// Predicts from a date-keyed script. A date missing from the script, or a
/// forecaster built with [`ScriptedForecaster::failing`], yields a
/// prediction error.
pub struct ScriptedForecaster {
    script: BTreeMap<NaiveDate, f64>,
    failure: Option<String>,
    fits: Arc<AtomicU32>,
}

impl ScriptedForecaster {
    pub fn new(script: BTreeMap<NaiveDate, f64>) -> Self {
        Self {
            script,
            failure: None,
            fits: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn failing(msg: &str) -> Self {
        Self {
            script: BTreeMap::new(),
            failure: Some(msg.to_string()),
            fits: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Predicts each record's rain plus `offset`.
    pub fn offset_from(records: &[WeatherRecord], offset: impl Fn(NaiveDate) -> f64) -> Self {
        Self::new(
            records
                .iter()
                .map(|r| (r.date, r.rain_sum + offset(r.date)))
                .collect(),
        )
    }

    pub fn fits(&self) -> Arc<AtomicU32> {
        self.fits.clone()
    }
}

impl Forecaster for ScriptedForecaster {
    fn name(&self) -> &str {
        "ScriptedForecaster"
    }

    fn fit(
        &self,
        series: &TimeSeries,
        _past_covariates: &Covariates,
    ) -> Result<ModelArtifact, PipelineError> {
        self.fits.fetch_add(1, Ordering::SeqCst);
        let (trained_until, _) = series
            .last()
            .ok_or_else(|| PipelineError::Prediction("cannot fit on an empty series".into()))?;
        Ok(ModelArtifact {
            model_name: self.name().to_string(),
            trained_at: Utc::now(),
            trained_until,
            training_rows: series.len(),
            params: json!({ "scripted": true }),
        })
    }

    fn predict(
        &self,
        _model: &ModelArtifact,
        series: &TimeSeries,
        _past_covariates: &Covariates,
        horizon: usize,
    ) -> Result<TimeSeries, PipelineError> {
        if let Some(msg) = &self.failure {
            return Err(PipelineError::Prediction(msg.clone()));
        }
        let (last, _) = series
            .last()
            .ok_or_else(|| PipelineError::Prediction("empty series".into()))?;
        let index: Vec<NaiveDate> = (1..=horizon as i64).map(|i| last + Days::days(i)).collect();
        let values = index
            .iter()
            .map(|d| {
                self.script
                    .get(d)
                    .copied()
                    .ok_or_else(|| PipelineError::Prediction(format!("no scripted value for {}", d)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        TimeSeries::new(index, values)
    }
}

/// A plausible wet-season day in Brazzaville.
pub fn record_on(date: &str) -> WeatherRecord {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("record_on takes YYYY-MM-DD");
    WeatherRecord {
        date,
        temperature_max: 31.0,
        temperature_min: 22.5,
        rain_sum: 0.0,
        humidity_max: 95.0,
        humidity_min: 55.0,
        wind_speed_max: 4.2,
        wind_speed_min: 0.8,
        wind_speed_mean: 2.1,
        humidity_mean: 78.0,
        cloud_cover_mean: 64.0,
        surface_pressure_mean: 985.3,
        precipitation_hours: 0.0,
    }
}

/// `days` consecutive records from `start` that pass the default suite.
/// Every third day is dry; rain only falls on days with precipitation hours.
pub fn synthetic_records(start: NaiveDate, days: usize) -> Vec<WeatherRecord> {
    (0..days)
        .map(|i| {
            let step = i as f64;
            let precipitation_hours = if i % 3 == 0 { 0.0 } else { (i % 7 + 1) as f64 };
            let rain_sum = if precipitation_hours == 0.0 {
                0.0
            } else {
                precipitation_hours * 1.5 + (i % 5) as f64 * 0.1
            };
            WeatherRecord {
                date: start + Days::days(i as i64),
                temperature_max: 30.0 + (i % 5) as f64 * 0.5,
                temperature_min: 21.0 + (i % 4) as f64 * 0.5,
                rain_sum,
                humidity_max: 95.0,
                humidity_min: 50.0 + (i % 10) as f64,
                wind_speed_max: 4.0 + (i % 3) as f64 * 0.3,
                wind_speed_min: 0.5,
                wind_speed_mean: 2.0 + (step * 0.7).sin() * 0.5,
                humidity_mean: 75.0 + (i % 6) as f64,
                cloud_cover_mean: 60.0 + (i % 20) as f64,
                surface_pressure_mean: 980.0 + (i % 10) as f64 * 0.5,
                precipitation_hours,
            }
        })
        .collect()
}
