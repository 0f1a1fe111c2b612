pub mod artifact;
pub mod config;
pub mod cycle_check;
pub mod dataset;
pub mod executor;
pub mod forecast;
pub mod mock;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod task;
pub mod trigger;
pub mod validation;
pub mod weather;

pub use artifact::{ArtifactStore, TaskContext};
pub use config::PipelineConfig;
pub use cycle_check::find_cycle;
pub use executor::{Orchestrator, OrchestratorOptions, RunResult};
pub use notify::{FailureAlert, Notification, Notifier};
pub use retry::{RetryExecutor, RetryPolicy};
pub use task::{BranchDecision, Task, TaskOutcome};
pub use trigger::{TaskStatus, TriggerRule};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use validation::ValidationResult;

pub type BoxTask = Arc<dyn Task>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    GraphCycle(Vec<String>),
    #[error("Task {0} is declared more than once")]
    DuplicateTask(String),
    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Validation failed: {}", summarize_failures(.0))]
    ValidationFailure(Box<ValidationResult>),
    #[error("Prediction failed: {0}")]
    Prediction(String),
    #[error("Empty slice: {0}")]
    EmptySlice(String),
    #[error("Artifact ({task}, {key}) was already published in this run")]
    ArtifactConflict { task: String, key: String },
    #[error("Artifact ({task}, {key}) has not been published")]
    ArtifactMissing { task: String, key: String },
    #[error("Task {reader} cannot read ({task}, {key}): {task} is not upstream of {reader}")]
    LineageViolation {
        reader: String,
        task: String,
        key: String,
    },
    #[error("Branch task {task} returned an invalid decision: {detail}")]
    InvalidBranch { task: String, detail: String },
    #[error("Task {task} timed out after {after:?}")]
    Timeout { task: String, after: Duration },
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Task execution failed: {0}")]
    TaskExecution(String),
    #[error("Task {task} panicked: {message}")]
    TaskPanicked { task: String, message: String },
    #[error("Task {task} failed after {attempts} attempts, last error: {last}")]
    RetryFailed {
        task: String,
        attempts: u32,
        last: Box<PipelineError>,
    },
    #[error("Context cancelled: {0}")]
    ContextCancelled(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether another attempt of the same task could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::UpstreamUnavailable(_)
                | PipelineError::Timeout { .. }
                | PipelineError::TaskExecution(_)
                | PipelineError::Io(_)
        )
    }

    /// Maps a failed join on `task`'s worker. A panic is kept apart from
    /// ordinary failures so it is never retried.
    pub fn from_join(task: &str, err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            let payload = err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            PipelineError::TaskPanicked {
                task: task.to_string(),
                message,
            }
        } else {
            PipelineError::TaskExecution(format!("worker of {} was cancelled: {}", task, err))
        }
    }
}

fn summarize_failures(result: &ValidationResult) -> String {
    let failed: Vec<String> = result
        .failures()
        .map(|outcome| outcome.rule.to_string())
        .collect();
    format!(
        "{} of {} expectations failed [{}]",
        failed.len(),
        result.results.len(),
        failed.join("; ")
    )
}
