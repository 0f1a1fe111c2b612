use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::{PipelineError, RetryPolicy, TaskContext, TriggerRule};

/// Downstream path chosen by a branch task. Every other direct downstream
/// of the branch point is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchDecision {
    pub selected: Vec<String>,
}

impl BranchDecision {
    pub fn to(task: impl Into<String>) -> Self {
        Self {
            selected: vec![task.into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Branch(BranchDecision),
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;
    fn dependencies(&self) -> Vec<String>;

    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    fn trigger_rule(&self) -> TriggerRule {
        TriggerRule::AllSuccess
    }

    /// Per-attempt limit. `None` falls back to the orchestrator default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        run: &TaskContext,
    ) -> Result<TaskOutcome, PipelineError>;
}

/// Runs blocking filesystem or CPU-bound work of `task` on the blocking
/// pool, keeping the async body responsive to its timeout.
pub async fn offload<T, F>(task: &str, work: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PipelineError::from_join(task, e))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offloaded_panic_becomes_a_task_failure() {
        let err = offload::<(), _>("training", || panic!("singular matrix"))
            .await
            .unwrap_err();
        match err {
            PipelineError::TaskPanicked { task, message } => {
                assert_eq!(task, "training");
                assert_eq!(message, "singular matrix");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn offloaded_result_is_returned() {
        let rows = offload("versioning", || Ok(3usize)).await.unwrap();
        assert_eq!(rows, 3);
    }
}
