//! Run-scoped artifact handoff between tasks.
//!
//! Every value is addressed by `(task, key)`. A key is written at most once
//! per run, and a task can only read artifacts produced by one of its direct
//! or transitive upstream tasks.

use chrono::NaiveDate;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use crate::PipelineError;

pub type ArtifactKey = (String, String);

#[derive(Debug, Default)]
pub struct ArtifactStore {
    values: RwLock<BTreeMap<ArtifactKey, Value>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, task: &str, key: &str) -> Option<Value> {
        self.values
            .read()
            .await
            .get(&(task.to_string(), key.to_string()))
            .cloned()
    }

    /// Publishes every staged value of `task` or none of them.
    pub async fn commit(
        &self,
        task: &str,
        staged: Vec<(String, Value)>,
    ) -> Result<usize, PipelineError> {
        let mut values = self.values.write().await;

        let mut seen = HashSet::new();
        for (key, _) in &staged {
            let slot = (task.to_string(), key.clone());
            if values.contains_key(&slot) || !seen.insert(key.clone()) {
                return Err(PipelineError::ArtifactConflict {
                    task: task.to_string(),
                    key: key.clone(),
                });
            }
        }

        let count = staged.len();
        for (key, value) in staged {
            values.insert((task.to_string(), key), value);
        }
        Ok(count)
    }

    pub async fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, Value>> {
        let values = self.values.read().await;
        let mut out: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for ((task, key), value) in values.iter() {
            out.entry(task.clone())
                .or_default()
                .insert(key.clone(), value.clone());
        }
        out
    }
}

/// Handle given to one attempt of one task.
///
/// Reads go straight to the run's [`ArtifactStore`]. Writes are staged and
/// only committed by the orchestrator once the attempt returns `Ok`.
#[derive(Debug)]
pub struct TaskContext {
    pub run_id: String,
    pub dag_name: String,
    pub logical_date: NaiveDate,
    pub task_name: String,
    pub attempt: u32,
    upstream: Arc<HashSet<String>>,
    store: Arc<ArtifactStore>,
    staged: Mutex<Vec<(String, Value)>>,
}

impl TaskContext {
    pub fn new(
        run_id: impl Into<String>,
        dag_name: impl Into<String>,
        logical_date: NaiveDate,
        task_name: impl Into<String>,
        attempt: u32,
        upstream: Arc<HashSet<String>>,
        store: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            dag_name: dag_name.into(),
            logical_date,
            task_name: task_name.into(),
            attempt,
            upstream,
            store,
            staged: Mutex::new(Vec::new()),
        }
    }

    pub async fn pull(&self, task: &str, key: &str) -> Result<Value, PipelineError> {
        if !self.upstream.contains(task) {
            return Err(PipelineError::LineageViolation {
                reader: self.task_name.clone(),
                task: task.to_string(),
                key: key.to_string(),
            });
        }
        self.store
            .get(task, key)
            .await
            .ok_or_else(|| PipelineError::ArtifactMissing {
                task: task.to_string(),
                key: key.to_string(),
            })
    }

    pub async fn pull_as<T: DeserializeOwned>(
        &self,
        task: &str,
        key: &str,
    ) -> Result<T, PipelineError> {
        let value = self.pull(task, key).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn publish<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PipelineError> {
        let value = serde_json::to_value(value)?;
        let mut staged = self
            .staged
            .lock()
            .map_err(|_| PipelineError::TaskExecution("artifact staging lock poisoned".into()))?;
        if staged.iter().any(|(k, _)| k == key) {
            return Err(PipelineError::ArtifactConflict {
                task: self.task_name.clone(),
                key: key.to_string(),
            });
        }
        staged.push((key.to_string(), value));
        Ok(())
    }

    pub fn into_staged(self) -> Vec<(String, Value)> {
        self.staged.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(task: &str, upstream: &[&str], store: Arc<ArtifactStore>) -> TaskContext {
        TaskContext::new(
            "run-1",
            "dag",
            NaiveDate::from_ymd_opt(2025, 5, 23).unwrap(),
            task,
            1,
            Arc::new(upstream.iter().map(|s| s.to_string()).collect()),
            store,
        )
    }

    #[tokio::test]
    async fn second_write_to_same_key_conflicts() {
        let store = ArtifactStore::new();
        store
            .commit("DataFetching", vec![("weather_filename".into(), json!("a.csv"))])
            .await
            .unwrap();
        let err = store
            .commit("DataFetching", vec![("weather_filename".into(), json!("b.csv"))])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactConflict { .. }));
        assert_eq!(
            store.get("DataFetching", "weather_filename").await,
            Some(json!("a.csv"))
        );
    }

    #[tokio::test]
    async fn conflicting_commit_writes_nothing() {
        let store = ArtifactStore::new();
        store.commit("t", vec![("a".into(), json!(1))]).await.unwrap();
        let err = store
            .commit("t", vec![("b".into(), json!(2)), ("a".into(), json!(3))])
            .await;
        assert!(err.is_err());
        assert_eq!(store.get("t", "b").await, None);
    }

    #[tokio::test]
    async fn pull_requires_lineage() {
        let store = Arc::new(ArtifactStore::new());
        store
            .commit("MonitorModelDecay", vec![("decay_status".into(), json!("FAIL"))])
            .await
            .unwrap();

        let reader = context("IsModelDecay", &["MonitorModelDecay"], store.clone());
        let status: String = reader.pull_as("MonitorModelDecay", "decay_status").await.unwrap();
        assert_eq!(status, "FAIL");

        let outsider = context("stop_pipeline", &[], store);
        let err = outsider.pull("MonitorModelDecay", "decay_status").await.unwrap_err();
        assert!(matches!(err, PipelineError::LineageViolation { .. }));
    }

    #[tokio::test]
    async fn staged_values_stay_private_until_commit() {
        let store = Arc::new(ArtifactStore::new());
        let ctx = context("DataFetching", &[], store.clone());
        ctx.publish("rows", &30).unwrap();
        assert!(ctx.publish("rows", &31).is_err());
        assert_eq!(store.get("DataFetching", "rows").await, None);

        let staged = ctx.into_staged();
        store.commit("DataFetching", staged).await.unwrap();
        assert_eq!(store.get("DataFetching", "rows").await, Some(json!(30)));
    }
}
