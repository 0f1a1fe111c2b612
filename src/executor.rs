use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use crate::trigger::Resolution;
use crate::{
    ArtifactStore, BoxTask, FailureAlert, Notification, Notifier, PipelineError, RetryExecutor,
    RetryPolicy, TaskContext, TaskOutcome, TaskStatus, find_cycle,
};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Per-attempt limit for tasks that do not declare their own.
    pub default_timeout: Duration,
    pub notify_timeout: Duration,
    pub max_parallel: usize,
    /// Prefix of the log reference sent with failure alerts.
    pub log_base: String,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(600),
            notify_timeout: Duration::from_secs(10),
            max_parallel: 4,
            log_base: "logs".to_string(),
        }
    }
}

/// Outcome of one execution of the whole graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub dag_name: String,
    pub logical_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub statuses: BTreeMap<String, TaskStatus>,
    pub failures: BTreeMap<String, String>,
    pub execution_order: Vec<String>,
    pub artifacts: BTreeMap<String, BTreeMap<String, Value>>,
    pub notified: bool,
}

impl RunResult {
    /// True when no task ended FAILED or UPSTREAM_FAILED. A run that stopped
    /// early through a branch still counts as a success.
    pub fn succeeded(&self) -> bool {
        !self.statuses.values().any(|s| s.is_failure())
    }

    pub fn status(&self, task: &str) -> Option<TaskStatus> {
        self.statuses.get(task).copied()
    }

    pub fn artifact(&self, task: &str, key: &str) -> Option<&Value> {
        self.artifacts.get(task).and_then(|values| values.get(key))
    }
}

struct Completion {
    task: String,
    result: Result<(TaskOutcome, Vec<(String, Value)>), PipelineError>,
}

pub struct Orchestrator {
    dag_name: String,
    tasks: BTreeMap<String, BoxTask>,
    upstream: BTreeMap<String, Vec<String>>,
    ancestors: BTreeMap<String, Arc<HashSet<String>>>,
    dependents: BTreeMap<String, Vec<String>>,
    in_degrees: BTreeMap<String, usize>,
    notifier: Arc<dyn Notifier>,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        dag_name: impl Into<String>,
        tasks: Vec<BoxTask>,
        notifier: Arc<dyn Notifier>,
        options: OrchestratorOptions,
    ) -> Result<Self, PipelineError> {
        let mut by_name: BTreeMap<String, BoxTask> = BTreeMap::new();
        for task in tasks {
            let name = task.name().to_string();
            if by_name.insert(name.clone(), task).is_some() {
                return Err(PipelineError::DuplicateTask(name));
            }
        }

        let mut upstream = BTreeMap::new();
        for (name, task) in &by_name {
            let deps: BTreeSet<String> = task.dependencies().into_iter().collect();
            for dep in &deps {
                if !by_name.contains_key(dep) {
                    return Err(PipelineError::UnknownDependency {
                        task: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            upstream.insert(name.clone(), deps.into_iter().collect::<Vec<_>>());
        }

        if let Some(cycle) = find_cycle(&by_name) {
            return Err(PipelineError::GraphCycle(cycle));
        }

        let mut in_degrees = BTreeMap::new();
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, deps) in &upstream {
            in_degrees.insert(name.clone(), deps.len());
            for dep in deps {
                dependents.entry(dep.clone()).or_default().push(name.clone());
            }
        }

        let ancestors = by_name
            .keys()
            .map(|name| {
                let mut seen = HashSet::new();
                collect_ancestors(name, &upstream, &mut seen);
                (name.clone(), Arc::new(seen))
            })
            .collect();

        Ok(Self {
            dag_name: dag_name.into(),
            tasks: by_name,
            upstream,
            ancestors,
            dependents,
            in_degrees,
            notifier,
            options,
        })
    }

    #[instrument(skip(self, ctx), fields(dag = %self.dag_name))]
    pub async fn run(
        &self,
        ctx: CancellationToken,
        logical_date: NaiveDate,
    ) -> Result<RunResult, PipelineError> {
        let started_at = Utc::now();
        let run_id = format!(
            "{}__{}__{}",
            self.dag_name,
            logical_date,
            started_at.format("%Y%m%dT%H%M%S")
        );
        info!(run_id = %run_id, tasks = self.tasks.len(), "starting run");

        let store = Arc::new(ArtifactStore::new());
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallel.max(1)));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();

        let mut statuses: BTreeMap<String, TaskStatus> = self
            .tasks
            .keys()
            .map(|name| (name.clone(), TaskStatus::Pending))
            .collect();
        let mut remaining = self.in_degrees.clone();
        let mut branch_skipped: HashSet<String> = HashSet::new();
        let mut failures = BTreeMap::new();
        let mut execution_order = Vec::new();
        let mut handles = Vec::new();
        let mut running = 0usize;
        let mut cancelled = false;
        let mut notified = false;

        let mut ready: VecDeque<String> = remaining
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| name.clone())
            .collect();

        loop {
            while let Some(name) = ready.pop_front() {
                let resolution = if branch_skipped.contains(&name) {
                    Resolution::Skip
                } else {
                    let upstream: Vec<TaskStatus> = self.upstream[&name]
                        .iter()
                        .map(|dep| statuses[dep])
                        .collect();
                    self.tasks[&name].trigger_rule().resolve(&upstream)
                };

                match resolution {
                    Resolution::Run if cancelled => {}
                    Resolution::Run => {
                        statuses.insert(name.clone(), TaskStatus::Running);
                        info!(task = %name, "task running");
                        handles.push(self.spawn_task(
                            ctx.clone(),
                            &name,
                            &run_id,
                            logical_date,
                            store.clone(),
                            semaphore.clone(),
                            done_tx.clone(),
                        ));
                        running += 1;
                    }
                    Resolution::Skip => {
                        info!(task = %name, "task skipped");
                        statuses.insert(name.clone(), TaskStatus::Skipped);
                        ready.extend(self.release(&name, &mut remaining));
                    }
                    Resolution::UpstreamFailed => {
                        warn!(task = %name, "upstream failed, task will not run");
                        statuses.insert(name.clone(), TaskStatus::UpstreamFailed);
                        ready.extend(self.release(&name, &mut remaining));
                    }
                }
            }

            if running == 0 {
                break;
            }

            tokio::select! {
                Some(done) = done_rx.recv() => {
                    running -= 1;
                    let name = done.task.clone();
                    execution_order.push(name.clone());

                    match self.complete(done, &store, &mut branch_skipped).await {
                        Ok(()) => {
                            info!(task = %name, "task succeeded");
                            statuses.insert(name.clone(), TaskStatus::Success);
                        }
                        Err(e) => {
                            error!(task = %name, error = %e, "task failed");
                            statuses.insert(name.clone(), TaskStatus::Failed);
                            let detail = e.to_string();
                            if !notified {
                                notified = true;
                                self.escalate(&run_id, &name, &detail).await;
                            }
                            failures.insert(name.clone(), detail);
                        }
                    }
                    ready.extend(self.release(&name, &mut remaining));
                }
                _ = ctx.cancelled(), if !cancelled => {
                    warn!(running, "run cancelled, waiting for running tasks");
                    cancelled = true;
                }
            }
        }

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!(error = %e, "task worker panicked");
            }
        }

        if cancelled {
            return Err(PipelineError::ContextCancelled(format!(
                "run {} cancelled before completion",
                run_id
            )));
        }

        let result = RunResult {
            run_id,
            dag_name: self.dag_name.clone(),
            logical_date,
            started_at,
            finished_at: Utc::now(),
            statuses,
            failures,
            execution_order,
            artifacts: store.snapshot().await,
            notified,
        };
        info!(run_id = %result.run_id, succeeded = result.succeeded(), "run finished");
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_task(
        &self,
        ctx: CancellationToken,
        task_name: &str,
        run_id: &str,
        logical_date: NaiveDate,
        store: Arc<ArtifactStore>,
        semaphore: Arc<Semaphore>,
        completion_tx: mpsc::UnboundedSender<Completion>,
    ) -> tokio::task::JoinHandle<()> {
        let task = self.tasks[task_name].clone();
        let ancestors = self.ancestors[task_name].clone();
        let limit = task.timeout().unwrap_or(self.options.default_timeout);
        let task_name = task_name.to_string();
        let run_id = run_id.to_string();
        let dag_name = self.dag_name.clone();

        tokio::spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    // no policy means a single attempt
                    let policy = task.retry_policy().unwrap_or_else(RetryPolicy::once);
                    let retry_executor = RetryExecutor::new(Some(policy));
                    retry_executor
                        .execute_with_retry(ctx.clone(), &task_name, |attempt| {
                            let ctx = ctx.clone();
                            let task = task.clone();
                            let run = TaskContext::new(
                                run_id.clone(),
                                dag_name.clone(),
                                logical_date,
                                task_name.clone(),
                                attempt,
                                ancestors.clone(),
                                store.clone(),
                            );
                            let name = task_name.clone();

                            async move {
                                // own task, so a stuck or panicking body cannot stall the run
                                let mut worker = tokio::spawn(async move {
                                    let outcome = task.execute(ctx, &run).await?;
                                    Ok::<_, PipelineError>((outcome, run.into_staged()))
                                });
                                match tokio::time::timeout(limit, &mut worker).await {
                                    Ok(Ok(result)) => result,
                                    Ok(Err(join)) => Err(PipelineError::from_join(&name, join)),
                                    Err(_) => {
                                        worker.abort();
                                        Err(PipelineError::Timeout {
                                            task: name,
                                            after: limit,
                                        })
                                    }
                                }
                            }
                        })
                        .await
                }
                Err(_) => Err(PipelineError::TaskExecution(
                    "Failed to acquire semaphore".to_string(),
                )),
            };

            let _ = completion_tx.send(Completion {
                task: task_name,
                result,
            });
        })
    }

    /// Applies a finished attempt: checks the branch decision, then commits
    /// the staged artifacts.
    async fn complete(
        &self,
        done: Completion,
        store: &ArtifactStore,
        branch_skipped: &mut HashSet<String>,
    ) -> Result<(), PipelineError> {
        let (outcome, staged) = done.result?;

        let children = self
            .dependents
            .get(&done.task)
            .cloned()
            .unwrap_or_default();

        let skipped = match &outcome {
            TaskOutcome::Completed => Vec::new(),
            TaskOutcome::Branch(decision) => {
                if decision.selected.is_empty() {
                    return Err(PipelineError::InvalidBranch {
                        task: done.task.clone(),
                        detail: "no downstream task selected".to_string(),
                    });
                }
                if let Some(unknown) = decision.selected.iter().find(|s| !children.contains(*s)) {
                    return Err(PipelineError::InvalidBranch {
                        task: done.task.clone(),
                        detail: format!("{} is not a direct downstream task", unknown),
                    });
                }
                info!(task = %done.task, selected = ?decision.selected, "branch decided");
                children
                    .iter()
                    .filter(|child| !decision.selected.contains(*child))
                    .cloned()
                    .collect()
            }
        };

        store.commit(&done.task, staged).await?;
        branch_skipped.extend(skipped);
        Ok(())
    }

    async fn escalate(&self, run_id: &str, task_name: &str, detail: &str) {
        let alert = FailureAlert {
            run_id: run_id.to_string(),
            dag_name: self.dag_name.clone(),
            task_name: task_name.to_string(),
            execution_time: Utc::now(),
            detail: detail.to_string(),
            log_reference: format!(
                "{}/{}/{}/{}",
                self.options.log_base, self.dag_name, run_id, task_name
            ),
        };
        let message = Notification::from(&alert);

        match tokio::time::timeout(self.options.notify_timeout, self.notifier.notify(&message)).await
        {
            Ok(Ok(())) => info!(task = task_name, "failure alert sent"),
            Ok(Err(e)) => error!(task = task_name, error = %e, "failure alert could not be delivered"),
            Err(_) => error!(task = task_name, "failure alert timed out"),
        }
    }

    /// Marks `name` as resolved for its dependents and returns the ones that
    /// now have every upstream settled.
    fn release(&self, name: &str, remaining: &mut BTreeMap<String, usize>) -> Vec<String> {
        let mut now_ready = Vec::new();
        if let Some(children) = self.dependents.get(name) {
            for child in children {
                if let Some(degree) = remaining.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        now_ready.push(child.clone());
                    }
                }
            }
        }
        now_ready
    }

    pub fn render_graph(&self) -> String {
        let mut out = String::new();
        for (name, &degree) in &self.in_degrees {
            if degree == 0 {
                out.push_str(name);
                out.push('\n');
                self.render_chain(name, "  ", &mut out);
                out.push('\n');
            }
        }
        out
    }

    fn render_chain(&self, name: &str, prefix: &str, out: &mut String) {
        if let Some(children) = self.dependents.get(name) {
            for child in children {
                let rule = self.tasks[child].trigger_rule();
                out.push_str(&format!("{}└─> {} [{:?}]\n", prefix, child, rule));
                self.render_chain(child, &format!("{}    ", prefix), out);
            }
        }
    }

    pub fn print_graph(&self) {
        print!("{}", self.render_graph());
    }
}

fn collect_ancestors(
    name: &str,
    upstream: &BTreeMap<String, Vec<String>>,
    seen: &mut HashSet<String>,
) {
    if let Some(deps) = upstream.get(name) {
        for dep in deps {
            if seen.insert(dep.clone()) {
                collect_ancestors(dep, upstream, seen);
            }
        }
    }
}
