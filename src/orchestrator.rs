use crate::config::OrchestratorSettings;
use crate::data_context::PriceSource;
use crate::errors::PipelineError;
use crate::ledger;
use crate::models::*;
use crate::pipeline;
use crate::ranking::RankingEngine;
use crate::storage::{Storage, StorageGateway};
use crate::task_status::TaskStatusHandle;
use crate::worker_pool::WorkerPool;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Returned by every submit. `attached` is set when an identical task was
/// already active and the caller joined it instead of starting a new one.
pub struct TaskHandle {
    pub task_id: String,
    pub attached: bool,
    pub events: broadcast::Receiver<ProgressEvent>,
}

#[derive(Debug, Clone)]
enum TaskJob {
    LabelRun {
        rule: RuleKind,
        range: DateRange,
        params: LabelParams,
    },
    Backtest(BacktestRequest),
    Rerun {
        experiment_id: String,
    },
}

impl TaskJob {
    fn kind(&self) -> TaskKind {
        match self {
            TaskJob::LabelRun { .. } => TaskKind::LabelRun,
            TaskJob::Backtest(_) => TaskKind::Backtest,
            TaskJob::Rerun { .. } => TaskKind::ExperimentRerun,
        }
    }

    /// Two jobs under one fingerprint compute the same thing. They can share
    /// a task only when they also report the same outcome.
    fn shares_outcome_with(&self, other: &TaskJob) -> bool {
        match (self, other) {
            (TaskJob::LabelRun { .. }, TaskJob::LabelRun { .. }) => true,
            (TaskJob::Backtest(_), TaskJob::Backtest(_)) => true,
            (TaskJob::Rerun { experiment_id: a }, TaskJob::Rerun { experiment_id: b }) => a == b,
            _ => false,
        }
    }
}

/// The task currently computing a fingerprint.
struct ActiveTask {
    task_id: String,
    job: TaskJob,
}

struct OrchestratorInner {
    settings: OrchestratorSettings,
    storage: StorageGateway,
    source: Arc<dyn PriceSource>,
    ranking: Arc<RankingEngine>,
    pool: WorkerPool,
    tasks: DashMap<String, TaskStatusHandle>,
    active: DashMap<String, ActiveTask>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct TaskOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl TaskOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        storage: Arc<dyn Storage>,
        source: Arc<dyn PriceSource>,
    ) -> Self {
        let ranking = RankingEngine::new(
            settings.ranking_symbol_batch_size,
            settings.ranking_concurrency,
        );
        let gateway = StorageGateway::new(
            storage,
            settings.storage_write_attempts,
            settings.storage_retry_delay_ms,
        );
        info!(
            "Task orchestrator ready ({} workers, {} attempts per task)",
            settings.max_concurrent_tasks, settings.task_max_attempts
        );
        Self {
            inner: Arc::new(OrchestratorInner {
                pool: WorkerPool::new(settings.max_concurrent_tasks),
                settings,
                storage: gateway,
                source,
                ranking: Arc::new(ranking),
                tasks: DashMap::new(),
                active: DashMap::new(),
                drivers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub async fn submit_label_run(
        &self,
        rule: RuleKind,
        date_range: DateRange,
        params: LabelParams,
    ) -> Result<TaskHandle, PipelineError> {
        let fingerprint = format!(
            "label:{}",
            ledger::canonical_digest(&json!({
                "rule": rule,
                "date_range": date_range,
                "params": params,
            }))?
        );
        Ok(self
            .submit(
                fingerprint,
                TaskJob::LabelRun {
                    rule,
                    range: date_range,
                    params,
                },
            )
            .await)
    }

    pub async fn submit_backtest_run(
        &self,
        strategy_config: StrategyConfig,
        label_name: &str,
        date_range: DateRange,
    ) -> Result<TaskHandle, PipelineError> {
        let request = BacktestRequest {
            strategy_config,
            label_name: label_name.to_string(),
            date_range,
        };
        let fingerprint = format!("backtest:{}", ledger::canonical_digest(&request)?);
        Ok(self.submit(fingerprint, TaskJob::Backtest(request)).await)
    }

    /// A rerun is fingerprinted like a backtest of the experiment's request,
    /// so it joins an identical computation that is already running.
    pub async fn rerun_experiment(&self, experiment_id: &str) -> Result<TaskHandle, PipelineError> {
        let experiment = self.load_live_experiment(experiment_id).await?;
        let fingerprint = format!(
            "backtest:{}",
            ledger::canonical_digest(&experiment.backtest_request())?
        );
        Ok(self
            .submit(
                fingerprint,
                TaskJob::Rerun {
                    experiment_id: experiment_id.to_string(),
                },
            )
            .await)
    }

    async fn submit(&self, fingerprint: String, job: TaskJob) -> TaskHandle {
        let (handle, events, upstream) = match self.inner.active.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) => match self.live(&occupied.get().task_id) {
                Some((existing, events)) if occupied.get().job.shares_outcome_with(&job) => {
                    info!(
                        "{} task {} already active for this request; attaching",
                        job.kind().as_str(),
                        existing.task_id()
                    );
                    return TaskHandle {
                        task_id: existing.task_id().to_string(),
                        attached: true,
                        events,
                    };
                }
                Some((existing, _)) => {
                    let handle = self.register(&fingerprint, job.kind());
                    let events = handle.subscribe();
                    (handle, events, Some(existing))
                }
                None => {
                    let handle = self.register(&fingerprint, job.kind());
                    occupied.insert(ActiveTask {
                        task_id: handle.task_id().to_string(),
                        job: job.clone(),
                    });
                    let events = handle.subscribe();
                    (handle, events, None)
                }
            },
            Entry::Vacant(vacant) => {
                let handle = self.register(&fingerprint, job.kind());
                vacant.insert(ActiveTask {
                    task_id: handle.task_id().to_string(),
                    job: job.clone(),
                });
                let events = handle.subscribe();
                (handle, events, None)
            }
        };

        let task_id = handle.task_id().to_string();
        if let Err(err) = self.inner.storage.put_task(&handle.snapshot()).await {
            warn!("Could not persist queued task {}: {}", task_id, err);
        }
        let attached = match &upstream {
            Some(upstream) => {
                info!(
                    "Queued {} task {} behind identical computation {}",
                    job.kind().as_str(),
                    task_id,
                    upstream.task_id()
                );
                true
            }
            None => {
                info!("Queued {} task {}", job.kind().as_str(), task_id);
                false
            }
        };

        let driver = tokio::spawn(self.clone().drive(handle, job, upstream));
        if let Ok(mut drivers) = self.inner.drivers.lock() {
            drivers.retain(|driver| !driver.is_finished());
            drivers.push(driver);
        }

        TaskHandle {
            task_id,
            attached,
            events,
        }
    }

    /// The task's handle and a fresh subscription, unless it already ended.
    /// Subscribing first guarantees the terminal event is still delivered.
    fn live(
        &self,
        task_id: &str,
    ) -> Option<(TaskStatusHandle, broadcast::Receiver<ProgressEvent>)> {
        let handle = self.handle(task_id)?;
        let events = handle.subscribe();
        (!handle.is_terminal()).then_some((handle, events))
    }

    fn register(&self, fingerprint: &str, kind: TaskKind) -> TaskStatusHandle {
        let task = Task::new(Uuid::new_v4().to_string(), kind, fingerprint.to_string());
        let handle = TaskStatusHandle::new(task, self.inner.settings.progress_channel_capacity);
        self.inner
            .tasks
            .insert(handle.task_id().to_string(), handle.clone());
        handle
    }

    async fn drive(
        self,
        handle: TaskStatusHandle,
        job: TaskJob,
        upstream: Option<TaskStatusHandle>,
    ) {
        let max_attempts = self.inner.settings.task_max_attempts.max(1);
        let mut attempt = 1u32;

        loop {
            match self.run_attempt(&handle, &job, upstream.as_ref()).await {
                Ok(outcome) => {
                    handle.finish_succeeded(outcome);
                    break;
                }
                Err(PipelineError::Canceled) => {
                    handle.finish_canceled();
                    break;
                }
                Err(_) if handle.is_cancel_requested() => {
                    handle.finish_canceled();
                    break;
                }
                Err(err) => {
                    let task_error = TaskError {
                        code: err.code(),
                        message: err.to_string(),
                        attempt,
                    };
                    if err.is_retryable() && attempt < max_attempts {
                        warn!(
                            "Task {} attempt {}/{} failed: {}. Retrying.",
                            handle.task_id(),
                            attempt,
                            max_attempts,
                            err
                        );
                        handle.requeue(task_error);
                        let delay = self.inner.settings.task_retry_delay_ms * attempt as u64;
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                    } else {
                        error!(
                            "Task {} failed on attempt {}/{}: {}",
                            handle.task_id(),
                            attempt,
                            max_attempts,
                            err
                        );
                        handle.finish_failed(task_error);
                        break;
                    }
                }
            }
        }

        let task = handle.snapshot();
        if let Err(err) = self.inner.storage.put_task(&task).await {
            warn!("Could not persist final state of task {}: {}", task.task_id, err);
        }
        self.inner
            .active
            .remove_if(&task.fingerprint, |_, active| active.task_id == task.task_id);
        info!(
            "Task {} finished as {} after {} failed attempt(s)",
            task.task_id,
            task.status.as_str(),
            task.retry_count
        );
        self.evict_finished();
    }

    /// Drops the oldest finished tasks beyond the retention cap. Their final
    /// state stays readable through storage.
    fn evict_finished(&self) {
        let retention = self.inner.settings.finished_task_retention;
        let mut finished: Vec<(DateTime<Utc>, String)> = self
            .inner
            .tasks
            .iter()
            .filter_map(|entry| {
                let task = entry.value().snapshot();
                task.status
                    .is_terminal()
                    .then(|| (task.finished_at.unwrap_or(task.created_at), task.task_id))
            })
            .collect();
        if finished.len() <= retention {
            return;
        }
        finished.sort();
        let excess = finished.len() - retention;
        for (_, task_id) in finished.into_iter().take(excess) {
            self.inner
                .tasks
                .remove_if(&task_id, |_, handle| handle.is_terminal());
        }
        debug!("Evicted {} finished task(s) from memory", excess);
    }

    async fn run_attempt(
        &self,
        handle: &TaskStatusHandle,
        job: &TaskJob,
        upstream: Option<&TaskStatusHandle>,
    ) -> Result<TaskOutcome, PipelineError> {
        match job {
            TaskJob::LabelRun {
                rule,
                range,
                params,
            } => {
                let engine = Arc::clone(&self.inner.ranking);
                let source = Arc::clone(&self.inner.source);
                let status = handle.clone();
                let (rule, range, params) = (*rule, *range, params.clone());
                let output = self
                    .dispatch(move || {
                        status.mark_running()?;
                        pipeline::run_label_job(
                            &engine,
                            source.as_ref(),
                            rule,
                            range,
                            &params,
                            &status,
                        )
                    })
                    .await?;

                handle.ensure_not_canceled()?;
                handle.set_progress(
                    95,
                    format!("Persisting {} label entries", output.run.entries.len()),
                );
                self.inner
                    .storage
                    .replace_labels(&output.definition, &output.run.dates, &output.run.entries)
                    .await?;
                Ok(TaskOutcome::Labels {
                    label_name: output.definition.name.clone(),
                    dates: output.run.dates.len(),
                    entries: output.run.entries.len(),
                    excluded: output.run.data_gaps + output.run.excluded,
                })
            }
            TaskJob::Backtest(request) => {
                let result = self
                    .obtain_backtest(handle, request.clone(), upstream)
                    .await?;
                handle.ensure_not_canceled()?;
                handle.set_progress(95, "Persisting backtest result");
                self.inner
                    .storage
                    .save_backtest_result(handle.task_id(), &result)
                    .await?;
                Ok(TaskOutcome::Backtest {
                    result_hash: result.result_hash,
                })
            }
            TaskJob::Rerun { experiment_id } => {
                let experiment = self.load_live_experiment(experiment_id).await?;
                let result = self
                    .obtain_backtest(handle, experiment.backtest_request(), upstream)
                    .await?;
                handle.ensure_not_canceled()?;
                let report = ledger::compare_rerun(&experiment, &result.result_hash);
                match &report.warning {
                    Some(warning) => handle.set_progress(95, format!("Warning: {}", warning)),
                    None => handle.set_progress(95, "Result reproduced"),
                }
                self.inner
                    .storage
                    .save_backtest_result(handle.task_id(), &result)
                    .await?;
                Ok(TaskOutcome::Rerun(report))
            }
        }
    }

    /// Takes the result of the identical computation this task queued behind,
    /// or computes it when there is none or it did not succeed.
    async fn obtain_backtest(
        &self,
        handle: &TaskStatusHandle,
        request: BacktestRequest,
        upstream: Option<&TaskStatusHandle>,
    ) -> Result<BacktestResult, PipelineError> {
        if let Some(upstream) = upstream {
            if self.await_upstream(handle, upstream).await? {
                if let Some(result) = self
                    .inner
                    .storage
                    .get_backtest_result(upstream.task_id())
                    .await?
                {
                    handle.mark_running()?;
                    handle.set_progress(
                        90,
                        format!("Reused result of task {}", upstream.task_id()),
                    );
                    return Ok(result);
                }
            }
            info!(
                "Task {} computing itself; task {} left no result",
                handle.task_id(),
                upstream.task_id()
            );
        }
        self.compute_backtest(handle, request).await
    }

    /// Resolves once `upstream` ends, with whether it succeeded. Canceling
    /// the waiting task ends the wait.
    async fn await_upstream(
        &self,
        handle: &TaskStatusHandle,
        upstream: &TaskStatusHandle,
    ) -> Result<bool, PipelineError> {
        let mut own = handle.watch();
        let mut upstream_state = upstream.watch();
        tokio::select! {
            _ = own.wait_for(|task| task.status.is_terminal()) => Err(PipelineError::Canceled),
            finished = upstream_state.wait_for(|task| task.status.is_terminal()) => Ok(finished
                .map(|task| task.status == TaskStatus::Succeeded)
                .unwrap_or(false)),
        }
    }

    async fn compute_backtest(
        &self,
        handle: &TaskStatusHandle,
        request: BacktestRequest,
    ) -> Result<BacktestResult, PipelineError> {
        let labels = self
            .inner
            .storage
            .get_labels(&request.label_name, request.date_range)
            .await?;
        let definition = self
            .inner
            .storage
            .get_label_definition(&request.label_name)
            .await?;
        let source = Arc::clone(&self.inner.source);
        let status = handle.clone();
        self.dispatch(move || {
            status.mark_running()?;
            pipeline::run_backtest(
                source.as_ref(),
                &request,
                labels,
                definition.as_ref(),
                &status,
            )
        })
        .await
    }

    async fn dispatch<F, T>(&self, work: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.pool.execute(work).await.map_err(|_| {
            PipelineError::ComputationError("pipeline worker dropped the job".to_string())
        })?
    }

    fn handle(&self, task_id: &str) -> Option<TaskStatusHandle> {
        self.inner
            .tasks
            .get(task_id)
            .map(|entry| entry.value().clone())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, PipelineError> {
        if let Some(handle) = self.handle(task_id) {
            return Ok(handle.snapshot());
        }
        self.inner
            .storage
            .get_task(task_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("task {}", task_id)))
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub fn subscribe(&self, task_id: &str) -> Result<broadcast::Receiver<ProgressEvent>, PipelineError> {
        self.handle(task_id)
            .map(|handle| handle.subscribe())
            .ok_or_else(|| PipelineError::NotFound(format!("task {}", task_id)))
    }

    /// Resolves once the task reaches a terminal status.
    pub async fn wait(&self, task_id: &str) -> Result<Task, PipelineError> {
        let Some(handle) = self.handle(task_id) else {
            return self.get_task(task_id).await;
        };
        let mut state = handle.watch();
        let task = state
            .wait_for(|task| task.status.is_terminal())
            .await
            .map(|task| task.clone())
            .map_err(|_| PipelineError::NotFound(format!("task {}", task_id)))?;
        Ok(task)
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<Task, PipelineError> {
        let Some(handle) = self.handle(task_id) else {
            return self.get_task(task_id).await;
        };
        if handle.is_terminal() {
            return Ok(handle.snapshot());
        }
        handle.request_cancel();
        if handle.cancel_if_queued() {
            info!("Canceled queued task {}", task_id);
        } else {
            info!("Cancel requested for running task {}", task_id);
        }
        Ok(handle.snapshot())
    }

    pub async fn get_result(&self, task_id: &str) -> Result<BacktestResult, PipelineError> {
        self.inner
            .storage
            .get_backtest_result(task_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("backtest result for task {}", task_id)))
    }

    pub async fn list_labels(&self) -> Result<Vec<LabelSummary>, PipelineError> {
        self.inner.storage.list_labels().await
    }

    /// The label's definition and its entries within `range`, or within the
    /// span it was computed over.
    pub async fn get_label(
        &self,
        name: &str,
        range: Option<DateRange>,
    ) -> Result<(LabelDefinition, Vec<LabelEntry>), PipelineError> {
        let definition = self
            .inner
            .storage
            .get_label_definition(name)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("label {}", name)))?;
        let range = range.unwrap_or(definition.date_range);
        let entries = self.inner.storage.get_labels(name, range).await?;
        Ok((definition, entries))
    }

    pub async fn delete_label(&self, name: &str) -> Result<(), PipelineError> {
        if !self.inner.storage.delete_label(name).await? {
            return Err(PipelineError::NotFound(format!("label {}", name)));
        }
        info!("Deleted label {}", name);
        Ok(())
    }

    pub async fn save_experiment(&self, result: &BacktestResult) -> Result<Experiment, PipelineError> {
        let experiment = Experiment {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            strategy_config: result.request.strategy_config.clone(),
            label_name: result.request.label_name.clone(),
            date_range: result.request.date_range,
            metrics: result.metrics.clone(),
            result_hash: result.result_hash.clone(),
            soft_deleted_at: None,
        };
        self.inner.storage.insert_experiment(&experiment).await?;
        info!(
            "Saved experiment {} ({} on {})",
            experiment.id, experiment.strategy_config.name, experiment.label_name
        );
        Ok(experiment)
    }

    pub async fn list_experiments(&self, include_deleted: bool) -> Result<Vec<Experiment>, PipelineError> {
        self.inner.storage.list_experiments(include_deleted).await
    }

    pub async fn get_experiment(&self, experiment_id: &str) -> Result<Experiment, PipelineError> {
        self.inner
            .storage
            .get_experiment(experiment_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("experiment {}", experiment_id)))
    }

    async fn load_live_experiment(&self, experiment_id: &str) -> Result<Experiment, PipelineError> {
        let experiment = self.get_experiment(experiment_id).await?;
        if experiment.is_deleted() {
            return Err(PipelineError::NotFound(format!(
                "experiment {} was deleted",
                experiment_id
            )));
        }
        Ok(experiment)
    }

    /// Soft delete; deleting twice is a no-op.
    pub async fn delete_experiment(&self, experiment_id: &str) -> Result<Experiment, PipelineError> {
        let mut experiment = self.get_experiment(experiment_id).await?;
        if experiment.is_deleted() {
            return Ok(experiment);
        }
        experiment.soft_deleted_at = Some(Utc::now());
        self.inner.storage.update_experiment(&experiment).await?;
        info!("Deleted experiment {}", experiment_id);
        Ok(experiment)
    }

    /// Accepts the result of a finished rerun as the experiment's new record.
    pub async fn confirm_rerun(&self, task_id: &str) -> Result<Experiment, PipelineError> {
        let task = self.get_task(task_id).await?;
        let report = match (&task.status, task.outcome) {
            (TaskStatus::Succeeded, Some(TaskOutcome::Rerun(report))) => report,
            _ => {
                return Err(PipelineError::InvalidConfig(format!(
                    "task {} is not a completed experiment rerun",
                    task_id
                )))
            }
        };

        let mut experiment = self.load_live_experiment(&report.experiment_id).await?;
        if report.matches {
            return Ok(experiment);
        }
        let result = self.get_result(task_id).await?;
        experiment.metrics = result.metrics;
        experiment.result_hash = result.result_hash;
        self.inner.storage.update_experiment(&experiment).await?;
        warn!(
            "Experiment {} now records hash {} (was {})",
            experiment.id, experiment.result_hash, report.stored_hash
        );
        Ok(experiment)
    }

    /// Cancels outstanding tasks and waits for their drivers to finish.
    pub async fn shutdown(&self) {
        for entry in self.inner.tasks.iter() {
            let handle = entry.value();
            if !handle.is_terminal() {
                handle.request_cancel();
                handle.cancel_if_queued();
            }
        }
        let drivers = match self.inner.drivers.lock() {
            Ok(mut drivers) => std::mem::take(&mut *drivers),
            Err(_) => Vec::new(),
        };
        for outcome in join_all(drivers).await {
            if let Err(err) = outcome {
                warn!("Task driver ended abnormally: {}", err);
            }
        }
        let inner = Arc::clone(&self.inner);
        if let Err(err) = tokio::task::spawn_blocking(move || inner.pool.shutdown()).await {
            warn!("Worker pool shutdown ended abnormally: {}", err);
        }
        info!("Task orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_context::MarketData;
    use crate::storage::InMemoryStorage;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn universe() -> MarketData {
        let mut bars = Vec::new();
        for (idx, symbol) in ["AAA", "BBB", "CCC", "DDD"].iter().enumerate() {
            for day in 1..=12 {
                let swing = if day % 2 == 0 { 0.5 * (idx as f64 + 1.0) } else { 0.0 };
                let close = 10.0 + idx as f64 + swing;
                bars.push(PriceBar {
                    symbol: symbol.to_string(),
                    date: d(day),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1_000,
                    adjusted_close: close,
                });
            }
        }
        MarketData::from_bars(bars).unwrap()
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            max_concurrent_tasks: 2,
            task_retry_delay_ms: 1,
            storage_retry_delay_ms: 1,
            ranking_concurrency: 2,
            ..Default::default()
        }
    }

    fn orchestrator() -> TaskOrchestrator {
        TaskOrchestrator::new(
            settings(),
            Arc::new(InMemoryStorage::new()),
            Arc::new(universe()),
        )
    }

    fn range() -> DateRange {
        DateRange::new(d(1), d(12)).unwrap()
    }

    fn drops_params() -> LabelParams {
        LabelParams {
            top_k: 2,
            label_name: Some("drops".to_string()),
            filters: LabelFilters::default(),
        }
    }

    fn reversal() -> StrategyConfig {
        StrategyConfig {
            name: "bounce".to_string(),
            version: 1,
            kind: StrategyKind::Reversal,
            buy_timing: ExecutionTiming::Open,
            sell_timing: ExecutionTiming::Close,
            hold_days: 2,
            execution_frequency_days: 3,
            execution_count: 2,
            top_k: 2,
            positioning: PositionSizing::EqualWeight,
            initial_capital: 1_000.0,
            filter_rules: StrategyFilterRules::default(),
        }
    }

    async fn labeled(orchestrator: &TaskOrchestrator) -> Task {
        let handle = orchestrator
            .submit_label_run(RuleKind::LargestDrop, range(), drops_params())
            .await
            .unwrap();
        orchestrator.wait(&handle.task_id).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn label_run_commits_entries() {
        let orchestrator = orchestrator();
        let task = labeled(&orchestrator).await;
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.progress, 100);
        match task.outcome {
            Some(TaskOutcome::Labels {
                label_name,
                entries,
                ..
            }) => {
                assert_eq!(label_name, "drops");
                assert!(entries > 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        orchestrator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn incompatible_label_fails_without_retry() {
        let orchestrator = orchestrator();
        labeled(&orchestrator).await;

        let mut config = reversal();
        config.kind = StrategyKind::Momentum;
        let handle = orchestrator
            .submit_backtest_run(config, "drops", range())
            .await
            .unwrap();
        let task = orchestrator.wait(&handle.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(
            task.last_error.map(|err| err.code),
            Some(crate::errors::ErrorCode::InvalidConfig)
        );
        orchestrator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn experiments_rerun_and_soft_delete() {
        let orchestrator = orchestrator();
        labeled(&orchestrator).await;

        let handle = orchestrator
            .submit_backtest_run(reversal(), "drops", range())
            .await
            .unwrap();
        let task = orchestrator.wait(&handle.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        let result = orchestrator.get_result(&handle.task_id).await.unwrap();

        let experiment = orchestrator.save_experiment(&result).await.unwrap();
        let rerun = orchestrator.rerun_experiment(&experiment.id).await.unwrap();
        let rerun_task = orchestrator.wait(&rerun.task_id).await.unwrap();
        match &rerun_task.outcome {
            Some(TaskOutcome::Rerun(report)) => {
                assert!(report.matches);
                assert!(report.warning.is_none());
                assert_eq!(report.new_hash, experiment.result_hash);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let confirmed = orchestrator.confirm_rerun(&rerun.task_id).await.unwrap();
        assert_eq!(confirmed.result_hash, experiment.result_hash);

        let deleted = orchestrator.delete_experiment(&experiment.id).await.unwrap();
        assert!(deleted.is_deleted());
        let again = orchestrator.delete_experiment(&experiment.id).await.unwrap();
        assert_eq!(again.soft_deleted_at, deleted.soft_deleted_at);
        assert!(orchestrator.list_experiments(false).await.unwrap().is_empty());
        assert_eq!(orchestrator.list_experiments(true).await.unwrap().len(), 1);
        assert!(matches!(
            orchestrator.rerun_experiment(&experiment.id).await,
            Err(PipelineError::NotFound(_))
        ));
        orchestrator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn labels_can_be_listed_shown_and_deleted() {
        let orchestrator = orchestrator();
        labeled(&orchestrator).await;

        let labels = orchestrator.list_labels().await.unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].definition.name, "drops");
        assert_eq!(labels[0].definition.rule, RuleKind::LargestDrop);

        let (definition, entries) = orchestrator.get_label("drops", None).await.unwrap();
        assert_eq!(definition.top_k, 2);
        assert_eq!(entries.len(), labels[0].entry_count);
        let one_day = DateRange::new(d(5), d(5)).unwrap();
        let (_, day) = orchestrator.get_label("drops", Some(one_day)).await.unwrap();
        assert!(day.iter().all(|entry| entry.trade_date == d(5)));
        assert!(day.len() <= 2);

        orchestrator.delete_label("drops").await.unwrap();
        assert!(orchestrator.list_labels().await.unwrap().is_empty());
        assert!(matches!(
            orchestrator.delete_label("drops").await,
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            orchestrator.get_label("drops", None).await,
            Err(PipelineError::NotFound(_))
        ));
        orchestrator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finished_tasks_beyond_retention_are_served_from_storage() {
        let orchestrator = TaskOrchestrator::new(
            OrchestratorSettings {
                finished_task_retention: 1,
                ..settings()
            },
            Arc::new(InMemoryStorage::new()),
            Arc::new(universe()),
        );
        let first = labeled(&orchestrator).await;
        let mut params = drops_params();
        params.top_k = 1;
        let handle = orchestrator
            .submit_label_run(RuleKind::LargestDrop, range(), params)
            .await
            .unwrap();
        orchestrator.wait(&handle.task_id).await.unwrap();
        orchestrator.shutdown().await;

        let in_memory = orchestrator.list_tasks();
        assert_eq!(in_memory.len(), 1);
        assert_eq!(in_memory[0].task_id, handle.task_id);
        assert!(orchestrator.subscribe(&first.task_id).is_err());
        let evicted = orchestrator.get_task(&first.task_id).await.unwrap();
        assert_eq!(evicted.status, TaskStatus::Succeeded);
        let waited = orchestrator.wait(&first.task_id).await.unwrap();
        assert_eq!(waited.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn shutdown_yields_while_workers_drain() {
        let orchestrator = orchestrator();
        let _slow = orchestrator
            .inner
            .pool
            .execute(|| std::thread::sleep(Duration::from_millis(200)));
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        orchestrator.shutdown().await;
        ticker.abort();
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_ids_are_not_found() {
        let orchestrator = orchestrator();
        assert!(matches!(
            orchestrator.cancel_task("missing").await,
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            orchestrator.get_result("missing").await,
            Err(PipelineError::NotFound(_))
        ));
        assert!(orchestrator.subscribe("missing").is_err());
        assert!(orchestrator.list_tasks().is_empty());
        orchestrator.shutdown().await;
    }
}
