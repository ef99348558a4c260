use crate::errors::PipelineError;
use crate::models::*;
use crate::retry::retry_storage_operation;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// Persistence for everything the pipeline reads or produces.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Inserts bars; fails without writing if any (symbol, date) exists.
    async fn insert_price_bars(&self, bars: &[PriceBar]) -> Result<usize>;
    async fn load_price_bars(&self, range: Option<DateRange>) -> Result<Vec<PriceBar>>;
    async fn price_symbols(&self) -> Result<Vec<String>>;
    /// Every date with at least one bar, ascending.
    async fn price_calendar(&self) -> Result<Vec<NaiveDate>>;
    async fn get_price_bars(&self, symbol: &str, range: DateRange) -> Result<Vec<PriceBar>>;

    /// Upserts the definition and replaces the entries of every listed date.
    async fn replace_labels(
        &self,
        definition: &LabelDefinition,
        dates: &[NaiveDate],
        entries: &[LabelEntry],
    ) -> Result<()>;
    async fn get_label_definition(&self, name: &str) -> Result<Option<LabelDefinition>>;
    async fn get_labels(&self, label_name: &str, range: DateRange) -> Result<Vec<LabelEntry>>;
    async fn list_labels(&self) -> Result<Vec<LabelSummary>>;
    /// Removes the definition and every entry. Returns false when nothing existed.
    async fn delete_label(&self, name: &str) -> Result<bool>;

    async fn save_backtest_result(&self, task_id: &str, result: &BacktestResult) -> Result<()>;
    async fn get_backtest_result(&self, task_id: &str) -> Result<Option<BacktestResult>>;

    async fn insert_experiment(&self, experiment: &Experiment) -> Result<()>;
    async fn update_experiment(&self, experiment: &Experiment) -> Result<()>;
    async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>>;
    async fn list_experiments(&self, include_deleted: bool) -> Result<Vec<Experiment>>;

    async fn put_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;
}

#[derive(Default)]
struct InMemoryState {
    bars: BTreeMap<(String, NaiveDate), PriceBar>,
    label_definitions: HashMap<String, LabelDefinition>,
    labels: BTreeMap<(String, NaiveDate), Vec<LabelEntry>>,
    results: HashMap<String, BacktestResult>,
    experiments: BTreeMap<String, Experiment>,
    tasks: HashMap<String, Task>,
}

/// Process-local storage used by tests and offline CLI runs.
#[derive(Default, Clone)]
pub struct InMemoryStorage {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut InMemoryState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("in-memory storage lock poisoned"))?;
        f(&mut state)
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_price_bars(&self, bars: &[PriceBar]) -> Result<usize> {
        self.with_state(|state| {
            let mut seen = std::collections::HashSet::new();
            for bar in bars {
                let key = (bar.symbol.clone(), bar.date);
                if state.bars.contains_key(&key) || !seen.insert(key) {
                    return Err(anyhow!(
                        "Price bar for {} on {} already exists",
                        bar.symbol,
                        bar.date
                    ));
                }
            }
            for bar in bars {
                state
                    .bars
                    .insert((bar.symbol.clone(), bar.date), bar.clone());
            }
            Ok(bars.len())
        })
    }

    async fn load_price_bars(&self, range: Option<DateRange>) -> Result<Vec<PriceBar>> {
        self.with_state(|state| {
            Ok(state
                .bars
                .values()
                .filter(|bar| range.map_or(true, |range| range.contains(bar.date)))
                .cloned()
                .collect())
        })
    }

    async fn price_symbols(&self) -> Result<Vec<String>> {
        self.with_state(|state| {
            let mut symbols: Vec<String> = state
                .bars
                .keys()
                .map(|(symbol, _)| symbol.clone())
                .collect();
            symbols.dedup();
            Ok(symbols)
        })
    }

    async fn price_calendar(&self) -> Result<Vec<NaiveDate>> {
        self.with_state(|state| {
            let dates: BTreeSet<NaiveDate> = state.bars.keys().map(|(_, date)| *date).collect();
            Ok(dates.into_iter().collect())
        })
    }

    async fn get_price_bars(&self, symbol: &str, range: DateRange) -> Result<Vec<PriceBar>> {
        self.with_state(|state| {
            let from = (symbol.to_string(), range.start);
            let to = (symbol.to_string(), range.end);
            Ok(state.bars.range(from..=to).map(|(_, bar)| bar.clone()).collect())
        })
    }

    async fn replace_labels(
        &self,
        definition: &LabelDefinition,
        dates: &[NaiveDate],
        entries: &[LabelEntry],
    ) -> Result<()> {
        self.with_state(|state| {
            let mut stored = definition.clone();
            if let Some(previous) = state.label_definitions.get(&definition.name) {
                stored.date_range = DateRange {
                    start: previous.date_range.start.min(definition.date_range.start),
                    end: previous.date_range.end.max(definition.date_range.end),
                };
            }
            state
                .label_definitions
                .insert(definition.name.clone(), stored);
            for date in dates {
                state.labels.remove(&(definition.name.clone(), *date));
            }
            for entry in entries {
                state
                    .labels
                    .entry((entry.label_name.clone(), entry.trade_date))
                    .or_default()
                    .push(entry.clone());
            }
            Ok(())
        })
    }

    async fn get_label_definition(&self, name: &str) -> Result<Option<LabelDefinition>> {
        self.with_state(|state| Ok(state.label_definitions.get(name).cloned()))
    }

    async fn get_labels(&self, label_name: &str, range: DateRange) -> Result<Vec<LabelEntry>> {
        self.with_state(|state| {
            let from = (label_name.to_string(), range.start);
            let to = (label_name.to_string(), range.end);
            let mut entries: Vec<LabelEntry> = state
                .labels
                .range(from..=to)
                .flat_map(|(_, day)| day.iter().cloned())
                .collect();
            entries.sort_by(|a, b| a.trade_date.cmp(&b.trade_date).then(a.rank.cmp(&b.rank)));
            Ok(entries)
        })
    }

    async fn list_labels(&self) -> Result<Vec<LabelSummary>> {
        self.with_state(|state| {
            let mut summaries: Vec<LabelSummary> = state
                .label_definitions
                .values()
                .map(|definition| {
                    let from = (definition.name.clone(), NaiveDate::MIN);
                    let to = (definition.name.clone(), NaiveDate::MAX);
                    let days: Vec<(&NaiveDate, usize)> = state
                        .labels
                        .range(from..=to)
                        .filter(|(_, day)| !day.is_empty())
                        .map(|((_, date), day)| (date, day.len()))
                        .collect();
                    LabelSummary {
                        definition: definition.clone(),
                        entry_count: days.iter().map(|(_, count)| count).sum(),
                        first_date: days.first().map(|(date, _)| **date),
                        last_date: days.last().map(|(date, _)| **date),
                    }
                })
                .collect();
            summaries.sort_by(|a, b| {
                b.definition
                    .created_at
                    .cmp(&a.definition.created_at)
                    .then(a.definition.name.cmp(&b.definition.name))
            });
            Ok(summaries)
        })
    }

    async fn delete_label(&self, name: &str) -> Result<bool> {
        self.with_state(|state| {
            let existed = state.label_definitions.remove(name).is_some();
            let before = state.labels.len();
            state.labels.retain(|(label_name, _), _| label_name != name);
            Ok(existed || state.labels.len() != before)
        })
    }

    async fn save_backtest_result(&self, task_id: &str, result: &BacktestResult) -> Result<()> {
        self.with_state(|state| {
            state.results.insert(task_id.to_string(), result.clone());
            Ok(())
        })
    }

    async fn get_backtest_result(&self, task_id: &str) -> Result<Option<BacktestResult>> {
        self.with_state(|state| Ok(state.results.get(task_id).cloned()))
    }

    async fn insert_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.with_state(|state| {
            if state.experiments.contains_key(&experiment.id) {
                return Err(anyhow!("Experiment {} already exists", experiment.id));
            }
            state
                .experiments
                .insert(experiment.id.clone(), experiment.clone());
            Ok(())
        })
    }

    async fn update_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.with_state(|state| match state.experiments.get_mut(&experiment.id) {
            Some(existing) => {
                *existing = experiment.clone();
                Ok(())
            }
            None => Err(anyhow!("Experiment {} does not exist", experiment.id)),
        })
    }

    async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        self.with_state(|state| Ok(state.experiments.get(id).cloned()))
    }

    async fn list_experiments(&self, include_deleted: bool) -> Result<Vec<Experiment>> {
        self.with_state(|state| {
            let mut experiments: Vec<Experiment> = state
                .experiments
                .values()
                .filter(|experiment| include_deleted || !experiment.is_deleted())
                .cloned()
                .collect();
            experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
            Ok(experiments)
        })
    }

    async fn put_task(&self, task: &Task) -> Result<()> {
        self.with_state(|state| {
            state.tasks.insert(task.task_id.clone(), task.clone());
            Ok(())
        })
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.with_state(|state| Ok(state.tasks.get(task_id).cloned()))
    }
}

/// Funnels every write through one async mutex; reads go straight through.
pub struct StorageGateway {
    storage: Arc<dyn Storage>,
    write_lock: AsyncMutex<()>,
    write_attempts: u32,
    retry_delay_ms: u64,
}

impl StorageGateway {
    pub fn new(storage: Arc<dyn Storage>, write_attempts: u32, retry_delay_ms: u64) -> Self {
        Self {
            storage,
            write_lock: AsyncMutex::new(()),
            write_attempts,
            retry_delay_ms,
        }
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    pub async fn replace_labels(
        &self,
        definition: &LabelDefinition,
        dates: &[NaiveDate],
        entries: &[LabelEntry],
    ) -> Result<(), PipelineError> {
        let _guard = self.write_lock.lock().await;
        retry_storage_operation!(
            format!("replace labels {}", definition.name),
            self.write_attempts,
            self.retry_delay_ms,
            self.storage.replace_labels(definition, dates, entries)
        )
        .map_err(PipelineError::storage)
    }

    pub async fn save_backtest_result(
        &self,
        task_id: &str,
        result: &BacktestResult,
    ) -> Result<(), PipelineError> {
        let _guard = self.write_lock.lock().await;
        retry_storage_operation!(
            format!("save backtest result {}", task_id),
            self.write_attempts,
            self.retry_delay_ms,
            self.storage.save_backtest_result(task_id, result)
        )
        .map_err(PipelineError::storage)
    }

    pub async fn insert_experiment(&self, experiment: &Experiment) -> Result<(), PipelineError> {
        let _guard = self.write_lock.lock().await;
        retry_storage_operation!(
            format!("insert experiment {}", experiment.id),
            self.write_attempts,
            self.retry_delay_ms,
            self.storage.insert_experiment(experiment)
        )
        .map_err(PipelineError::storage)
    }

    pub async fn update_experiment(&self, experiment: &Experiment) -> Result<(), PipelineError> {
        let _guard = self.write_lock.lock().await;
        retry_storage_operation!(
            format!("update experiment {}", experiment.id),
            self.write_attempts,
            self.retry_delay_ms,
            self.storage.update_experiment(experiment)
        )
        .map_err(PipelineError::storage)
    }

    pub async fn put_task(&self, task: &Task) -> Result<(), PipelineError> {
        let _guard = self.write_lock.lock().await;
        retry_storage_operation!(
            format!("persist task {}", task.task_id),
            self.write_attempts,
            self.retry_delay_ms,
            self.storage.put_task(task)
        )
        .map_err(PipelineError::storage)
    }

    pub async fn delete_label(&self, name: &str) -> Result<bool, PipelineError> {
        let _guard = self.write_lock.lock().await;
        retry_storage_operation!(
            format!("delete label {}", name),
            self.write_attempts,
            self.retry_delay_ms,
            self.storage.delete_label(name)
        )
        .map_err(PipelineError::storage)
    }

    pub async fn list_labels(&self) -> Result<Vec<LabelSummary>, PipelineError> {
        self.storage
            .list_labels()
            .await
            .map_err(PipelineError::storage)
    }

    pub async fn get_label_definition(
        &self,
        name: &str,
    ) -> Result<Option<LabelDefinition>, PipelineError> {
        self.storage
            .get_label_definition(name)
            .await
            .map_err(PipelineError::storage)
    }

    pub async fn get_labels(
        &self,
        label_name: &str,
        range: DateRange,
    ) -> Result<Vec<LabelEntry>, PipelineError> {
        self.storage
            .get_labels(label_name, range)
            .await
            .map_err(PipelineError::storage)
    }

    pub async fn get_backtest_result(
        &self,
        task_id: &str,
    ) -> Result<Option<BacktestResult>, PipelineError> {
        self.storage
            .get_backtest_result(task_id)
            .await
            .map_err(PipelineError::storage)
    }

    pub async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>, PipelineError> {
        self.storage
            .get_experiment(id)
            .await
            .map_err(PipelineError::storage)
    }

    pub async fn list_experiments(
        &self,
        include_deleted: bool,
    ) -> Result<Vec<Experiment>, PipelineError> {
        self.storage
            .list_experiments(include_deleted)
            .await
            .map_err(PipelineError::storage)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, PipelineError> {
        self.storage
            .get_task(task_id)
            .await
            .map_err(PipelineError::storage)
    }
}
