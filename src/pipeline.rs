use crate::data_context::{PriceBook, PriceSource};
use crate::errors::PipelineError;
use crate::ledger;
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::ranking::{LabelRun, RankingEngine};
use crate::signals::{group_labels, SignalGenerator};
use crate::simulator::PortfolioSimulator;
use crate::task_status::TaskStatusHandle;
use chrono::Utc;
use log::info;
use std::collections::BTreeSet;

/// A computed label set ready to be committed.
#[derive(Debug, Clone)]
pub struct LabelRunOutput {
    pub definition: LabelDefinition,
    pub run: LabelRun,
}

pub fn run_label_job(
    engine: &RankingEngine,
    source: &dyn PriceSource,
    rule: RuleKind,
    range: DateRange,
    params: &LabelParams,
    status: &TaskStatusHandle,
) -> Result<LabelRunOutput, PipelineError> {
    let label_name = params.resolved_label_name(rule);
    info!("Computing label {} ({}) for {}", label_name, rule, range);

    let run = engine.rank_range(
        source,
        rule,
        range,
        params.top_k,
        &params.filters,
        &label_name,
        status,
    )?;

    Ok(LabelRunOutput {
        definition: LabelDefinition {
            name: label_name,
            rule,
            top_k: params.top_k,
            filters: params.filters.clone(),
            date_range: range,
            created_at: Utc::now(),
        },
        run,
    })
}

/// Runs signals, simulation, metrics and hashing for one request against
/// labels already read from storage.
pub fn run_backtest(
    source: &dyn PriceSource,
    request: &BacktestRequest,
    labels: Vec<LabelEntry>,
    definition: Option<&LabelDefinition>,
    status: &TaskStatusHandle,
) -> Result<BacktestResult, PipelineError> {
    let config = &request.strategy_config;
    let generator = SignalGenerator::new(config, definition)?;

    let labels = group_labels(labels);
    if labels.is_empty() {
        return Err(PipelineError::EmptySignalSet(format!(
            "label {} has no entries in {}",
            request.label_name, request.date_range
        )));
    }
    status.checkpoint(5, "Loaded labels")?;

    let calendar = source.trading_dates(request.date_range.start, request.date_range.end);
    let plans = generator.plan_all(&labels, &calendar);
    if plans.is_empty() {
        return Err(PipelineError::InsufficientHistory(format!(
            "{} sessions in {} cannot fit one {}-day hold after a labeled session",
            calendar.len(),
            request.date_range,
            config.hold_days
        )));
    }

    let symbols: BTreeSet<String> = plans
        .iter()
        .filter_map(|plan| labels.get(&plan.label_date))
        .flat_map(|day| day.iter().map(|entry| entry.symbol.clone()))
        .collect();
    let book = PriceBook::load(source, calendar, symbols, request.date_range);
    status.checkpoint(
        15,
        format!("Loaded prices ({} symbols unavailable)", book.unavailable_symbols()),
    )?;

    let batches = generator.generate_all(&labels, &book, status, (15, 30))?;
    let buy_count: usize = batches.iter().map(|batch| batch.buys().count()).sum();
    if buy_count == 0 {
        return Err(PipelineError::EmptySignalSet(format!(
            "{} batches produced no tradable buy signal",
            batches.len()
        )));
    }
    let excluded_symbols = batches.iter().map(|batch| batch.excluded_symbols).sum();

    let (equity_curve, trades) =
        PortfolioSimulator::new(config, &book).simulate(&batches, status, (30, 85))?;
    let metrics = PerformanceCalculator::calculate(&equity_curve, &trades)?;
    status.checkpoint(90, "Computed metrics")?;

    let price_fingerprint = ledger::price_fingerprint(book.bars());
    let result_hash = ledger::result_hash(
        config,
        &request.label_name,
        &price_fingerprint,
        &metrics,
        &trades,
    )?;
    info!(
        "Backtest {} on {}: total return {:.4}, {} trades, hash {}",
        config.name, request.label_name, metrics.total_return, trades.len(), result_hash
    );

    Ok(BacktestResult {
        request: request.clone(),
        metrics,
        equity_curve,
        trades,
        batch_count: batches.len(),
        excluded_symbols,
        price_fingerprint,
        result_hash,
    })
}
