use super::label;
use super::progress::{ensure_succeeded, follow};
use crate::context::AppContext;
use crate::models::{BacktestResult, DateRange, LabelParams, RuleKind, StrategyConfig};
use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::Path;

pub struct BacktestOptions<'a> {
    pub data_file: Option<&'a Path>,
    pub config_path: &'a Path,
    pub label_name: &'a str,
    pub date_range: DateRange,
    /// Computes the label in this run before backtesting it.
    pub label_rule: Option<RuleKind>,
    pub save_experiment: bool,
    pub output: Option<&'a Path>,
}

pub fn load_strategy_config(path: &Path) -> Result<StrategyConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read strategy config {}", path.display()))?;
    let config: StrategyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid strategy config in {}", path.display()))?;
    Ok(config)
}

pub async fn run(app: &AppContext, options: BacktestOptions<'_>) -> Result<()> {
    let config = load_strategy_config(options.config_path)?;
    let orchestrator = app.orchestrator(options.data_file).await?;

    let outcome = async {
        if let Some(rule) = options.label_rule {
            let params = LabelParams {
                top_k: config.top_k,
                label_name: Some(options.label_name.to_string()),
                ..Default::default()
            };
            label::compute(&orchestrator, rule, options.date_range, params).await?;
        }

        info!(
            "Backtesting {} v{} on {} over {}",
            config.name, config.version, options.label_name, options.date_range
        );
        let handle = orchestrator
            .submit_backtest_run(config.clone(), options.label_name, options.date_range)
            .await?;
        let task_id = handle.task_id.clone();
        let task = follow(&orchestrator, handle).await?;
        ensure_succeeded(&task)?;

        let result = orchestrator.get_result(&task_id).await?;
        report(&result);
        if let Some(path) = options.output {
            let body = serde_json::to_string_pretty(&result)?;
            fs::write(path, body)
                .with_context(|| format!("Failed to write result to {}", path.display()))?;
            info!("Backtest result written to {}", path.display());
        }
        if options.save_experiment {
            let experiment = orchestrator.save_experiment(&result).await?;
            println!("experiment_id: {}", experiment.id);
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    orchestrator.shutdown().await;
    outcome
}

fn report(result: &BacktestResult) {
    let metrics = &result.metrics;
    println!("result_hash:      {}", result.result_hash);
    println!("batches:          {}", result.batch_count);
    println!(
        "trades:           {} ({} priced)",
        metrics.total_trades, metrics.priced_trades
    );
    println!("total_return:     {:.4}", metrics.total_return);
    println!("ann_return:       {:.4}", metrics.ann_return);
    println!("max_drawdown:     {:.4}", metrics.max_drawdown);
    println!("sharpe_ratio:     {:.4}", metrics.sharpe_ratio);
    println!("calmar_ratio:     {:.4}", metrics.calmar_ratio);
    println!("win_rate:         {:.4}", metrics.win_rate);
    println!("avg_trade_return: {:.4}", metrics.avg_trade_return);
    if result.excluded_symbols > 0 {
        println!("excluded_symbols: {}", result.excluded_symbols);
    }
}
