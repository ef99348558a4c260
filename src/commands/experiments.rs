use crate::context::AppContext;
use crate::models::Experiment;
use anyhow::Result;
use log::info;

pub async fn list(app: &AppContext, include_deleted: bool) -> Result<()> {
    let orchestrator = app.orchestrator_without_prices().await?;
    let experiments = orchestrator.list_experiments(include_deleted).await?;
    if experiments.is_empty() {
        info!("No experiments stored");
    }
    for experiment in &experiments {
        println!(
            "{}  {}  {} v{}  {}  {}  total_return={:.4}  sharpe={:.4}{}",
            experiment.id,
            experiment.created_at.format("%Y-%m-%d %H:%M"),
            experiment.strategy_config.name,
            experiment.strategy_config.version,
            experiment.label_name,
            experiment.date_range,
            experiment.metrics.total_return,
            experiment.metrics.sharpe_ratio,
            if experiment.is_deleted() { "  (deleted)" } else { "" }
        );
    }
    orchestrator.shutdown().await;
    Ok(())
}

pub async fn show(app: &AppContext, experiment_id: &str) -> Result<()> {
    let orchestrator = app.orchestrator_without_prices().await?;
    let experiment = orchestrator.get_experiment(experiment_id).await;
    orchestrator.shutdown().await;
    print_experiment(&experiment?)
}

pub async fn delete(app: &AppContext, experiment_id: &str) -> Result<()> {
    let orchestrator = app.orchestrator_without_prices().await?;
    let deleted = orchestrator.delete_experiment(experiment_id).await;
    orchestrator.shutdown().await;
    let deleted = deleted?;
    info!(
        "Experiment {} marked deleted at {}",
        deleted.id,
        deleted
            .soft_deleted_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default()
    );
    Ok(())
}

fn print_experiment(experiment: &Experiment) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(experiment)?);
    Ok(())
}
