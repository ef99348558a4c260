use super::progress::{ensure_succeeded, follow};
use crate::context::AppContext;
use crate::models::TaskOutcome;
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::path::Path;

pub async fn run(
    app: &AppContext,
    data_file: Option<&Path>,
    experiment_id: &str,
    accept_new_result: bool,
) -> Result<()> {
    let orchestrator = app.orchestrator(data_file).await?;

    let outcome = async {
        let handle = orchestrator.rerun_experiment(experiment_id).await?;
        let task_id = handle.task_id.clone();
        let task = follow(&orchestrator, handle).await?;
        ensure_succeeded(&task)?;

        let Some(TaskOutcome::Rerun(report)) = task.outcome else {
            return Err(anyhow!("Task {} did not produce a rerun report", task_id));
        };
        println!("stored_hash: {}", report.stored_hash);
        println!("new_hash:    {}", report.new_hash);
        if report.matches {
            info!("Experiment {} reproduced exactly", experiment_id);
            return Ok(());
        }

        warn!(
            "Experiment {} did not reproduce; inputs changed since it was saved",
            experiment_id
        );
        if accept_new_result {
            let updated = orchestrator.confirm_rerun(&task_id).await?;
            info!(
                "Experiment {} now records hash {}",
                updated.id, updated.result_hash
            );
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    orchestrator.shutdown().await;
    outcome
}
