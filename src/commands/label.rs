use super::progress::{ensure_succeeded, follow};
use crate::context::AppContext;
use crate::models::{DateRange, LabelParams, RuleKind, Task, TaskOutcome};
use crate::orchestrator::TaskOrchestrator;
use anyhow::Result;
use log::info;
use std::path::Path;

pub async fn run(
    app: &AppContext,
    data_file: Option<&Path>,
    rule: RuleKind,
    date_range: DateRange,
    params: LabelParams,
) -> Result<()> {
    let orchestrator = app.orchestrator(data_file).await?;
    let outcome = compute(&orchestrator, rule, date_range, params).await;
    orchestrator.shutdown().await;
    outcome.map(|_| ())
}

/// Runs one label job to completion on an existing orchestrator.
pub async fn compute(
    orchestrator: &TaskOrchestrator,
    rule: RuleKind,
    date_range: DateRange,
    params: LabelParams,
) -> Result<Task> {
    info!(
        "Generating {} labels (top {}) for {}",
        rule, params.top_k, date_range
    );
    let handle = orchestrator
        .submit_label_run(rule, date_range, params)
        .await?;
    let task = follow(orchestrator, handle).await?;
    ensure_succeeded(&task)?;

    if let Some(TaskOutcome::Labels {
        label_name,
        dates,
        entries,
        excluded,
    }) = &task.outcome
    {
        info!(
            "Label {} stored: {} entries over {} sessions ({} symbol-days skipped)",
            label_name, entries, dates, excluded
        );
    }
    Ok(task)
}
