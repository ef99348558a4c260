use crate::context::AppContext;
use crate::models::{DateRange, RuleKind};
use anyhow::Result;
use log::info;

pub async fn list(app: &AppContext) -> Result<()> {
    let orchestrator = app.orchestrator_without_prices().await?;
    let labels = orchestrator.list_labels().await;
    orchestrator.shutdown().await;
    let labels = labels?;
    if labels.is_empty() {
        info!("No labels stored");
    }
    for summary in &labels {
        let definition = &summary.definition;
        let span = match (summary.first_date, summary.last_date) {
            (Some(first), Some(last)) => format!("{} - {}", first, last),
            _ => "empty".to_string(),
        };
        println!(
            "{}  {}  top{}  {}  entries={}  created={}",
            definition.name,
            definition.rule,
            definition.top_k,
            span,
            summary.entry_count,
            definition.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub async fn show(app: &AppContext, name: &str, range: Option<DateRange>) -> Result<()> {
    let orchestrator = app.orchestrator_without_prices().await?;
    let label = orchestrator.get_label(name, range).await;
    orchestrator.shutdown().await;
    let (definition, entries) = label?;

    println!("{}", serde_json::to_string_pretty(&definition)?);
    for entry in &entries {
        println!(
            "{}  #{:<3} {:<10} {:.4}",
            entry.trade_date, entry.rank, entry.symbol, entry.score
        );
    }
    Ok(())
}

pub async fn delete(app: &AppContext, name: &str) -> Result<()> {
    let orchestrator = app.orchestrator_without_prices().await?;
    let deleted = orchestrator.delete_label(name).await;
    orchestrator.shutdown().await;
    deleted?;
    info!("Label {} deleted", name);
    Ok(())
}

pub fn rules() {
    for rule in RuleKind::ALL {
        println!("{:<18} {}", rule.as_str(), rule.description());
    }
}
