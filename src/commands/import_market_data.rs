use crate::context::AppContext;
use crate::data_context::MarketData;
use crate::models::PriceBar;
use crate::storage::Storage;
use anyhow::{Context, Result};
use log::info;
use std::path::Path;

pub async fn run(app: &AppContext, input_path: &Path) -> Result<()> {
    let market_data = MarketData::load_from_file(input_path)?;
    let bars: Vec<PriceBar> = market_data.all_bars().cloned().collect();

    let db = app.database().await?;
    let inserted = db
        .insert_price_bars(&bars)
        .await
        .with_context(|| format!("Failed to import {}", input_path.display()))?;
    info!(
        "Imported {} price bars from {}",
        inserted,
        input_path.display()
    );
    Ok(())
}
