use crate::context::AppContext;
use crate::data_context::MarketData;
use crate::models::DateRange;
use anyhow::Result;
use log::info;
use std::path::Path;

pub async fn run(app: &AppContext, output_path: &Path, range: Option<DateRange>) -> Result<()> {
    info!(
        "Generating market data snapshot at {}",
        output_path.display()
    );

    let db = app.database().await?;
    let market_data = MarketData::load(&db, range).await?;

    market_data.save_to_file(output_path)?;
    info!(
        "Market data snapshot with {} bars written to {}",
        market_data.bar_count(),
        output_path.display()
    );

    Ok(())
}
