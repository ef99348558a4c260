use crate::config::OrchestratorSettings;
use crate::data_context::{MarketData, PriceSource, StoredPrices};
use crate::database::PostgresStorage;
use crate::orchestrator::TaskOrchestrator;
use crate::storage::{InMemoryStorage, Storage};
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
    settings: OrchestratorSettings,
}

impl AppContext {
    pub async fn initialize(database_url: Option<String>) -> Result<Self> {
        let settings = OrchestratorSettings::from_env()?;
        let database_url = database_url.filter(|url| !url.trim().is_empty());
        Ok(Self {
            database_url,
            settings,
        })
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn has_database(&self) -> bool {
        self.database_url.is_some()
    }

    pub async fn database(&self) -> Result<PostgresStorage> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed commands."
            ));
        };
        let db = PostgresStorage::new(database_url).await?;
        db.ensure_schema().await?;
        Ok(db)
    }

    /// PostgreSQL when `DATABASE_URL` is set, otherwise a process-local store.
    pub async fn storage(&self) -> Result<Arc<dyn Storage>> {
        if self.database_url.is_some() {
            return Ok(Arc::new(self.database().await?));
        }
        warn!("DATABASE_URL not provided. Using in-memory storage; nothing outlives this process.");
        Ok(Arc::new(InMemoryStorage::new()))
    }

    /// Prices from a snapshot file when given, otherwise read from storage
    /// symbol by symbol as jobs need them.
    pub async fn price_source(
        &self,
        storage: &Arc<dyn Storage>,
        data_file: Option<&Path>,
    ) -> Result<Arc<dyn PriceSource>> {
        match data_file {
            Some(path) => {
                let market_data = MarketData::load_from_file(path)?;
                if !market_data.has_data() {
                    return Err(anyhow!("Snapshot {} holds no price bars.", path.display()));
                }
                info!(
                    "Price universe ready with {} bars from {}",
                    market_data.bar_count(),
                    path.display()
                );
                Ok(Arc::new(market_data))
            }
            None => {
                let prices = StoredPrices::load(Arc::clone(storage)).await?;
                if !prices.has_data() {
                    return Err(anyhow!(
                        "No price bars available. Import prices or pass --data-file with a snapshot."
                    ));
                }
                Ok(Arc::new(prices))
            }
        }
    }

    pub async fn orchestrator(&self, data_file: Option<&Path>) -> Result<TaskOrchestrator> {
        let storage = self.storage().await?;
        let source = self.price_source(&storage, data_file).await?;
        Ok(TaskOrchestrator::new(self.settings.clone(), storage, source))
    }

    /// For commands that only touch stored experiments and tasks.
    pub async fn orchestrator_without_prices(&self) -> Result<TaskOrchestrator> {
        let storage = self.storage().await?;
        Ok(TaskOrchestrator::new(
            self.settings.clone(),
            storage,
            Arc::new(MarketData::from_bars(Vec::new())?),
        ))
    }
}
