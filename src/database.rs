use crate::models::*;
use crate::storage::Storage;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS price_bars (
    symbol TEXT NOT NULL,
    date DATE NOT NULL,
    open DOUBLE PRECISION NOT NULL,
    high DOUBLE PRECISION NOT NULL,
    low DOUBLE PRECISION NOT NULL,
    close DOUBLE PRECISION NOT NULL,
    volume BIGINT NOT NULL,
    adjusted_close DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (symbol, date)
);
CREATE TABLE IF NOT EXISTS label_definitions (
    name TEXT PRIMARY KEY,
    rule TEXT NOT NULL,
    top_k INTEGER NOT NULL,
    filters JSONB NOT NULL,
    start_date DATE NOT NULL,
    end_date DATE NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS labels (
    label_name TEXT NOT NULL,
    trade_date DATE NOT NULL,
    symbol TEXT NOT NULL,
    score DOUBLE PRECISION NOT NULL,
    rank INTEGER NOT NULL,
    PRIMARY KEY (label_name, trade_date, symbol)
);
CREATE TABLE IF NOT EXISTS backtest_results (
    task_id TEXT PRIMARY KEY,
    result_hash TEXT NOT NULL,
    result JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS experiments (
    id TEXT PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL,
    strategy_config JSONB NOT NULL,
    label_name TEXT NOT NULL,
    start_date DATE NOT NULL,
    end_date DATE NOT NULL,
    metrics JSONB NOT NULL,
    result_hash TEXT NOT NULL,
    soft_deleted_at TIMESTAMPTZ
);
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    body JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
";

pub struct PostgresStorage {
    client: Mutex<Client>,
}

impl PostgresStorage {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self {
            client: Mutex::new(client),
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(SCHEMA)
            .await
            .context("failed to create storage schema")?;
        info!("Storage schema ready");
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<Value> {
    serde_json::to_value(value).with_context(|| format!("failed to encode {}", what))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value).with_context(|| format!("failed to decode {}", what))
}

fn row_to_price_bar(row: &Row) -> PriceBar {
    PriceBar {
        symbol: row.get(0),
        date: row.get(1),
        open: row.get(2),
        high: row.get(3),
        low: row.get(4),
        close: row.get(5),
        volume: row.get(6),
        adjusted_close: row.get(7),
    }
}

fn row_to_label_definition(row: &Row) -> Result<LabelDefinition> {
    let rule: String = row.get(1);
    let top_k: i32 = row.get(2);
    Ok(LabelDefinition {
        name: row.get(0),
        rule: rule.parse()?,
        top_k: top_k.max(0) as usize,
        filters: from_json(row.get(3), "label filters")?,
        date_range: DateRange {
            start: row.get(4),
            end: row.get(5),
        },
        created_at: row.get(6),
    })
}

fn row_to_experiment(row: &Row) -> Result<Experiment> {
    let id: String = row.get(0);
    let start: NaiveDate = row.get(4);
    let end: NaiveDate = row.get(5);
    Ok(Experiment {
        created_at: row.get(1),
        strategy_config: from_json(row.get(2), "strategy config")?,
        label_name: row.get(3),
        date_range: DateRange { start, end },
        metrics: from_json(row.get(6), "metrics")?,
        result_hash: row.get(7),
        soft_deleted_at: row.get(8),
        id,
    })
}

const EXPERIMENT_COLUMNS: &str = "id, created_at, strategy_config, label_name, start_date, end_date, metrics, result_hash, soft_deleted_at";

#[async_trait]
impl Storage for PostgresStorage {
    async fn insert_price_bars(&self, bars: &[PriceBar]) -> Result<usize> {
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        let statement = transaction
            .prepare(
                "INSERT INTO price_bars (symbol, date, open, high, low, close, volume, adjusted_close)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .await?;
        for bar in bars {
            transaction
                .execute(
                    &statement,
                    &[
                        &bar.symbol,
                        &bar.date,
                        &bar.open,
                        &bar.high,
                        &bar.low,
                        &bar.close,
                        &bar.volume,
                        &bar.adjusted_close,
                    ],
                )
                .await
                .with_context(|| format!("Price bar for {} on {} rejected", bar.symbol, bar.date))?;
        }
        transaction.commit().await?;
        Ok(bars.len())
    }

    async fn load_price_bars(&self, range: Option<DateRange>) -> Result<Vec<PriceBar>> {
        let client = self.client.lock().await;
        let rows = match range {
            Some(range) => {
                client
                    .query(
                        "SELECT symbol, date, open, high, low, close, volume, adjusted_close
                         FROM price_bars
                         WHERE date >= $1 AND date <= $2
                         ORDER BY symbol, date",
                        &[&range.start, &range.end],
                    )
                    .await?
            }
            None => {
                client
                    .query(
                        "SELECT symbol, date, open, high, low, close, volume, adjusted_close
                         FROM price_bars
                         ORDER BY symbol, date",
                        &[],
                    )
                    .await?
            }
        };
        Ok(rows.iter().map(row_to_price_bar).collect())
    }

    async fn price_symbols(&self) -> Result<Vec<String>> {
        let client = self.client.lock().await;
        let rows = client
            .query("SELECT DISTINCT symbol FROM price_bars ORDER BY symbol", &[])
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn price_calendar(&self) -> Result<Vec<NaiveDate>> {
        let client = self.client.lock().await;
        let rows = client
            .query("SELECT DISTINCT date FROM price_bars ORDER BY date", &[])
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn get_price_bars(&self, symbol: &str, range: DateRange) -> Result<Vec<PriceBar>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT symbol, date, open, high, low, close, volume, adjusted_close
                 FROM price_bars
                 WHERE symbol = $1 AND date >= $2 AND date <= $3
                 ORDER BY date",
                &[&symbol, &range.start, &range.end],
            )
            .await?;
        Ok(rows.iter().map(row_to_price_bar).collect())
    }

    async fn replace_labels(
        &self,
        definition: &LabelDefinition,
        dates: &[NaiveDate],
        entries: &[LabelEntry],
    ) -> Result<()> {
        let filters = to_json(&definition.filters, "label filters")?;
        let top_k = i32::try_from(definition.top_k)
            .map_err(|_| anyhow!("top_k {} does not fit the labels table", definition.top_k))?;

        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        transaction
            .execute(
                "INSERT INTO label_definitions (name, rule, top_k, filters, start_date, end_date, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (name) DO UPDATE SET
                    rule = EXCLUDED.rule,
                    top_k = EXCLUDED.top_k,
                    filters = EXCLUDED.filters,
                    start_date = LEAST(label_definitions.start_date, EXCLUDED.start_date),
                    end_date = GREATEST(label_definitions.end_date, EXCLUDED.end_date),
                    created_at = EXCLUDED.created_at",
                &[
                    &definition.name,
                    &definition.rule.as_str(),
                    &top_k,
                    &filters,
                    &definition.date_range.start,
                    &definition.date_range.end,
                    &definition.created_at,
                ],
            )
            .await?;

        let dates: Vec<NaiveDate> = dates.to_vec();
        transaction
            .execute(
                "DELETE FROM labels WHERE label_name = $1 AND trade_date = ANY($2)",
                &[&definition.name, &dates],
            )
            .await?;

        let insert = transaction
            .prepare(
                "INSERT INTO labels (label_name, trade_date, symbol, score, rank)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .await?;
        for entry in entries {
            let rank = entry.rank as i32;
            transaction
                .execute(
                    &insert,
                    &[
                        &entry.label_name,
                        &entry.trade_date,
                        &entry.symbol,
                        &entry.score,
                        &rank,
                    ],
                )
                .await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    async fn get_label_definition(&self, name: &str) -> Result<Option<LabelDefinition>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT name, rule, top_k, filters, start_date, end_date, created_at
                 FROM label_definitions WHERE name = $1",
                &[&name],
            )
            .await?;
        row.as_ref().map(row_to_label_definition).transpose()
    }

    async fn list_labels(&self) -> Result<Vec<LabelSummary>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT d.name, d.rule, d.top_k, d.filters, d.start_date, d.end_date, d.created_at,
                        COUNT(l.symbol), MIN(l.trade_date), MAX(l.trade_date)
                 FROM label_definitions d
                 LEFT JOIN labels l ON l.label_name = d.name
                 GROUP BY d.name
                 ORDER BY d.created_at DESC, d.name",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let count: i64 = row.get(7);
                Ok(LabelSummary {
                    definition: row_to_label_definition(row)?,
                    entry_count: count.max(0) as usize,
                    first_date: row.get(8),
                    last_date: row.get(9),
                })
            })
            .collect()
    }

    async fn delete_label(&self, name: &str) -> Result<bool> {
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        let entries = transaction
            .execute("DELETE FROM labels WHERE label_name = $1", &[&name])
            .await?;
        let definitions = transaction
            .execute("DELETE FROM label_definitions WHERE name = $1", &[&name])
            .await?;
        transaction.commit().await?;
        Ok(entries + definitions > 0)
    }

    async fn get_labels(&self, label_name: &str, range: DateRange) -> Result<Vec<LabelEntry>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT trade_date, label_name, symbol, score, rank
                 FROM labels
                 WHERE label_name = $1 AND trade_date >= $2 AND trade_date <= $3
                 ORDER BY trade_date, rank",
                &[&label_name, &range.start, &range.end],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let rank: i32 = row.get(4);
                LabelEntry {
                    trade_date: row.get(0),
                    label_name: row.get(1),
                    symbol: row.get(2),
                    score: row.get(3),
                    rank: rank.max(0) as u32,
                }
            })
            .collect())
    }

    async fn save_backtest_result(&self, task_id: &str, result: &BacktestResult) -> Result<()> {
        let body = to_json(result, "backtest result")?;
        let created_at = Utc::now();
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO backtest_results (task_id, result_hash, result, created_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (task_id) DO UPDATE SET
                    result_hash = EXCLUDED.result_hash,
                    result = EXCLUDED.result,
                    created_at = EXCLUDED.created_at",
                &[&task_id, &result.result_hash, &body, &created_at],
            )
            .await?;
        Ok(())
    }

    async fn get_backtest_result(&self, task_id: &str) -> Result<Option<BacktestResult>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT result FROM backtest_results WHERE task_id = $1",
                &[&task_id],
            )
            .await?;
        row.map(|row| from_json(row.get(0), "backtest result"))
            .transpose()
    }

    async fn insert_experiment(&self, experiment: &Experiment) -> Result<()> {
        let config = to_json(&experiment.strategy_config, "strategy config")?;
        let metrics = to_json(&experiment.metrics, "metrics")?;
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO experiments (id, created_at, strategy_config, label_name, start_date, end_date, metrics, result_hash, soft_deleted_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &experiment.id,
                    &experiment.created_at,
                    &config,
                    &experiment.label_name,
                    &experiment.date_range.start,
                    &experiment.date_range.end,
                    &metrics,
                    &experiment.result_hash,
                    &experiment.soft_deleted_at,
                ],
            )
            .await
            .with_context(|| format!("failed to insert experiment {}", experiment.id))?;
        Ok(())
    }

    async fn update_experiment(&self, experiment: &Experiment) -> Result<()> {
        let metrics = to_json(&experiment.metrics, "metrics")?;
        let client = self.client.lock().await;
        let updated = client
            .execute(
                "UPDATE experiments
                 SET metrics = $2, result_hash = $3, soft_deleted_at = $4
                 WHERE id = $1",
                &[
                    &experiment.id,
                    &metrics,
                    &experiment.result_hash,
                    &experiment.soft_deleted_at,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(anyhow!("Experiment {} does not exist", experiment.id));
        }
        Ok(())
    }

    async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        let client = self.client.lock().await;
        let query = format!("SELECT {} FROM experiments WHERE id = $1", EXPERIMENT_COLUMNS);
        let row = client.query_opt(query.as_str(), &[&id]).await?;
        row.as_ref().map(row_to_experiment).transpose()
    }

    async fn list_experiments(&self, include_deleted: bool) -> Result<Vec<Experiment>> {
        let client = self.client.lock().await;
        let query = format!(
            "SELECT {} FROM experiments WHERE $1 OR soft_deleted_at IS NULL ORDER BY created_at DESC, id",
            EXPERIMENT_COLUMNS
        );
        let rows = client.query(query.as_str(), &[&include_deleted]).await?;
        rows.iter().map(row_to_experiment).collect()
    }

    async fn put_task(&self, task: &Task) -> Result<()> {
        let body = to_json(task, "task")?;
        let updated_at: DateTime<Utc> = Utc::now();
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO tasks (task_id, status, body, updated_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (task_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    body = EXCLUDED.body,
                    updated_at = EXCLUDED.updated_at",
                &[&task.task_id, &task.status.as_str(), &body, &updated_at],
            )
            .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT body FROM tasks WHERE task_id = $1", &[&task_id])
            .await?;
        row.map(|row| from_json(row.get(0), "task")).transpose()
    }
}
