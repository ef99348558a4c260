use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use std::collections::HashMap;

pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 3;
pub const DEFAULT_TASK_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_PROGRESS_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_RANKING_SYMBOL_BATCH_SIZE: usize = 200;
pub const DEFAULT_TASK_RETRY_DELAY_MS: u64 = 250;
pub const DEFAULT_STORAGE_WRITE_ATTEMPTS: u32 = 3;
pub const DEFAULT_STORAGE_RETRY_DELAY_MS: u64 = 200;
pub const DEFAULT_FINISHED_TASK_RETENTION: usize = 256;

/// Runtime knobs for the task orchestrator and the ranking stage.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub max_concurrent_tasks: usize,
    /// Total attempts per task, first run included.
    pub task_max_attempts: u32,
    pub task_retry_delay_ms: u64,
    pub progress_channel_capacity: usize,
    pub ranking_symbol_batch_size: usize,
    pub ranking_concurrency: usize,
    pub storage_write_attempts: u32,
    pub storage_retry_delay_ms: u64,
    /// Finished tasks kept in memory; older ones are served from storage.
    pub finished_task_retention: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            task_max_attempts: DEFAULT_TASK_MAX_ATTEMPTS,
            task_retry_delay_ms: DEFAULT_TASK_RETRY_DELAY_MS,
            progress_channel_capacity: DEFAULT_PROGRESS_CHANNEL_CAPACITY,
            ranking_symbol_batch_size: DEFAULT_RANKING_SYMBOL_BATCH_SIZE,
            ranking_concurrency: num_cpus::get().max(1),
            storage_write_attempts: DEFAULT_STORAGE_WRITE_ATTEMPTS,
            storage_retry_delay_ms: DEFAULT_STORAGE_RETRY_DELAY_MS,
            finished_task_retention: DEFAULT_FINISHED_TASK_RETENTION,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let max_concurrent_tasks = optional_setting_usize(
            settings,
            "MAX_CONCURRENT_TASKS",
            1,
            defaults.max_concurrent_tasks,
        )?;
        let task_max_attempts = optional_setting_usize(
            settings,
            "TASK_MAX_ATTEMPTS",
            1,
            defaults.task_max_attempts as usize,
        )? as u32;
        let task_retry_delay_ms = optional_setting_usize(
            settings,
            "TASK_RETRY_DELAY_MS",
            0,
            defaults.task_retry_delay_ms as usize,
        )? as u64;
        let progress_channel_capacity = optional_setting_usize(
            settings,
            "PROGRESS_CHANNEL_CAPACITY",
            1,
            defaults.progress_channel_capacity,
        )?;
        let ranking_symbol_batch_size = optional_setting_usize(
            settings,
            "RANKING_SYMBOL_BATCH_SIZE",
            1,
            defaults.ranking_symbol_batch_size,
        )?;
        let ranking_concurrency = optional_setting_usize(
            settings,
            "RANKING_CONCURRENCY",
            1,
            defaults.ranking_concurrency,
        )?;
        let storage_write_attempts = optional_setting_usize(
            settings,
            "STORAGE_WRITE_ATTEMPTS",
            1,
            defaults.storage_write_attempts as usize,
        )? as u32;
        let storage_retry_delay_ms = optional_setting_usize(
            settings,
            "STORAGE_RETRY_DELAY_MS",
            0,
            defaults.storage_retry_delay_ms as usize,
        )? as u64;
        let finished_task_retention = optional_setting_usize(
            settings,
            "FINISHED_TASK_RETENTION",
            0,
            defaults.finished_task_retention,
        )?;

        if task_max_attempts > DEFAULT_TASK_MAX_ATTEMPTS {
            return Err(anyhow!(
                "TASK_MAX_ATTEMPTS ({}) must be <= {}",
                task_max_attempts,
                DEFAULT_TASK_MAX_ATTEMPTS
            ));
        }

        Ok(Self {
            max_concurrent_tasks,
            task_max_attempts,
            task_retry_delay_ms,
            progress_channel_capacity,
            ranking_symbol_batch_size,
            ranking_concurrency,
            storage_write_attempts,
            storage_retry_delay_ms,
            finished_task_retention,
        })
    }

    pub fn from_env() -> Result<Self> {
        let settings: HashMap<String, String> = std::env::vars().collect();
        Self::from_settings_map(&settings)
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

pub fn parse_date_arg(key: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        anyhow!(
            "Setting {} must be a date in YYYY-MM-DD format (value: {})",
            key,
            raw
        )
    })
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
    default: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}
