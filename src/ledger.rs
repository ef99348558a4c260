use crate::errors::{PipelineError, ReproducibilityMismatch};
use crate::models::*;
use log::{info, warn};
use serde::Serialize;
use serde_json::json;

/// Digest over every bar a backtest read. Callers pass bars ordered by
/// (symbol, date). Symbols are length-prefixed so adjacent fields cannot
/// run together.
pub fn price_fingerprint<'a, I>(bars: I) -> String
where
    I: IntoIterator<Item = &'a PriceBar>,
{
    let mut hasher = blake3::Hasher::new();
    for bar in bars {
        hasher.update(&(bar.symbol.len() as u64).to_le_bytes());
        hasher.update(bar.symbol.as_bytes());
        hasher.update(bar.date.to_string().as_bytes());
        hasher.update(&bar.open.to_le_bytes());
        hasher.update(&bar.high.to_le_bytes());
        hasher.update(&bar.low.to_le_bytes());
        hasher.update(&bar.close.to_le_bytes());
        hasher.update(&bar.volume.to_le_bytes());
        hasher.update(&bar.adjusted_close.to_le_bytes());
    }
    hex::encode(hasher.finalize().as_bytes())
}

/// blake3 of the value's JSON form. `serde_json::Value` keeps object keys
/// sorted, so equal values always produce equal bytes.
pub fn canonical_digest<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    let canonical = serde_json::to_value(value).map_err(|err| {
        PipelineError::ComputationError(format!("canonical serialization failed: {}", err))
    })?;
    Ok(hex::encode(
        blake3::hash(canonical.to_string().as_bytes()).as_bytes(),
    ))
}

pub fn result_hash(
    strategy_config: &StrategyConfig,
    label_name: &str,
    price_fingerprint: &str,
    metrics: &Metrics,
    trades: &[Trade],
) -> Result<String, PipelineError> {
    canonical_digest(&json!({
        "strategy_config": strategy_config,
        "label_name": label_name,
        "price_snapshot_fingerprint": price_fingerprint,
        "metrics": metrics,
        "trades": trades,
    }))
}

/// Compares a rerun against the stored experiment. A mismatch is a warning,
/// never a failure.
pub fn compare_rerun(experiment: &Experiment, new_hash: &str) -> RerunReport {
    let matches = experiment.result_hash == new_hash;
    let warning = if matches {
        info!(
            "Experiment {} reproduced hash {}",
            experiment.id, experiment.result_hash
        );
        None
    } else {
        let mismatch = ReproducibilityMismatch {
            experiment_id: experiment.id.clone(),
            stored_hash: experiment.result_hash.clone(),
            new_hash: new_hash.to_string(),
        };
        warn!("Reproducibility mismatch: {}", mismatch);
        Some(mismatch)
    };

    RerunReport {
        experiment_id: experiment.id.clone(),
        stored_hash: experiment.result_hash.clone(),
        new_hash: new_hash.to_string(),
        matches,
        warning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn config() -> StrategyConfig {
        StrategyConfig {
            name: "bounce".to_string(),
            version: 1,
            kind: StrategyKind::Reversal,
            buy_timing: ExecutionTiming::Open,
            sell_timing: ExecutionTiming::Close,
            hold_days: 3,
            execution_frequency_days: 5,
            execution_count: 2,
            top_k: 3,
            positioning: PositionSizing::EqualWeight,
            initial_capital: 10_000.0,
            filter_rules: StrategyFilterRules::default(),
        }
    }

    fn trades() -> Vec<Trade> {
        vec![Trade {
            batch_index: 0,
            symbol: "AAA".to_string(),
            buy_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            buy_price: 10.0,
            sell_date: NaiveDate::from_ymd_opt(2024, 2, 5).unwrap(),
            sell_price: f64::NAN,
            shares: 3.5,
            return_pct: f64::NAN,
        }]
    }

    #[test]
    fn result_hash_is_stable_and_sensitive() {
        let metrics = Metrics::default();
        let first = result_hash(&config(), "losers", "abc", &metrics, &trades()).unwrap();
        let second = result_hash(&config(), "losers", "abc", &metrics, &trades()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        let other_label = result_hash(&config(), "gainers", "abc", &metrics, &trades()).unwrap();
        assert_ne!(first, other_label);
        let other_prices = result_hash(&config(), "losers", "abd", &metrics, &trades()).unwrap();
        assert_ne!(first, other_prices);
    }

    #[test]
    fn fingerprint_changes_with_any_field() {
        let bar = PriceBar {
            symbol: "AAA".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 10,
            adjusted_close: 1.0,
        };
        let mut changed = bar.clone();
        changed.volume = 11;
        assert_ne!(price_fingerprint([&bar]), price_fingerprint([&changed]));
        assert_eq!(price_fingerprint([&bar]), price_fingerprint([&bar.clone()]));
    }

    #[test]
    fn fingerprint_prefixes_each_symbol_with_its_length() {
        let bar = PriceBar {
            symbol: "AB".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10,
            adjusted_close: 1.5,
        };
        let mut expected = blake3::Hasher::new();
        expected.update(&2u64.to_le_bytes());
        expected.update(b"AB");
        expected.update(b"2024-02-01");
        for value in [1.0f64, 2.0, 0.5, 1.5] {
            expected.update(&value.to_le_bytes());
        }
        expected.update(&10i64.to_le_bytes());
        expected.update(&1.5f64.to_le_bytes());
        assert_eq!(
            price_fingerprint([&bar]),
            hex::encode(expected.finalize().as_bytes())
        );
    }

    #[test]
    fn mismatched_rerun_reports_a_warning() {
        let experiment = Experiment {
            id: "exp-1".to_string(),
            created_at: Utc::now(),
            strategy_config: config(),
            label_name: "losers".to_string(),
            date_range: DateRange::new(
                NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 2, 28).unwrap(),
            )
            .unwrap(),
            metrics: Metrics::default(),
            result_hash: "aaa".to_string(),
            soft_deleted_at: None,
        };
        assert!(compare_rerun(&experiment, "aaa").matches);
        let report = compare_rerun(&experiment, "bbb");
        assert!(!report.matches);
        assert_eq!(report.warning.unwrap().new_hash, "bbb");
    }
}
