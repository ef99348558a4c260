use crate::errors::{ErrorCode, PipelineError, ReproducibilityMismatch};
use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub adjusted_close: f64,
}

impl PriceBar {
    pub fn price_at(&self, timing: ExecutionTiming) -> f64 {
        match timing {
            ExecutionTiming::Open => self.open,
            ExecutionTiming::Close => self.close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, PipelineError> {
        if end < start {
            return Err(PipelineError::InvalidConfig(format!(
                "date range end {} is before start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

/// Scoring rule behind a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    LargestGain,
    LargestDrop,
    MarketCapGain,
    MarketCapDrop,
    HighestVolume,
    HighestTurnover,
}

impl RuleKind {
    pub const ALL: [RuleKind; 6] = [
        RuleKind::LargestGain,
        RuleKind::LargestDrop,
        RuleKind::MarketCapGain,
        RuleKind::MarketCapDrop,
        RuleKind::HighestVolume,
        RuleKind::HighestTurnover,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::LargestGain => "largest_gain",
            RuleKind::LargestDrop => "largest_drop",
            RuleKind::MarketCapGain => "market_cap_gain",
            RuleKind::MarketCapDrop => "market_cap_drop",
            RuleKind::HighestVolume => "highest_volume",
            RuleKind::HighestTurnover => "highest_turnover",
        }
    }

    /// Change rules compare against the previous trading day's bar.
    pub fn needs_prior_day(&self) -> bool {
        matches!(
            self,
            RuleKind::LargestGain
                | RuleKind::LargestDrop
                | RuleKind::MarketCapGain
                | RuleKind::MarketCapDrop
        )
    }

    pub fn is_decline(&self) -> bool {
        matches!(self, RuleKind::LargestDrop | RuleKind::MarketCapDrop)
    }

    pub fn is_gain(&self) -> bool {
        matches!(self, RuleKind::LargestGain | RuleKind::MarketCapGain)
    }

    pub fn default_label_name(&self, top_k: usize) -> String {
        format!("{}_top{}", self.as_str(), top_k)
    }

    pub fn description(&self) -> &'static str {
        match self {
            RuleKind::LargestGain => "Largest close-to-close percentage gain",
            RuleKind::LargestDrop => "Largest close-to-close percentage decline",
            RuleKind::MarketCapGain => "Largest day-over-day market cap gain",
            RuleKind::MarketCapDrop => "Largest day-over-day market cap decline",
            RuleKind::HighestVolume => "Highest traded share volume",
            RuleKind::HighestTurnover => "Highest turnover (volume over shares outstanding, else volume over close)",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        RuleKind::ALL
            .iter()
            .copied()
            .find(|rule| rule.as_str() == normalized)
            .ok_or_else(|| anyhow!("Unknown ranking rule '{}'", s.trim()))
    }
}

/// Predicates applied to the candidate set before a label is ranked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelFilters {
    #[serde(default)]
    pub min_market_cap: Option<f64>,
    /// Signed close-to-close move in percent.
    #[serde(default)]
    pub min_change_pct: Option<f64>,
    #[serde(default)]
    pub max_change_pct: Option<f64>,
    #[serde(default)]
    pub min_volume: Option<i64>,
}

impl LabelFilters {
    pub fn needs_prior_day(&self) -> bool {
        self.min_change_pct.is_some() || self.max_change_pct.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelParams {
    pub top_k: usize,
    #[serde(default)]
    pub label_name: Option<String>,
    #[serde(default)]
    pub filters: LabelFilters,
}

impl Default for LabelParams {
    fn default() -> Self {
        Self {
            top_k: 20,
            label_name: None,
            filters: LabelFilters::default(),
        }
    }
}

impl LabelParams {
    pub fn resolved_label_name(&self, rule: RuleKind) -> String {
        self.label_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| rule.default_label_name(self.top_k))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDefinition {
    pub name: String,
    pub rule: RuleKind,
    pub top_k: usize,
    pub filters: LabelFilters,
    pub date_range: DateRange,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEntry {
    pub trade_date: NaiveDate,
    pub label_name: String,
    pub symbol: String,
    pub score: f64,
    pub rank: u32,
}

/// A stored label with the size and span of its entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSummary {
    pub definition: LabelDefinition,
    pub entry_count: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Reversal,
    Momentum,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Reversal => "reversal",
            StrategyKind::Momentum => "momentum",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reversal" | "mean_reversion" => Ok(StrategyKind::Reversal),
            "momentum" => Ok(StrategyKind::Momentum),
            other => Err(anyhow!("Unknown strategy kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTiming {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizing {
    EqualWeight,
    MarketCapWeight,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyFilterRules {
    #[serde(default)]
    pub min_market_cap: Option<f64>,
    /// Bounds on the label score, in the label's own units.
    #[serde(default)]
    pub min_change_pct: Option<f64>,
    #[serde(default)]
    pub max_change_pct: Option<f64>,
    #[serde(default)]
    pub rank_cutoff: Option<u32>,
    /// Declines deeper than this are treated as bad data (reversal only).
    #[serde(default)]
    pub max_drop_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    #[serde(default = "default_strategy_version")]
    pub version: u32,
    pub kind: StrategyKind,
    pub buy_timing: ExecutionTiming,
    pub sell_timing: ExecutionTiming,
    pub hold_days: u32,
    pub execution_frequency_days: u32,
    pub execution_count: u32,
    pub top_k: usize,
    pub positioning: PositionSizing,
    pub initial_capital: f64,
    #[serde(default)]
    pub filter_rules: StrategyFilterRules,
}

fn default_strategy_version() -> u32 {
    1
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |message: String| Err(PipelineError::InvalidConfig(message));

        if self.name.trim().is_empty() {
            return invalid("strategy name must not be empty".to_string());
        }
        if self.hold_days < 1 {
            return invalid("hold_days must be >= 1".to_string());
        }
        if self.hold_days == 1
            && !(self.buy_timing == ExecutionTiming::Open
                && self.sell_timing == ExecutionTiming::Close)
        {
            return invalid(
                "a one-day hold must buy at the open and sell at the close".to_string(),
            );
        }
        if self.execution_frequency_days < 1 {
            return invalid("execution_frequency_days must be >= 1".to_string());
        }
        if self.execution_count < 1 {
            return invalid("execution_count must be >= 1".to_string());
        }
        if self.top_k < 1 {
            return invalid("top_k must be >= 1".to_string());
        }
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return invalid(format!(
                "initial_capital must be a positive number (value: {})",
                self.initial_capital
            ));
        }
        if let Some(max_drop) = self.filter_rules.max_drop_pct {
            if !max_drop.is_finite() || max_drop <= 0.0 {
                return invalid(format!(
                    "max_drop_pct must be a positive number (value: {})",
                    max_drop
                ));
            }
        }
        if let (Some(min), Some(max)) = (
            self.filter_rules.min_change_pct,
            self.filter_rules.max_change_pct,
        ) {
            if max < min {
                return invalid(format!(
                    "max_change_pct ({}) must be >= min_change_pct ({})",
                    max, min
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    Buy,
    Sell,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
        }
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub batch_index: usize,
    pub symbol: String,
    pub action: SignalAction,
    pub effective_date: NaiveDate,
}

/// Signals for one batch together with the dates the batch trades on.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalBatch {
    pub batch_index: usize,
    pub label_date: NaiveDate,
    pub buy_date: NaiveDate,
    pub sell_date: NaiveDate,
    pub signals: Vec<Signal>,
    pub excluded_symbols: usize,
}

impl SignalBatch {
    pub fn buys(&self) -> impl Iterator<Item = &Signal> {
        self.signals
            .iter()
            .filter(|signal| signal.action == SignalAction::Buy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub batch_index: usize,
    pub symbol: String,
    pub buy_date: NaiveDate,
    pub buy_price: f64,
    pub sell_date: NaiveDate,
    #[serde(with = "nullable_f64")]
    pub sell_price: f64,
    pub shares: f64,
    #[serde(with = "nullable_f64")]
    pub return_pct: f64,
}

impl Trade {
    /// Trades without a sell price stay in the ledger but not in aggregates.
    pub fn is_priced(&self) -> bool {
        self.return_pct.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_return: f64,
    pub ann_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub calmar_ratio: f64,
    pub win_rate: f64,
    pub avg_trade_return: f64,
    pub total_trades: usize,
    pub priced_trades: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRequest {
    pub strategy_config: StrategyConfig,
    pub label_name: String,
    pub date_range: DateRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub request: BacktestRequest,
    pub metrics: Metrics,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    pub batch_count: usize,
    pub excluded_symbols: usize,
    pub price_fingerprint: String,
    pub result_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub strategy_config: StrategyConfig,
    pub label_name: String,
    pub date_range: DateRange,
    pub metrics: Metrics,
    pub result_hash: String,
    pub soft_deleted_at: Option<DateTime<Utc>>,
}

impl Experiment {
    pub fn is_deleted(&self) -> bool {
        self.soft_deleted_at.is_some()
    }

    pub fn backtest_request(&self) -> BacktestRequest {
        BacktestRequest {
            strategy_config: self.strategy_config.clone(),
            label_name: self.label_name.clone(),
            date_range: self.date_range,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    LabelRun,
    Backtest,
    ExperimentRerun,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::LabelRun => "label_run",
            TaskKind::Backtest => "backtest",
            TaskKind::ExperimentRerun => "experiment_rerun",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" | "cancelled" => Ok(TaskStatus::Canceled),
            other => Err(anyhow!("Unknown task status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerunReport {
    pub experiment_id: String,
    pub stored_hash: String,
    pub new_hash: String,
    pub matches: bool,
    pub warning: Option<ReproducibilityMismatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutcome {
    Labels {
        label_name: String,
        dates: usize,
        entries: usize,
        excluded: usize,
    },
    Backtest {
        result_hash: String,
    },
    Rerun(RerunReport),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub retry_count: u32,
    pub last_error: Option<TaskError>,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<TaskOutcome>,
}

impl Task {
    pub fn new(task_id: String, kind: TaskKind, fingerprint: String) -> Self {
        Self {
            task_id,
            kind,
            status: TaskStatus::Queued,
            progress: 0,
            message: "Queued".to_string(),
            retry_count: 0,
            last_error: None,
            fingerprint,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            outcome: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub terminal: bool,
}

/// NaN and infinities travel as `null` so ledgers survive a JSON round trip.
mod nullable_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> StrategyConfig {
        StrategyConfig {
            name: "gainers".to_string(),
            version: 1,
            kind: StrategyKind::Momentum,
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

    #[test]
    fn parses_rule_names_with_dashes_or_underscores() {
        assert_eq!(
            "largest-gain".parse::<RuleKind>().unwrap(),
            RuleKind::LargestGain
        );
        assert_eq!(
            "MARKET_CAP_DROP".parse::<RuleKind>().unwrap(),
            RuleKind::MarketCapDrop
        );
        assert!("biggest".parse::<RuleKind>().is_err());
    }

    #[test]
    fn unpriced_trade_survives_json_round_trip() {
        let trade = Trade {
            batch_index: 0,
            symbol: "AAA".to_string(),
            buy_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            buy_price: 10.0,
            sell_date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            sell_price: f64::NAN,
            shares: 100.0,
            return_pct: f64::NAN,
        };

        let json = serde_json::to_string(&trade).unwrap();
        assert!(json.contains("\"return_pct\":null"));
        let decoded: Trade = serde_json::from_str(&json).unwrap();
        assert!(decoded.return_pct.is_nan());
        assert!(decoded.sell_price.is_nan());
        assert!(!decoded.is_priced());
    }

    #[test]
    fn rejects_one_day_hold_that_cannot_exit_after_entry() {
        let mut config = sample_config();
        config.hold_days = 1;
        config.buy_timing = ExecutionTiming::Close;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfig);

        config.buy_timing = ExecutionTiming::Open;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_capital() {
        let mut config = sample_config();
        config.initial_capital = 0.0;
        assert!(config.validate().is_err());
    }
}
