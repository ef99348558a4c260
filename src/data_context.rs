use crate::models::{DateRange, PriceBar};
use crate::storage::Storage;
use anyhow::{anyhow, Context, Result};
use chrono::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("price data unavailable for {symbol}: {reason}")]
pub struct DataUnavailable {
    pub symbol: String,
    pub reason: String,
}

/// Read access to daily price history.
pub trait PriceSource: Send + Sync {
    fn symbols(&self) -> Vec<String>;

    /// Trading sessions within `[start, end]`, ascending.
    fn trading_dates(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate>;

    fn previous_trading_date(&self, date: NaiveDate) -> Option<NaiveDate>;

    /// Bars for `symbol` within `[start, end]`, ascending by date.
    fn get_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>, DataUnavailable>;

    fn shares_outstanding(&self, _symbol: &str) -> Option<f64> {
        None
    }
}

/// Market cap from the share count when known, otherwise close × volume.
pub fn market_cap_of(bar: &PriceBar, shares_outstanding: Option<f64>) -> f64 {
    match shares_outstanding {
        Some(shares) if shares.is_finite() && shares > 0.0 => bar.close * shares,
        _ => bar.close * bar.volume as f64,
    }
}

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    bars: Vec<PriceBar>,
    shares_outstanding: HashMap<String, f64>,
}

/// In-memory price universe indexed by symbol.
#[derive(Clone)]
pub struct MarketData {
    symbols: Arc<Vec<String>>,
    trading_dates: Arc<Vec<NaiveDate>>,
    bars_by_symbol: Arc<HashMap<String, Vec<PriceBar>>>,
    shares_outstanding: Arc<HashMap<String, f64>>,
}

impl MarketData {
    pub fn from_bars(bars: Vec<PriceBar>) -> Result<Self> {
        let mut bars_by_symbol: HashMap<String, Vec<PriceBar>> = HashMap::new();
        let mut dates = BTreeSet::new();
        for bar in bars {
            dates.insert(bar.date);
            bars_by_symbol
                .entry(bar.symbol.clone())
                .or_default()
                .push(bar);
        }

        for (symbol, series) in bars_by_symbol.iter_mut() {
            series.sort_by_key(|bar| bar.date);
            if let Some(window) = series.windows(2).find(|w| w[0].date == w[1].date) {
                return Err(anyhow!(
                    "Duplicate price bar for {} on {}",
                    symbol,
                    window[0].date
                ));
            }
        }

        let mut symbols: Vec<String> = bars_by_symbol.keys().cloned().collect();
        symbols.sort();

        Ok(Self {
            symbols: Arc::new(symbols),
            trading_dates: Arc::new(dates.into_iter().collect()),
            bars_by_symbol: Arc::new(bars_by_symbol),
            shares_outstanding: Arc::new(HashMap::new()),
        })
    }

    pub fn with_shares_outstanding(mut self, shares: HashMap<String, f64>) -> Self {
        self.shares_outstanding = Arc::new(shares);
        self
    }

    pub async fn load(storage: &dyn Storage, range: Option<DateRange>) -> Result<Self> {
        let bars = storage
            .load_price_bars(range)
            .await
            .context("Failed to load price bars from storage")?;
        info!("Loaded {} price bars from storage", bars.len());
        Self::from_bars(bars)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading market data snapshot from {}", path.display());
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }

        Ok(Self::from_bars(snapshot.bars)?.with_shares_outstanding(snapshot.shares_outstanding))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            bars: self.all_bars().cloned().collect(),
            shares_outstanding: self.shares_outstanding.as_ref().clone(),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn has_data(&self) -> bool {
        !self.symbols.is_empty() && !self.trading_dates.is_empty()
    }

    pub fn bar_count(&self) -> usize {
        self.bars_by_symbol.values().map(Vec::len).sum()
    }

    /// Every bar ordered by (symbol, date).
    pub fn all_bars(&self) -> impl Iterator<Item = &PriceBar> + '_ {
        self.symbols
            .iter()
            .filter_map(|symbol| self.bars_by_symbol.get(symbol))
            .flat_map(|series| series.iter())
    }
}

impl PriceSource for MarketData {
    fn symbols(&self) -> Vec<String> {
        self.symbols.as_ref().clone()
    }

    fn trading_dates(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let from = self.trading_dates.partition_point(|date| *date < start);
        let to = self.trading_dates.partition_point(|date| *date <= end);
        if from >= to {
            return Vec::new();
        }
        self.trading_dates[from..to].to_vec()
    }

    fn previous_trading_date(&self, date: NaiveDate) -> Option<NaiveDate> {
        let idx = self.trading_dates.partition_point(|d| *d < date);
        idx.checked_sub(1).map(|prev| self.trading_dates[prev])
    }

    fn get_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>, DataUnavailable> {
        let series = self
            .bars_by_symbol
            .get(symbol)
            .ok_or_else(|| DataUnavailable {
                symbol: symbol.to_string(),
                reason: "unknown symbol".to_string(),
            })?;
        let from = series.partition_point(|bar| bar.date < start);
        let to = series.partition_point(|bar| bar.date <= end);
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(series[from..to].to_vec())
    }

    fn shares_outstanding(&self, symbol: &str) -> Option<f64> {
        self.shares_outstanding.get(symbol).copied()
    }
}

/// Price history read from storage one symbol and range at a time. Only the
/// symbol list and the trading calendar are held in memory.
///
/// `get_bars` blocks on the captured runtime, so it must be called from a
/// pipeline worker or ranking thread, never from an async task.
pub struct StoredPrices {
    storage: Arc<dyn Storage>,
    runtime: Handle,
    symbols: Vec<String>,
    trading_dates: Vec<NaiveDate>,
}

impl StoredPrices {
    pub async fn load(storage: Arc<dyn Storage>) -> Result<Self> {
        let symbols = storage
            .price_symbols()
            .await
            .context("Failed to list price symbols")?;
        let trading_dates = storage
            .price_calendar()
            .await
            .context("Failed to load the trading calendar")?;
        info!(
            "Stored price universe: {} symbols over {} sessions",
            symbols.len(),
            trading_dates.len()
        );
        Ok(Self {
            storage,
            runtime: Handle::current(),
            symbols,
            trading_dates,
        })
    }

    pub fn has_data(&self) -> bool {
        !self.symbols.is_empty() && !self.trading_dates.is_empty()
    }
}

impl PriceSource for StoredPrices {
    fn symbols(&self) -> Vec<String> {
        self.symbols.clone()
    }

    fn trading_dates(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let from = self.trading_dates.partition_point(|date| *date < start);
        let to = self.trading_dates.partition_point(|date| *date <= end);
        if from >= to {
            return Vec::new();
        }
        self.trading_dates[from..to].to_vec()
    }

    fn previous_trading_date(&self, date: NaiveDate) -> Option<NaiveDate> {
        let idx = self.trading_dates.partition_point(|d| *d < date);
        idx.checked_sub(1).map(|prev| self.trading_dates[prev])
    }

    fn get_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>, DataUnavailable> {
        if start > end {
            return Ok(Vec::new());
        }
        if Handle::try_current().is_ok() {
            return Err(DataUnavailable {
                symbol: symbol.to_string(),
                reason: "stored prices read from inside the async runtime".to_string(),
            });
        }
        let range = DateRange { start, end };
        self.runtime
            .block_on(self.storage.get_price_bars(symbol, range))
            .map_err(|err| DataUnavailable {
                symbol: symbol.to_string(),
                reason: format!("{:#}", err),
            })
    }
}

/// The bars one backtest reads, keyed by (symbol, date).
#[derive(Debug, Clone, Default)]
pub struct PriceBook {
    calendar: Vec<NaiveDate>,
    bars: BTreeMap<String, BTreeMap<NaiveDate, PriceBar>>,
    shares_outstanding: HashMap<String, f64>,
    unavailable: BTreeSet<String>,
}

impl PriceBook {
    pub fn load<I>(
        source: &dyn PriceSource,
        calendar: Vec<NaiveDate>,
        symbols: I,
        range: DateRange,
    ) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut book = Self {
            calendar,
            ..Default::default()
        };
        let symbols: BTreeSet<String> = symbols.into_iter().collect();
        for symbol in symbols {
            match source.get_bars(&symbol, range.start, range.end) {
                Ok(series) => {
                    if let Some(shares) = source.shares_outstanding(&symbol) {
                        book.shares_outstanding.insert(symbol.clone(), shares);
                    }
                    book.insert_series(symbol, series);
                }
                Err(err) => {
                    warn!("{}", err);
                    book.unavailable.insert(symbol);
                }
            }
        }
        book
    }

    pub fn from_bars(calendar: Vec<NaiveDate>, bars: Vec<PriceBar>) -> Self {
        let mut book = Self {
            calendar,
            ..Default::default()
        };
        for bar in bars {
            book.bars
                .entry(bar.symbol.clone())
                .or_default()
                .insert(bar.date, bar);
        }
        book
    }

    fn insert_series(&mut self, symbol: String, series: Vec<PriceBar>) {
        let entry = self.bars.entry(symbol).or_default();
        for bar in series {
            entry.insert(bar.date, bar);
        }
    }

    pub fn calendar(&self) -> &[NaiveDate] {
        &self.calendar
    }

    pub fn bar(&self, symbol: &str, date: NaiveDate) -> Option<&PriceBar> {
        self.bars.get(symbol).and_then(|series| series.get(&date))
    }

    pub fn last_close_on_or_before(&self, symbol: &str, date: NaiveDate) -> Option<f64> {
        self.bars
            .get(symbol)
            .and_then(|series| series.range(..=date).next_back())
            .map(|(_, bar)| bar.close)
    }

    pub fn market_cap(&self, symbol: &str, date: NaiveDate) -> Option<f64> {
        let bar = self.bar(symbol, date)?;
        let cap = market_cap_of(bar, self.shares_outstanding.get(symbol).copied());
        cap.is_finite().then_some(cap)
    }

    pub fn bars(&self) -> impl Iterator<Item = &PriceBar> + '_ {
        self.bars.values().flat_map(|series| series.values())
    }

    pub fn unavailable_symbols(&self) -> usize {
        self.unavailable.len()
    }
}
