use crate::data_context::PriceBook;
use crate::errors::PipelineError;
use crate::models::*;
use crate::task_status::TaskStatusHandle;
use chrono::NaiveDate;
use log::{debug, info, warn};

/// One batch's independently funded slice of capital.
struct Sleeve {
    buy_date: NaiveDate,
    sell_date: NaiveDate,
    cash: f64,
    positions: Vec<Position>,
}

struct Position {
    symbol: String,
    shares: f64,
    sell_price: f64,
}

impl Sleeve {
    fn value_on(&self, date: NaiveDate, capital: f64, book: &PriceBook) -> f64 {
        if date < self.buy_date {
            return capital;
        }
        let mut value = self.cash;
        for position in &self.positions {
            let mark = if date >= self.sell_date && position.sell_price.is_finite() {
                position.sell_price
            } else {
                book.last_close_on_or_before(&position.symbol, date)
                    .unwrap_or(f64::NAN)
            };
            value += position.shares * mark;
        }
        value
    }
}

pub struct PortfolioSimulator<'a> {
    config: &'a StrategyConfig,
    book: &'a PriceBook,
}

impl<'a> PortfolioSimulator<'a> {
    pub fn new(config: &'a StrategyConfig, book: &'a PriceBook) -> Self {
        Self { config, book }
    }

    fn allocations(&self, batch: &SignalBatch, symbols: &[&str]) -> Vec<f64> {
        let capital = self.config.initial_capital;
        let equal = capital / self.config.top_k as f64;
        match self.config.positioning {
            PositionSizing::EqualWeight => vec![equal; symbols.len()],
            PositionSizing::MarketCapWeight => {
                let caps: Vec<f64> = symbols
                    .iter()
                    .map(|symbol| {
                        self.book
                            .market_cap(symbol, batch.label_date)
                            .filter(|cap| *cap > 0.0)
                            .unwrap_or(0.0)
                    })
                    .collect();
                let total: f64 = caps.iter().sum();
                if total > 0.0 && total.is_finite() {
                    caps.iter().map(|cap| capital * cap / total).collect()
                } else {
                    vec![equal; symbols.len()]
                }
            }
        }
    }

    /// Runs every batch as a fixed-capital sleeve and returns the normalized
    /// equity curve and the trade ledger.
    pub fn simulate(
        &self,
        batches: &[SignalBatch],
        status: &TaskStatusHandle,
        progress_range: (u8, u8),
    ) -> Result<(Vec<EquityPoint>, Vec<Trade>), PipelineError> {
        let capital = self.config.initial_capital;
        let mut sleeves: Vec<Sleeve> = Vec::new();
        let mut trades: Vec<Trade> = Vec::new();
        let mut first_label_date: Option<NaiveDate> = None;
        let mut last_sell_date: Option<NaiveDate> = None;
        let (progress_start, progress_end) = progress_range;

        for (idx, batch) in batches.iter().enumerate() {
            let symbols: Vec<&str> = batch.buys().map(|signal| signal.symbol.as_str()).collect();
            if symbols.is_empty() {
                debug!("Batch {} has no buy signals; not funded", batch.batch_index);
                continue;
            }

            let allocations = self.allocations(batch, &symbols);
            let mut sleeve = Sleeve {
                buy_date: batch.buy_date,
                sell_date: batch.sell_date,
                cash: capital,
                positions: Vec::with_capacity(symbols.len()),
            };

            for (symbol, allocation) in symbols.iter().zip(allocations) {
                let buy_price = self
                    .book
                    .bar(symbol, batch.buy_date)
                    .map(|bar| bar.price_at(self.config.buy_timing))
                    .ok_or_else(|| PipelineError::DataGap {
                        symbol: symbol.to_string(),
                        date: batch.buy_date,
                    })?;
                let shares = allocation / buy_price;
                let sell_price = self
                    .book
                    .bar(symbol, batch.sell_date)
                    .map(|bar| bar.price_at(self.config.sell_timing))
                    .filter(|price| price.is_finite() && *price > 0.0)
                    .unwrap_or(f64::NAN);
                if sell_price.is_nan() {
                    warn!(
                        "No sell bar for {} on {}; holding at last known close",
                        symbol, batch.sell_date
                    );
                }
                let return_pct = (sell_price - buy_price) / buy_price;

                sleeve.cash -= allocation;
                sleeve.positions.push(Position {
                    symbol: symbol.to_string(),
                    shares,
                    sell_price,
                });
                trades.push(Trade {
                    batch_index: batch.batch_index,
                    symbol: symbol.to_string(),
                    buy_date: batch.buy_date,
                    buy_price,
                    sell_date: batch.sell_date,
                    sell_price,
                    shares,
                    return_pct,
                });
            }

            first_label_date = Some(first_label_date.map_or(batch.label_date, |d| d.min(batch.label_date)));
            last_sell_date = Some(last_sell_date.map_or(batch.sell_date, |d| d.max(batch.sell_date)));
            sleeves.push(sleeve);

            let progress = progress_start as usize
                + (progress_end - progress_start) as usize * (idx + 1) / batches.len();
            status.checkpoint(
                progress as u8,
                format!("Simulated batch {}/{}", idx + 1, batches.len()),
            )?;
        }

        let (Some(start), Some(end)) = (first_label_date, last_sell_date) else {
            return Err(PipelineError::EmptySignalSet(
                "no batch produced a tradable signal".to_string(),
            ));
        };

        let committed = capital * sleeves.len() as f64;
        let equity_curve: Vec<EquityPoint> = self
            .book
            .calendar()
            .iter()
            .filter(|date| **date >= start && **date <= end)
            .map(|date| {
                let total: f64 = sleeves
                    .iter()
                    .map(|sleeve| sleeve.value_on(*date, capital, self.book))
                    .sum();
                EquityPoint {
                    date: *date,
                    value: total / committed,
                }
            })
            .collect();

        info!(
            "Simulated {} sleeves, {} trades, {} equity points",
            sleeves.len(),
            trades.len(),
            equity_curve.len()
        );
        Ok((equity_curve, trades))
    }
}
