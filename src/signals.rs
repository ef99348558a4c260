use crate::data_context::PriceBook;
use crate::errors::PipelineError;
use crate::models::*;
use crate::strategy::{create_strategy, Strategy};
use crate::task_status::TaskStatusHandle;
use chrono::NaiveDate;
use log::{debug, info};
use std::collections::BTreeMap;

pub type LabelsByDate = BTreeMap<NaiveDate, Vec<LabelEntry>>;

/// Groups entries by trade date with each day in rank order.
pub fn group_labels(entries: Vec<LabelEntry>) -> LabelsByDate {
    let mut grouped: LabelsByDate = BTreeMap::new();
    for entry in entries {
        grouped.entry(entry.trade_date).or_default().push(entry);
    }
    for day in grouped.values_mut() {
        day.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.symbol.cmp(&b.symbol)));
    }
    grouped.retain(|_, day| !day.is_empty());
    grouped
}

/// Session indices one batch trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_index: usize,
    pub label_date: NaiveDate,
    pub buy_date: NaiveDate,
    pub sell_date: NaiveDate,
}

pub struct SignalGenerator {
    config: StrategyConfig,
    strategy: Box<dyn Strategy + Send + Sync>,
}

impl SignalGenerator {
    /// Validates the config and, when the label's definition is known,
    /// that the strategy can trade it.
    pub fn new(
        config: &StrategyConfig,
        definition: Option<&LabelDefinition>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let strategy = create_strategy(config.kind);
        if let Some(definition) = definition {
            if !strategy.accepts_rule(definition.rule) {
                return Err(PipelineError::InvalidConfig(format!(
                    "{} strategy needs {}, but label {} ranks by {}",
                    config.kind.as_str(),
                    strategy.describe_required_label(),
                    definition.name,
                    definition.rule
                )));
            }
        }
        Ok(Self {
            config: config.clone(),
            strategy,
        })
    }

    pub fn plan(
        &self,
        labels: &LabelsByDate,
        calendar: &[NaiveDate],
        batch_index: usize,
    ) -> Option<BatchPlan> {
        if batch_index >= self.config.execution_count as usize {
            return None;
        }
        let first = calendar.iter().position(|date| labels.contains_key(date))?;
        let label_idx = first + batch_index * self.config.execution_frequency_days as usize;
        let label_date = *calendar.get(label_idx)?;
        if !labels.contains_key(&label_date) {
            return None;
        }
        let buy_idx = label_idx + 1;
        let sell_idx = buy_idx + self.config.hold_days as usize - 1;
        Some(BatchPlan {
            batch_index,
            label_date,
            buy_date: *calendar.get(buy_idx)?,
            sell_date: *calendar.get(sell_idx)?,
        })
    }

    /// Plans batches until `execution_count` or until the data runs out.
    pub fn plan_all(&self, labels: &LabelsByDate, calendar: &[NaiveDate]) -> Vec<BatchPlan> {
        (0..self.config.execution_count as usize)
            .map_while(|batch_index| self.plan(labels, calendar, batch_index))
            .collect()
    }

    pub fn generate(
        &self,
        labels: &LabelsByDate,
        batch_index: usize,
        book: &PriceBook,
    ) -> Option<SignalBatch> {
        let plan = self.plan(labels, book.calendar(), batch_index)?;
        let day = labels.get(&plan.label_date)?;

        let mut excluded_symbols = 0usize;
        let mut selected: Vec<&LabelEntry> = Vec::with_capacity(self.config.top_k);
        for entry in day {
            if selected.len() >= self.config.top_k {
                break;
            }
            if self.passes_filters(entry, plan.label_date, book) {
                selected.push(entry);
            } else {
                excluded_symbols += 1;
            }
        }

        let mut buys = Vec::with_capacity(selected.len());
        let mut sells = Vec::with_capacity(selected.len());
        for entry in selected {
            let tradable = book
                .bar(&entry.symbol, plan.buy_date)
                .map(|bar| bar.price_at(self.config.buy_timing))
                .is_some_and(|price| price.is_finite() && price > 0.0);
            if !tradable {
                debug!(
                    "Batch {}: dropping {} (no usable bar on {})",
                    batch_index, entry.symbol, plan.buy_date
                );
                excluded_symbols += 1;
                continue;
            }
            buys.push(Signal {
                batch_index,
                symbol: entry.symbol.clone(),
                action: SignalAction::Buy,
                effective_date: plan.buy_date,
            });
            sells.push(Signal {
                batch_index,
                symbol: entry.symbol.clone(),
                action: SignalAction::Sell,
                effective_date: plan.sell_date,
            });
        }
        debug!(
            "Batch {} on {}: {} buys, {} excluded",
            batch_index,
            plan.label_date,
            buys.len(),
            excluded_symbols
        );

        buys.extend(sells);
        Some(SignalBatch {
            batch_index,
            label_date: plan.label_date,
            buy_date: plan.buy_date,
            sell_date: plan.sell_date,
            signals: buys,
            excluded_symbols,
        })
    }

    fn passes_filters(&self, entry: &LabelEntry, label_date: NaiveDate, book: &PriceBook) -> bool {
        let filters = &self.config.filter_rules;
        if let Some(cutoff) = filters.rank_cutoff {
            if entry.rank > cutoff {
                return false;
            }
        }
        if let Some(min_change) = filters.min_change_pct {
            if entry.score < min_change {
                return false;
            }
        }
        if let Some(max_change) = filters.max_change_pct {
            if entry.score > max_change {
                return false;
            }
        }
        if let Some(min_cap) = filters.min_market_cap {
            match book.market_cap(&entry.symbol, label_date) {
                Some(cap) if cap >= min_cap => {}
                _ => return false,
            }
        }
        self.strategy.admits(entry, filters)
    }

    /// Generates every batch, checking for cancellation between batches.
    pub fn generate_all(
        &self,
        labels: &LabelsByDate,
        book: &PriceBook,
        status: &TaskStatusHandle,
        progress_range: (u8, u8),
    ) -> Result<Vec<SignalBatch>, PipelineError> {
        let planned = self.plan_all(labels, book.calendar()).len();
        let mut batches = Vec::with_capacity(planned);
        for batch_index in 0..planned {
            let Some(batch) = self.generate(labels, batch_index, book) else {
                break;
            };
            batches.push(batch);
            let (start, end) = progress_range;
            let progress = start as usize + (end - start) as usize * (batch_index + 1) / planned;
            status.checkpoint(
                progress as u8,
                format!("Generated signals for batch {}/{}", batch_index + 1, planned),
            )?;
        }

        let buys: usize = batches.iter().map(|batch| batch.buys().count()).sum();
        let excluded: usize = batches.iter().map(|batch| batch.excluded_symbols).sum();
        info!(
            "{} strategy {}: {} batches, {} buy signals, {} symbols excluded",
            self.strategy.kind().as_str(),
            self.config.name,
            batches.len(),
            buys,
            excluded
        );
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn calendar() -> Vec<NaiveDate> {
        (1..=10)
            .map(|day| NaiveDate::from_ymd_opt(2024, 7, day).unwrap())
            .collect()
    }

    fn bar(symbol: &str, date: NaiveDate, price: f64) -> PriceBar {
        PriceBar {
            symbol: symbol.to_string(),
            date,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 100,
            adjusted_close: price,
        }
    }

    fn entry(date: NaiveDate, symbol: &str, score: f64, rank: u32) -> LabelEntry {
        LabelEntry {
            trade_date: date,
            label_name: "losers".to_string(),
            symbol: symbol.to_string(),
            score,
            rank,
        }
    }

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
            top_k: 2,
            positioning: PositionSizing::EqualWeight,
            initial_capital: 1_000.0,
            filter_rules: StrategyFilterRules::default(),
        }
    }

    fn labels_every_day(cal: &[NaiveDate]) -> LabelsByDate {
        group_labels(
            cal[1..]
                .iter()
                .flat_map(|date| {
                    vec![
                        entry(*date, "AAA", 9.0, 1),
                        entry(*date, "BBB", 6.0, 2),
                        entry(*date, "CCC", 3.0, 3),
                    ]
                })
                .collect(),
        )
    }

    fn full_book(cal: &[NaiveDate]) -> PriceBook {
        let bars = cal
            .iter()
            .flat_map(|date| {
                ["AAA", "BBB", "CCC"]
                    .iter()
                    .map(|symbol| bar(symbol, *date, 10.0))
                    .collect::<Vec<_>>()
            })
            .collect();
        PriceBook::from_bars(cal.to_vec(), bars)
    }

    #[test]
    fn plans_batches_from_the_first_labeled_session() {
        let cal = calendar();
        let generator = SignalGenerator::new(&config(), None).unwrap();
        let plans = generator.plan_all(&labels_every_day(&cal), &cal);

        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].label_date, cal[1]);
        assert_eq!(plans[0].buy_date, cal[2]);
        assert_eq!(plans[0].sell_date, cal[4]);
        assert_eq!(plans[1].label_date, cal[6]);
        assert_eq!(plans[1].sell_date, cal[9]);
    }

    #[test]
    fn short_calendar_truncates_batches() {
        let cal = calendar();
        let mut cfg = config();
        cfg.execution_count = 5;
        let generator = SignalGenerator::new(&cfg, None).unwrap();
        assert_eq!(generator.plan_all(&labels_every_day(&cal), &cal).len(), 2);
    }

    #[test]
    fn selects_top_k_in_rank_order() {
        let cal = calendar();
        let generator = SignalGenerator::new(&config(), None).unwrap();
        let batch = generator
            .generate(&labels_every_day(&cal), 0, &full_book(&cal))
            .unwrap();

        let buys: Vec<&str> = batch.buys().map(|s| s.symbol.as_str()).collect();
        assert_eq!(buys, vec!["AAA", "BBB"]);
        assert_eq!(batch.signals.len(), 4);
        assert!(batch
            .signals
            .iter()
            .filter(|s| s.action == SignalAction::Sell)
            .all(|s| s.effective_date == cal[4]));
        assert_eq!(batch.excluded_symbols, 0);
    }

    #[test]
    fn missing_buy_bar_drops_symbol_without_backfill() {
        let cal = calendar();
        let bars = cal
            .iter()
            .flat_map(|date| {
                let mut day = vec![bar("BBB", *date, 10.0), bar("CCC", *date, 10.0)];
                if *date != cal[2] {
                    day.push(bar("AAA", *date, 10.0));
                }
                day
            })
            .collect();
        let book = PriceBook::from_bars(cal.clone(), bars);
        let generator = SignalGenerator::new(&config(), None).unwrap();
        let batch = generator.generate(&labels_every_day(&cal), 0, &book).unwrap();

        let buys: Vec<&str> = batch.buys().map(|s| s.symbol.as_str()).collect();
        assert_eq!(buys, vec!["BBB"]);
        assert_eq!(batch.excluded_symbols, 1);
    }

    #[test]
    fn reversal_floor_excludes_extreme_drops() {
        let cal = calendar();
        let mut cfg = config();
        cfg.filter_rules.max_drop_pct = Some(8.0);
        let generator = SignalGenerator::new(&cfg, None).unwrap();
        let batch = generator
            .generate(&labels_every_day(&cal), 0, &full_book(&cal))
            .unwrap();

        let buys: Vec<&str> = batch.buys().map(|s| s.symbol.as_str()).collect();
        assert_eq!(buys, vec!["BBB", "CCC"]);
        assert_eq!(batch.excluded_symbols, 1);
    }

    #[test]
    fn rejects_incompatible_label_definition() {
        let cal = calendar();
        let definition = LabelDefinition {
            name: "gainers".to_string(),
            rule: RuleKind::LargestGain,
            top_k: 20,
            filters: LabelFilters::default(),
            date_range: DateRange::new(cal[0], cal[9]).unwrap(),
            created_at: Utc::now(),
        };
        let err = SignalGenerator::new(&config(), Some(&definition))
            .err()
            .unwrap();
        assert_eq!(err.code(), crate::errors::ErrorCode::InvalidConfig);

        let mut momentum = config();
        momentum.kind = StrategyKind::Momentum;
        assert!(SignalGenerator::new(&momentum, Some(&definition)).is_ok());
    }
}
