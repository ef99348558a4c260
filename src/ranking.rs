use crate::data_context::{market_cap_of, PriceSource};
use crate::errors::PipelineError;
use crate::models::{DateRange, LabelEntry, LabelFilters, PriceBar, RuleKind};
use crate::task_status::TaskStatusHandle;
use chrono::NaiveDate;
use log::{debug, info};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

const RANKING_PROGRESS_START: u8 = 5;
const RANKING_PROGRESS_END: u8 = 90;

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    symbol: String,
    score: f64,
}

fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.symbol.cmp(&b.symbol))
}

/// Sorts by descending score then ascending symbol and keeps `top_k`.
fn select_top(candidates: &mut Vec<Candidate>, top_k: usize) {
    candidates.sort_by(compare_candidates);
    candidates.truncate(top_k);
}

fn pct_change(current: f64, previous: f64) -> f64 {
    (current - previous) / previous * 100.0
}

/// Output of a streaming label run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelRun {
    pub dates: Vec<NaiveDate>,
    pub entries: Vec<LabelEntry>,
    /// Symbol-days dropped for a missing bar.
    pub data_gaps: usize,
    /// Symbol-days dropped by filters or a non-finite score.
    pub excluded: usize,
    pub unavailable_symbols: usize,
}

#[derive(Default)]
struct SymbolScores {
    scores: Vec<(NaiveDate, f64)>,
    data_gaps: usize,
    excluded: usize,
    unavailable: bool,
}

enum Scored {
    Candidate(f64),
    Gap,
    Excluded,
}

#[derive(Debug, Clone)]
pub struct RankingEngine {
    symbol_batch_size: usize,
    concurrency: usize,
    shares_outstanding: HashMap<String, f64>,
}

impl Default for RankingEngine {
    fn default() -> Self {
        Self::new(200, num_cpus::get())
    }
}

impl RankingEngine {
    pub fn new(symbol_batch_size: usize, concurrency: usize) -> Self {
        Self {
            symbol_batch_size: symbol_batch_size.max(1),
            concurrency: concurrency.max(1),
            shares_outstanding: HashMap::new(),
        }
    }

    pub fn with_shares_outstanding(mut self, shares: HashMap<String, f64>) -> Self {
        self.shares_outstanding = shares;
        self
    }

    fn score(
        rule: RuleKind,
        filters: &LabelFilters,
        bar: &PriceBar,
        prev: Option<&PriceBar>,
        shares: Option<f64>,
    ) -> Scored {
        let needs_prior = rule.needs_prior_day() || filters.needs_prior_day();
        if needs_prior && prev.is_none() {
            return Scored::Gap;
        }

        let market_cap = market_cap_of(bar, shares);
        if let Some(min_cap) = filters.min_market_cap {
            if market_cap.is_nan() || market_cap < min_cap {
                return Scored::Excluded;
            }
        }
        if let Some(min_volume) = filters.min_volume {
            if bar.volume < min_volume {
                return Scored::Excluded;
            }
        }
        if let Some(prev) = prev {
            let change = pct_change(bar.close, prev.close);
            if let Some(min_change) = filters.min_change_pct {
                if change.is_nan() || change < min_change {
                    return Scored::Excluded;
                }
            }
            if let Some(max_change) = filters.max_change_pct {
                if change.is_nan() || change > max_change {
                    return Scored::Excluded;
                }
            }
        }

        let score = match (rule, prev) {
            (RuleKind::LargestGain, Some(prev)) => pct_change(bar.close, prev.close),
            (RuleKind::LargestDrop, Some(prev)) => -pct_change(bar.close, prev.close),
            (RuleKind::MarketCapGain, Some(prev)) => {
                pct_change(market_cap, market_cap_of(prev, shares))
            }
            (RuleKind::MarketCapDrop, Some(prev)) => {
                -pct_change(market_cap, market_cap_of(prev, shares))
            }
            (RuleKind::HighestVolume, _) => bar.volume as f64,
            (RuleKind::HighestTurnover, _) => match shares {
                Some(shares) if shares > 0.0 => bar.volume as f64 / shares,
                _ => bar.volume as f64 / bar.close,
            },
            _ => return Scored::Gap,
        };

        if score.is_finite() {
            Scored::Candidate(score)
        } else {
            Scored::Excluded
        }
    }

    /// Ranks every symbol with a bar on `date`. The prior session is the
    /// latest date before `date` present anywhere in `prices`.
    pub fn rank(
        &self,
        prices: &[PriceBar],
        rule: RuleKind,
        date: NaiveDate,
        top_k: usize,
        filters: &LabelFilters,
        label_name: &str,
    ) -> Vec<LabelEntry> {
        let prev_date = prices
            .iter()
            .map(|bar| bar.date)
            .filter(|d| *d < date)
            .max();

        let mut today: BTreeMap<&str, &PriceBar> = BTreeMap::new();
        let mut previous: HashMap<&str, &PriceBar> = HashMap::new();
        for bar in prices {
            if bar.date == date {
                today.insert(bar.symbol.as_str(), bar);
            } else if Some(bar.date) == prev_date {
                previous.insert(bar.symbol.as_str(), bar);
            }
        }

        let mut candidates: Vec<Candidate> = today
            .into_iter()
            .filter_map(|(symbol, bar)| {
                let shares = self.shares_outstanding.get(symbol).copied();
                match Self::score(rule, filters, bar, previous.get(symbol).copied(), shares) {
                    Scored::Candidate(score) => Some(Candidate {
                        symbol: symbol.to_string(),
                        score,
                    }),
                    _ => None,
                }
            })
            .collect();

        select_top(&mut candidates, top_k);
        to_entries(date, label_name, candidates)
    }

    /// Ranks every trading date in `range` over the whole universe, reading
    /// `symbol_batch_size` symbols at a time.
    #[allow(clippy::too_many_arguments)]
    pub fn rank_range(
        &self,
        source: &dyn PriceSource,
        rule: RuleKind,
        range: DateRange,
        top_k: usize,
        filters: &LabelFilters,
        label_name: &str,
        status: &TaskStatusHandle,
    ) -> Result<LabelRun, PipelineError> {
        if top_k == 0 {
            return Err(PipelineError::InvalidConfig("top_k must be >= 1".to_string()));
        }

        let dates = source.trading_dates(range.start, range.end);
        if dates.is_empty() {
            return Err(PipelineError::InsufficientHistory(format!(
                "no trading sessions in {}",
                range
            )));
        }

        let needs_prior = rule.needs_prior_day() || filters.needs_prior_day();
        let first_prior = if needs_prior {
            source.previous_trading_date(dates[0])
        } else {
            None
        };
        if needs_prior && dates.len() == 1 && first_prior.is_none() {
            return Err(PipelineError::InsufficientHistory(format!(
                "{} needs the session before {}",
                rule, dates[0]
            )));
        }
        let fetch_start = first_prior.unwrap_or(dates[0]);
        let prior_of: Vec<Option<NaiveDate>> = dates
            .iter()
            .enumerate()
            .map(|(idx, _)| {
                if idx == 0 {
                    first_prior
                } else {
                    Some(dates[idx - 1])
                }
            })
            .collect();

        let mut symbols = source.symbols();
        symbols.sort();
        let total_symbols = symbols.len();
        let batch_count = total_symbols.div_ceil(self.symbol_batch_size).max(1);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .build()
            .map_err(|err| {
                PipelineError::ComputationError(format!("ranking pool unavailable: {}", err))
            })?;

        info!(
            "Ranking {} symbols over {} sessions with {} ({} batches of {})",
            total_symbols,
            dates.len(),
            rule,
            batch_count,
            self.symbol_batch_size
        );
        status.checkpoint(RANKING_PROGRESS_START, format!("Ranking {} symbols", total_symbols))?;

        let mut run = LabelRun {
            dates: dates.clone(),
            ..Default::default()
        };
        let mut per_date: BTreeMap<NaiveDate, Vec<Candidate>> = BTreeMap::new();
        let mut processed = 0usize;

        for (batch_idx, chunk) in symbols.chunks(self.symbol_batch_size).enumerate() {
            let scored: Vec<(String, SymbolScores)> = pool.install(|| {
                chunk
                    .par_iter()
                    .map(|symbol| {
                        let scores = Self::score_symbol(
                            source,
                            symbol,
                            rule,
                            filters,
                            &dates,
                            &prior_of,
                            fetch_start,
                            range.end,
                        );
                        (symbol.clone(), scores)
                    })
                    .collect()
            });

            for (symbol, scores) in scored {
                run.data_gaps += scores.data_gaps;
                run.excluded += scores.excluded;
                if scores.unavailable {
                    run.unavailable_symbols += 1;
                }
                for (date, score) in scores.scores {
                    per_date.entry(date).or_default().push(Candidate {
                        symbol: symbol.clone(),
                        score,
                    });
                }
            }
            for candidates in per_date.values_mut() {
                select_top(candidates, top_k);
            }

            processed += chunk.len();
            debug!(
                "Ranking batch {}/{} done ({} symbols)",
                batch_idx + 1,
                batch_count,
                processed
            );
            let span = (RANKING_PROGRESS_END - RANKING_PROGRESS_START) as usize;
            let progress = RANKING_PROGRESS_START as usize + span * (batch_idx + 1) / batch_count;
            status.checkpoint(
                progress as u8,
                format!("Ranked {}/{} symbols", processed, total_symbols),
            )?;
        }

        for date in &dates {
            if let Some(candidates) = per_date.remove(date) {
                run.entries.extend(to_entries(*date, label_name, candidates));
            }
        }

        if run.entries.is_empty() {
            return Err(PipelineError::NoCandidates(format!(
                "{} produced no candidates in {}",
                rule, range
            )));
        }

        info!(
            "Ranked {} entries for {} ({} data gaps, {} excluded, {} symbols unavailable)",
            run.entries.len(),
            label_name,
            run.data_gaps,
            run.excluded,
            run.unavailable_symbols
        );
        Ok(run)
    }

    #[allow(clippy::too_many_arguments)]
    fn score_symbol(
        source: &dyn PriceSource,
        symbol: &str,
        rule: RuleKind,
        filters: &LabelFilters,
        dates: &[NaiveDate],
        prior_of: &[Option<NaiveDate>],
        fetch_start: NaiveDate,
        fetch_end: NaiveDate,
    ) -> SymbolScores {
        let mut result = SymbolScores::default();
        let bars = match source.get_bars(symbol, fetch_start, fetch_end) {
            Ok(bars) => bars,
            Err(err) => {
                debug!("Skipping {}: {}", symbol, err);
                result.unavailable = true;
                return result;
            }
        };
        let by_date: HashMap<NaiveDate, &PriceBar> = bars.iter().map(|bar| (bar.date, bar)).collect();
        let shares = source.shares_outstanding(symbol);

        for (date, prior) in dates.iter().zip(prior_of) {
            let Some(bar) = by_date.get(date) else {
                result.data_gaps += 1;
                continue;
            };
            let prev = prior.and_then(|prior| by_date.get(&prior).copied());
            match Self::score(rule, filters, bar, prev, shares) {
                Scored::Candidate(score) => result.scores.push((*date, score)),
                Scored::Gap => result.data_gaps += 1,
                Scored::Excluded => result.excluded += 1,
            }
        }
        result
    }
}

fn to_entries(date: NaiveDate, label_name: &str, candidates: Vec<Candidate>) -> Vec<LabelEntry> {
    candidates
        .into_iter()
        .enumerate()
        .map(|(idx, candidate)| LabelEntry {
            trade_date: date,
            label_name: label_name.to_string(),
            symbol: candidate.symbol,
            score: candidate.score,
            rank: idx as u32 + 1,
        })
        .collect()
}
