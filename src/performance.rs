use crate::errors::PipelineError;
use crate::models::*;
use statrs::statistics::Statistics;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn calculate(equity: &[EquityPoint], trades: &[Trade]) -> Result<Metrics, PipelineError> {
        if let Some(point) = equity.iter().find(|point| !point.value.is_finite()) {
            let culprit = trades
                .iter()
                .find(|trade| !trade.buy_price.is_finite() || !trade.shares.is_finite())
                .map(|trade| format!(" ({} in batch {})", trade.symbol, trade.batch_index))
                .unwrap_or_default();
            return Err(PipelineError::ComputationError(format!(
                "equity is not finite on {}{}",
                point.date, culprit
            )));
        }

        let values: Vec<f64> = equity.iter().map(|point| point.value).collect();
        let final_value = values.last().copied().unwrap_or(1.0);
        let trading_days = values.len().saturating_sub(1);

        let total_return = final_value - 1.0;
        let ann_return = Self::calculate_annualized_return(final_value, trading_days);
        let max_drawdown = Self::calculate_max_drawdown(&values);
        let sharpe_ratio = Self::calculate_sharpe_ratio(&values);
        let calmar_ratio = Self::calculate_calmar_ratio(ann_return, max_drawdown);

        let priced_returns: Vec<f64> = trades
            .iter()
            .filter(|trade| trade.is_priced())
            .map(|trade| trade.return_pct)
            .collect();
        let winning = priced_returns.iter().filter(|r| **r > 0.0).count();
        let win_rate = if priced_returns.is_empty() {
            0.0
        } else {
            winning as f64 / priced_returns.len() as f64
        };
        let avg_trade_return = Self::average(&priced_returns);

        let metrics = Metrics {
            total_return,
            ann_return,
            max_drawdown,
            sharpe_ratio,
            calmar_ratio,
            win_rate,
            avg_trade_return,
            total_trades: trades.len(),
            priced_trades: priced_returns.len(),
        };

        let named = [
            ("total_return", metrics.total_return),
            ("ann_return", metrics.ann_return),
            ("max_drawdown", metrics.max_drawdown),
            ("sharpe_ratio", metrics.sharpe_ratio),
            ("calmar_ratio", metrics.calmar_ratio),
            ("win_rate", metrics.win_rate),
            ("avg_trade_return", metrics.avg_trade_return),
        ];
        if let Some((name, value)) = named.iter().find(|(_, value)| !value.is_finite()) {
            let last_date = equity
                .last()
                .map(|point| point.date.to_string())
                .unwrap_or_else(|| "n/a".to_string());
            return Err(PipelineError::ComputationError(format!(
                "{} is {} for the curve ending {}",
                name, value, last_date
            )));
        }

        Ok(metrics)
    }

    fn calculate_annualized_return(final_value: f64, trading_days: usize) -> f64 {
        if trading_days == 0 {
            return 0.0;
        }
        if final_value <= 0.0 {
            return -1.0;
        }
        final_value.powf(TRADING_DAYS_PER_YEAR / trading_days as f64) - 1.0
    }

    fn average(values: &[f64]) -> f64 {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    pub fn calculate_sharpe_ratio(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }

        let returns: Vec<f64> = values
            .windows(2)
            .map(|window| {
                if window[0] > 0.0 {
                    window[1] / window[0] - 1.0
                } else {
                    0.0
                }
            })
            .collect();

        let mean_return = returns.clone().mean();
        let std_dev = returns.std_dev();

        if !std_dev.is_finite() || std_dev == 0.0 {
            return 0.0;
        }

        mean_return / std_dev * TRADING_DAYS_PER_YEAR.sqrt()
    }

    fn calculate_calmar_ratio(ann_return: f64, max_drawdown: f64) -> f64 {
        if max_drawdown == 0.0 {
            return 0.0;
        }
        ann_return / max_drawdown.abs()
    }

    /// Most negative (value - running peak) / running peak, or 0.
    pub fn calculate_max_drawdown(values: &[f64]) -> f64 {
        let Some(first) = values.first() else {
            return 0.0;
        };

        let mut peak = *first;
        let mut max_drawdown: f64 = 0.0;
        for value in values {
            if *value > peak {
                peak = *value;
            } else if peak > 0.0 {
                max_drawdown = max_drawdown.min((value - peak) / peak);
            }
        }
        max_drawdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn curve(values: &[f64]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(idx, value)| EquityPoint {
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Days::new(idx as u64),
                value: *value,
            })
            .collect()
    }

    fn trade(return_pct: f64) -> Trade {
        Trade {
            batch_index: 0,
            symbol: "AAA".to_string(),
            buy_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            buy_price: 10.0,
            sell_date: NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            sell_price: 10.0 * (1.0 + return_pct),
            shares: 1.0,
            return_pct,
        }
    }

    #[test]
    fn flat_curve_has_zero_metrics() {
        let metrics = PerformanceCalculator::calculate(&curve(&[1.0; 10]), &[]).unwrap();
        assert_eq!(metrics.total_return, 0.0);
        assert_eq!(metrics.ann_return, 0.0);
        assert_eq!(metrics.max_drawdown, 0.0);
        assert_eq!(metrics.sharpe_ratio, 0.0);
        assert_eq!(metrics.calmar_ratio, 0.0);
        assert_eq!(metrics.win_rate, 0.0);
    }

    #[test]
    fn drawdown_from_peak() {
        let drawdown = PerformanceCalculator::calculate_max_drawdown(&[1.0, 1.2, 0.9, 1.1]);
        assert!((drawdown - (-0.25)).abs() < 1e-12);
        let metrics =
            PerformanceCalculator::calculate(&curve(&[1.0, 1.2, 0.9, 1.1]), &[]).unwrap();
        assert!((metrics.max_drawdown + 0.25).abs() < 1e-12);
        assert!((metrics.total_return - 0.1).abs() < 1e-12);
        let expected_ann = 1.1_f64.powf(252.0 / 3.0) - 1.0;
        assert!(((metrics.ann_return - expected_ann) / expected_ann).abs() < 1e-9);
        assert!((metrics.calmar_ratio - expected_ann / 0.25).abs() / metrics.calmar_ratio < 1e-9);
    }

    #[test]
    fn single_point_curve_annualizes_to_zero() {
        let metrics = PerformanceCalculator::calculate(&curve(&[1.0]), &[]).unwrap();
        assert_eq!(metrics.ann_return, 0.0);
        assert_eq!(metrics.sharpe_ratio, 0.0);
    }

    #[test]
    fn sharpe_uses_sample_standard_deviation() {
        let values = [1.0, 1.01, 1.0, 1.02];
        let returns = [0.01, 1.0 / 1.01 - 1.0, 0.02];
        let mean = returns.iter().sum::<f64>() / 3.0;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / 2.0;
        let expected = mean / var.sqrt() * 252.0_f64.sqrt();
        let sharpe = PerformanceCalculator::calculate_sharpe_ratio(&values);
        assert!(((sharpe - expected) / expected).abs() < 1e-9);
    }

    #[test]
    fn trade_aggregates_skip_unpriced_trades() {
        let mut unpriced = trade(0.0);
        unpriced.sell_price = f64::NAN;
        unpriced.return_pct = f64::NAN;
        let trades = vec![trade(0.1), trade(-0.05), trade(0.03), unpriced];
        let metrics = PerformanceCalculator::calculate(&curve(&[1.0, 1.01]), &trades).unwrap();
        assert_eq!(metrics.total_trades, 4);
        assert_eq!(metrics.priced_trades, 3);
        assert!((metrics.win_rate - 2.0 / 3.0).abs() < 1e-12);
        assert!((metrics.avg_trade_return - 0.08 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn non_finite_equity_is_a_computation_error() {
        let err = PerformanceCalculator::calculate(&curve(&[1.0, f64::NAN]), &[]).unwrap_err();
        assert_eq!(err.code(), crate::errors::ErrorCode::ComputationError);
        assert!(err.to_string().contains("2024-01-02"));
    }
}
