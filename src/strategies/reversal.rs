use crate::models::*;

/// Buys the day's biggest decliners and expects a bounce.
pub struct ReversalStrategy;

impl super::Strategy for ReversalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Reversal
    }

    fn accepts_rule(&self, rule: RuleKind) -> bool {
        rule.is_decline()
    }

    fn admits(&self, entry: &LabelEntry, filters: &StrategyFilterRules) -> bool {
        // Decline labels score the drop as a positive magnitude.
        match filters.max_drop_pct {
            Some(max_drop) => entry.score <= max_drop,
            None => true,
        }
    }

    fn describe_required_label(&self) -> &'static str {
        "a decline label (largest_drop or market_cap_drop)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;
    use chrono::NaiveDate;

    fn entry(score: f64) -> LabelEntry {
        LabelEntry {
            trade_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            label_name: "losers".to_string(),
            symbol: "AAA".to_string(),
            score,
            rank: 1,
        }
    }

    #[test]
    fn only_trades_decline_labels() {
        assert!(ReversalStrategy.accepts_rule(RuleKind::LargestDrop));
        assert!(ReversalStrategy.accepts_rule(RuleKind::MarketCapDrop));
        assert!(!ReversalStrategy.accepts_rule(RuleKind::LargestGain));
        assert!(!ReversalStrategy.accepts_rule(RuleKind::HighestVolume));
    }

    #[test]
    fn excludes_drops_deeper_than_the_floor() {
        let filters = StrategyFilterRules {
            max_drop_pct: Some(30.0),
            ..Default::default()
        };
        assert!(ReversalStrategy.admits(&entry(12.5), &filters));
        assert!(ReversalStrategy.admits(&entry(30.0), &filters));
        assert!(!ReversalStrategy.admits(&entry(45.0), &filters));
        assert!(ReversalStrategy.admits(&entry(45.0), &StrategyFilterRules::default()));
    }
}
