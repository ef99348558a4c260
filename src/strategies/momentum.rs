use crate::models::*;

/// Buys the day's strongest gainers.
pub struct MomentumStrategy;

impl super::Strategy for MomentumStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Momentum
    }

    fn accepts_rule(&self, rule: RuleKind) -> bool {
        rule.is_gain()
    }

    fn describe_required_label(&self) -> &'static str {
        "a gain label (largest_gain or market_cap_gain)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;

    #[test]
    fn trades_only_gain_labels() {
        let strategy = MomentumStrategy;
        assert!(strategy.accepts_rule(RuleKind::LargestGain));
        assert!(strategy.accepts_rule(RuleKind::MarketCapGain));
        assert!(!strategy.accepts_rule(RuleKind::LargestDrop));
        assert!(!strategy.accepts_rule(RuleKind::HighestVolume));
    }
}
