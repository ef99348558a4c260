use crate::models::*;

/// Label-driven entry policy. Decides which labels a strategy may trade and
/// which ranked entries it keeps.
pub trait Strategy {
    fn kind(&self) -> StrategyKind;

    fn accepts_rule(&self, rule: RuleKind) -> bool;

    /// Strategy-specific exclusion applied after the shared filter rules.
    fn admits(&self, _entry: &LabelEntry, _filters: &StrategyFilterRules) -> bool {
        true
    }

    fn describe_required_label(&self) -> &'static str;
}

#[path = "strategies/reversal.rs"]
pub mod reversal;

pub use reversal::ReversalStrategy;

#[path = "strategies/momentum.rs"]
pub mod momentum;

pub use momentum::MomentumStrategy;

pub fn create_strategy(kind: StrategyKind) -> Box<dyn Strategy + Send + Sync> {
    match kind {
        StrategyKind::Reversal => Box::new(ReversalStrategy),
        StrategyKind::Momentum => Box::new(MomentumStrategy),
    }
}
