pub mod backtest;
pub mod experiments;
pub mod export_market_data;
pub mod import_market_data;
pub mod label;
pub mod labels;
pub mod progress;
pub mod rerun;
