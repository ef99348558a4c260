pub mod commands;
pub mod config;
pub mod context;
pub mod data_context;
pub mod database;
pub mod errors;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod performance;
pub mod pipeline;
pub mod ranking;
pub mod retry;
pub mod signals;
pub mod simulator;
pub mod storage;
pub mod strategy;
pub mod task_status;
pub mod worker_pool;
