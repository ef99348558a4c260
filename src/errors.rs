use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable failure classes reported on tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DataGap,
    InsufficientHistory,
    ComputationError,
    EmptySignalSet,
    NoCandidates,
    InvalidConfig,
    StorageUnavailable,
    Canceled,
    NotFound,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DataGap => "DATA_GAP",
            ErrorCode::InsufficientHistory => "INSUFFICIENT_HISTORY",
            ErrorCode::ComputationError => "COMPUTATION_ERROR",
            ErrorCode::EmptySignalSet => "EMPTY_SIGNAL_SET",
            ErrorCode::NoCandidates => "NO_CANDIDATES",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::NotFound => "NOT_FOUND",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("no price bar for {symbol} on {date}")]
    DataGap { symbol: String, date: NaiveDate },
    #[error("insufficient history: {0}")]
    InsufficientHistory(String),
    #[error("computation error: {0}")]
    ComputationError(String),
    #[error("empty signal set: {0}")]
    EmptySignalSet(String),
    #[error("no candidates: {0}")]
    NoCandidates(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("task canceled")]
    Canceled,
    #[error("not found: {0}")]
    NotFound(String),
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::DataGap { .. } => ErrorCode::DataGap,
            PipelineError::InsufficientHistory(_) => ErrorCode::InsufficientHistory,
            PipelineError::ComputationError(_) => ErrorCode::ComputationError,
            PipelineError::EmptySignalSet(_) => ErrorCode::EmptySignalSet,
            PipelineError::NoCandidates(_) => ErrorCode::NoCandidates,
            PipelineError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            PipelineError::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
            PipelineError::Canceled => ErrorCode::Canceled,
            PipelineError::NotFound(_) => ErrorCode::NotFound,
        }
    }

    /// Infrastructure and numeric failures may succeed on a second attempt;
    /// bad inputs never will.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::StorageUnavailable(_) | PipelineError::ComputationError(_)
        )
    }

    pub fn storage(err: anyhow::Error) -> Self {
        PipelineError::StorageUnavailable(format!("{:#}", err))
    }
}

/// Raised when a rerun reproduces a different result hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReproducibilityMismatch {
    pub experiment_id: String,
    pub stored_hash: String,
    pub new_hash: String,
}

impl fmt::Display for ReproducibilityMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "experiment {} reproduced hash {} but {} is on record",
            self.experiment_id, self.new_hash, self.stored_hash
        )
    }
}
