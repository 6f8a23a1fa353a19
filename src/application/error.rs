use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::domain::BalanceOverflow;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthorized: no authenticated caller")]
    Unauthorized,

    #[error("User not found")]
    UserNotFound,

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Too many requests. Please try again later.")]
    RateLimited {
        remaining: u32,
        reset_in_seconds: Option<u64>,
    },

    #[error("Request blocked: {0}")]
    Blocked(String),

    #[error("Receipt extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("{service} did not answer within {after:?}")]
    ExternalTimeout {
        service: &'static str,
        after: Duration,
    },

    #[error("Storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Stable, machine-readable classification of an [`AppError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Unauthorized,
    UserNotFound,
    AccountNotFound,
    TransactionNotFound,
    InvalidInput,
    RateLimited,
    Blocked,
    ExtractionFailed,
    ExternalTimeout,
    StorageFailure,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Unauthorized => ErrorKind::Unauthorized,
            AppError::UserNotFound => ErrorKind::UserNotFound,
            AppError::AccountNotFound(_) => ErrorKind::AccountNotFound,
            AppError::TransactionNotFound(_) => ErrorKind::TransactionNotFound,
            AppError::InvalidInput(_) => ErrorKind::InvalidInput,
            AppError::RateLimited { .. } => ErrorKind::RateLimited,
            AppError::Blocked(_) => ErrorKind::Blocked,
            AppError::ExtractionFailed(_) => ErrorKind::ExtractionFailed,
            AppError::ExternalTimeout { .. } => ErrorKind::ExternalTimeout,
            AppError::Storage(_) => ErrorKind::StorageFailure,
        }
    }

    /// Whether the same request may succeed if the caller tries again later.
    /// The ledger itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::RateLimited { .. } | AppError::ExternalTimeout { .. } | AppError::Storage(_)
        )
    }
}

impl From<BalanceOverflow> for AppError {
    fn from(e: BalanceOverflow) -> Self {
        AppError::InvalidInput(e.to_string())
    }
}
