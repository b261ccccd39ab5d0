//! Error types for the submission pipeline

use thiserror::Error;

use crate::config::ConfigError;
use crate::crypt::EncryptionError;
use crate::ledger::LedgerError;
use crate::orchestrator::OrchestratorError;
use crate::progress::ProgressError;
use crate::storage::StoreError;
use crate::upload::UploadError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Progress store error: {0}")]
    Progress(#[from] ProgressError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Running again later may succeed without operator action
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_retryable(),
            Self::Upload(e) => e.is_retryable(),
            Self::Ledger(e) => e.is_retryable(),
            Self::Orchestrator(OrchestratorError::Ledger(e)) => e.is_retryable(),
            Self::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_keep_classification() {
        let err: AppError = StoreError::Transient("503".into()).into();
        assert!(err.is_retryable());

        let err: AppError = LedgerError::RecoveryNotConfirmed.into();
        assert!(!err.is_retryable());

        let err: AppError = ConfigError::Missing("S3_BUCKET").into();
        assert!(err.to_string().contains("S3_BUCKET"));
    }
}
