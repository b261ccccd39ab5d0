//! Ledger records, projections and errors

use serde::{Deserialize, Serialize};

use super::state::SubmissionState;

// ============================================================================
// Records
// ============================================================================

/// One signed, hash-linked state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub submission_id: String,
    pub sequence: i64,
    pub prior_hash: String,
    pub state: SubmissionState,
    pub data: Option<serde_json::Value>,
    pub timestamp: String,
    pub author: String,
    /// Ed25519 signature, lowercase hex
    pub signature: String,
    pub content_hash: String,
}

/// Current head of a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub head_sequence: i64,
    pub head_hash: String,
    pub head_state: SubmissionState,
    pub created_at: String,
    pub updated_at: String,
}

/// A registered author key with its revocation, if any
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorKey {
    pub author_name: String,
    pub public_key: String,
    pub comment: Option<String>,
    pub registered_at: String,
    pub revoked_at: Option<String>,
}

impl AuthorKey {
    /// Whether the key could sign at `timestamp`
    pub fn active_at(&self, timestamp: &str) -> bool {
        self.registered_at.as_str() <= timestamp
            && self
                .revoked_at
                .as_deref()
                .map_or(true, |revoked| timestamp < revoked)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Explicit operator sign-off required to leave the error state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfirmation {
    pub operator: String,
    pub reason: String,
}

impl OperatorConfirmation {
    pub fn new(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            reason: reason.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.operator.trim().is_empty() && !self.reason.trim().is_empty()
    }
}

/// Result of walking a submission's chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    Intact { records: u64, head_hash: String },
    Broken { sequence: i64, reason: String },
}

impl ChainStatus {
    pub fn is_intact(&self) -> bool {
        matches!(self, Self::Intact { .. })
    }

    pub fn broken_at(&self) -> Option<i64> {
        match self {
            Self::Broken { sequence, .. } => Some(*sequence),
            Self::Intact { .. } => None,
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct StateRecordRow {
    pub submission_id: String,
    pub sequence: i64,
    pub prior_hash: String,
    pub state: String,
    pub data: Option<String>,
    pub timestamp: String,
    pub author_name: String,
    pub signature: String,
    pub content_hash: String,
}

impl TryFrom<StateRecordRow> for StateRecord {
    type Error = LedgerError;

    fn try_from(row: StateRecordRow) -> Result<Self, Self::Error> {
        let state: SubmissionState = row.state.parse().map_err(|e: String| {
            LedgerError::Corrupt(format!("{} #{}: {}", row.submission_id, row.sequence, e))
        })?;
        let data: Option<serde_json::Value> = row.data.as_deref().map(serde_json::from_str).transpose()?;

        Ok(Self {
            submission_id: row.submission_id,
            sequence: row.sequence,
            prior_hash: row.prior_hash,
            state,
            data,
            timestamp: row.timestamp,
            author: row.author_name,
            signature: row.signature,
            content_hash: row.content_hash,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SubmissionRow {
    pub id: String,
    pub head_sequence: i64,
    pub head_hash: String,
    pub head_state: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = LedgerError;

    fn try_from(row: SubmissionRow) -> Result<Self, Self::Error> {
        let head_state: SubmissionState = row
            .head_state
            .parse()
            .map_err(|e: String| LedgerError::Corrupt(format!("submission {}: {}", row.id, e)))?;

        Ok(Self {
            id: row.id,
            head_sequence: row.head_sequence,
            head_hash: row.head_hash,
            head_state,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AuthorKeyEventRow {
    pub author_name: String,
    pub public_key: String,
    pub action: String,
    pub comment: Option<String>,
    pub recorded_at: String,
}

// ============================================================================
// Error Types
// ============================================================================

/// Ledger error types
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Submission not found: {0}")]
    SubmissionNotFound(String),

    #[error("Submission already registered: {0}")]
    DuplicateSubmission(String),

    #[error("Head of {submission_id} moved (expected sequence {expected}, found {found})")]
    ConcurrentModification {
        submission_id: String,
        expected: i64,
        found: i64,
    },

    #[error("Transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: SubmissionState,
        to: SubmissionState,
    },

    #[error("Recovery requires an operator and a reason")]
    RecoveryNotConfirmed,

    #[error("Submission {submission_id} is {state}, not in error")]
    NothingToRecover {
        submission_id: String,
        state: SubmissionState,
    },

    #[error("No active key registered for author {0}")]
    UnregisteredAuthor(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Database schema version {found} is newer than supported version {supported}")]
    OutdatedSchema { found: i64, supported: i64 },

    #[error("Write transaction already closed")]
    TransactionClosed,

    #[error("Corrupt ledger data: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    /// Retrying against the new head may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}
