//! Submission descriptors, per-file outcomes and orchestrator errors

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ledger::{LedgerError, SubmissionState};
use crate::progress::ProgressError;

// ============================================================================
// Descriptors
// ============================================================================

/// One file of a submission, as declared by the submitter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Logical file id, unique within the submission
    pub file_id: String,
    pub path: PathBuf,
    /// Declared size in bytes
    pub size: u64,
    /// Declared SHA-256, lowercase hex
    pub sha256: String,
}

/// A submission handed in by the metadata layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionDescriptor {
    pub submission_id: String,
    pub files: Vec<FileDescriptor>,
}

impl SubmissionDescriptor {
    pub fn from_json(json: &str) -> Result<Self, OrchestratorError> {
        let descriptor: Self = serde_json::from_str(json)
            .map_err(|e| OrchestratorError::InvalidDescriptor(e.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Structural checks; file contents are checked during validation
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let invalid = |msg: String| Err(OrchestratorError::InvalidDescriptor(msg));

        if !is_safe_id(&self.submission_id) {
            return invalid(format!("bad submission id: {:?}", self.submission_id));
        }
        if self.files.is_empty() {
            return invalid("submission has no files".to_string());
        }

        let mut seen = HashSet::new();
        for file in &self.files {
            if !is_safe_id(&file.file_id) {
                return invalid(format!("bad file id: {:?}", file.file_id));
            }
            if !seen.insert(file.file_id.as_str()) {
                return invalid(format!("duplicate file id: {}", file.file_id));
            }
            let well_formed = file.sha256.len() == 64
                && file
                    .sha256
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
            if !well_formed {
                return invalid(format!("{}: sha256 must be 64 lowercase hex chars", file.file_id));
            }
        }

        Ok(())
    }
}

/// Ids become object-key and path components
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// ============================================================================
// Outcomes
// ============================================================================

/// Final status of one file in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Encrypted, uploaded and verified in this run
    Uploaded,
    /// The object was already committed with the expected size
    AlreadyUploaded,
    /// Failed validation against the declared size
    Invalid,
    /// Failed; `fatal` failures move the submission to `error`
    Failed { fatal: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub file_id: String,
    pub object_key: String,
    pub status: FileStatus,
    pub encrypted_len: Option<u64>,
    pub resumed_from_segment: u64,
    pub parts_uploaded: u32,
    pub parts_reused: u32,
    pub error: Option<String>,
}

impl FileOutcome {
    pub(crate) fn new(file_id: &str, object_key: &str, status: FileStatus) -> Self {
        Self {
            file_id: file_id.to_string(),
            object_key: object_key.to_string(),
            status,
            encrypted_len: None,
            resumed_from_segment: 0,
            parts_uploaded: 0,
            parts_reused: 0,
            error: None,
        }
    }

    pub(crate) fn failed(file_id: &str, object_key: &str, fatal: bool, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(file_id, object_key, FileStatus::Failed { fatal })
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, FileStatus::Uploaded | FileStatus::AlreadyUploaded)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.status, FileStatus::Failed { fatal: true } | FileStatus::Invalid)
    }
}

/// What a run achieved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReport {
    pub submission_id: String,
    /// Ledger head state when the run ended
    pub state: SubmissionState,
    pub files: Vec<FileOutcome>,
}

impl SubmissionReport {
    pub fn is_complete(&self) -> bool {
        !self.files.is_empty() && self.files.iter().all(FileOutcome::is_success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files.iter().filter(|f| !f.is_success())
    }

    pub fn file(&self, file_id: &str) -> Option<&FileOutcome> {
        self.files.iter().find(|f| f.file_id == file_id)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid submission descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Submission {submission_id} is {state} and cannot be processed")]
    NotRunnable {
        submission_id: String,
        state: SubmissionState,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Progress store error: {0}")]
    Progress(#[from] ProgressError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SubmissionDescriptor {
        SubmissionDescriptor {
            submission_id: "sub-1".into(),
            files: vec![FileDescriptor {
                file_id: "sample.bam".into(),
                path: "/data/sample.bam".into(),
                size: 10,
                sha256: "ab".repeat(32),
            }],
        }
    }

    #[test]
    fn test_parse_descriptor_json() {
        let json = r#"{
            "submission_id": "sub-1",
            "files": [
                { "file_id": "r1.fastq.gz", "path": "/in/r1.fastq.gz", "size": 42,
                  "sha256": "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855" }
            ]
        }"#;
        let descriptor = SubmissionDescriptor::from_json(json).unwrap();
        assert_eq!(descriptor.files[0].size, 42);
    }

    #[test]
    fn test_rejects_bad_descriptors() {
        let mut d = descriptor();
        d.files[0].sha256 = "AB".repeat(32);
        assert!(d.validate().is_err());

        let mut d = descriptor();
        d.files.push(d.files[0].clone());
        assert!(d.validate().is_err());

        let mut d = descriptor();
        d.files[0].file_id = "../escape".into();
        assert!(d.validate().is_err());

        let mut d = descriptor();
        d.files.clear();
        assert!(d.validate().is_err());

        assert!(descriptor().validate().is_ok());
    }
}
