//! Upload types for chunked multipart transfer

use std::collections::HashMap;
use std::time::Duration;

use crate::config::UploadConfig;
use crate::crypt::EncryptedContainer;
use crate::progress::ProgressError;
use crate::storage::{ObjectMetadata, StoreError};

// ============================================================================
// Options
// ============================================================================

/// Tuning for one uploader
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Preferred part size; raised when the object would exceed `max_parts`
    pub part_size: u64,
    /// Backend minimum for every part but the last
    pub min_part_size: u64,
    pub max_parts: u32,
    /// Parts in flight at once
    pub concurrency: usize,
    /// Attempts per operation, first try included
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Per-request timeout; expiry counts as a transient failure
    pub request_timeout: Duration,
    /// Treat a part receipt without a checksum as a mismatch
    pub require_checksum: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for UploadOptions {
    fn from(config: &UploadConfig) -> Self {
        Self {
            part_size: config.part_size,
            min_part_size: config.min_part_size,
            max_parts: config.max_parts,
            concurrency: config.concurrency.max(1),
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
            request_timeout: config.request_timeout(),
            require_checksum: true,
        }
    }
}

// ============================================================================
// Object Identity
// ============================================================================

/// Object metadata key holding the plaintext SHA-256 (hex)
pub const PLAINTEXT_SHA256_META: &str = "grz-plaintext-sha256";
/// Object metadata key holding the recipient key fingerprint
pub const RECIPIENT_META: &str = "grz-recipient";

/// What a committed container object must carry to count as this file's
///
/// Containers are not reproducible byte for byte (every encryption draws a
/// fresh session key), so identity is the plaintext digest, the recipient
/// and the container length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectIdentity {
    pub encrypted_len: u64,
    pub plaintext_sha256: String,
    pub recipient: String,
}

impl ObjectIdentity {
    pub fn of(container: &EncryptedContainer) -> Self {
        Self {
            encrypted_len: container.encrypted_len,
            plaintext_sha256: container.plaintext_sha256.clone(),
            recipient: container.recipient.clone(),
        }
    }

    /// User metadata to create the object with
    pub fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (PLAINTEXT_SHA256_META.to_string(), self.plaintext_sha256.clone()),
            (RECIPIENT_META.to_string(), self.recipient.clone()),
        ])
    }

    pub fn matches(&self, object: &ObjectMetadata) -> bool {
        object.size == self.encrypted_len
            && object.metadata.get(PLAINTEXT_SHA256_META) == Some(&self.plaintext_sha256)
            && object.metadata.get(RECIPIENT_META) == Some(&self.recipient)
    }
}

// ============================================================================
// Part Plan
// ============================================================================

/// One part of the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    pub part_number: i32,
    pub offset: u64,
    pub len: u64,
}

/// How a container of a given length splits into parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub total_len: u64,
    pub part_size: u64,
    pub part_count: u32,
}

impl PartPlan {
    pub fn new(total_len: u64, options: &UploadOptions) -> Result<Self, UploadError> {
        let max_parts = u64::from(options.max_parts.max(1));
        let part_size = options
            .part_size
            .max(options.min_part_size)
            .max(total_len.div_ceil(max_parts))
            .max(1);

        let part_count = total_len.div_ceil(part_size).max(1);
        if part_count > max_parts {
            return Err(UploadError::TooManyParts {
                parts: part_count,
                max: options.max_parts,
            });
        }

        Ok(Self {
            total_len,
            part_size,
            part_count: part_count as u32,
        })
    }

    pub fn part(&self, part_number: i32) -> Option<PartSpec> {
        if part_number < 1 || part_number as u32 > self.part_count {
            return None;
        }
        let offset = (part_number as u64 - 1) * self.part_size;
        Some(PartSpec {
            part_number,
            offset,
            len: self.part_size.min(self.total_len - offset),
        })
    }

    pub fn parts(&self) -> impl Iterator<Item = PartSpec> + '_ {
        (1..=self.part_count as i32).filter_map(|n| self.part(n))
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Summary of a finished upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub object_key: String,
    pub upload_id: String,
    pub part_count: u32,
    /// Parts sent by this run
    pub parts_uploaded: u32,
    /// Parts carried over from an earlier run
    pub parts_reused: u32,
    pub bytes_uploaded: u64,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("{operation} timed out")]
    Timeout { operation: String },

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Checksum mismatch on part {part_number}: local {expected}, storage {actual}")]
    ChecksumMismatch {
        part_number: i32,
        expected: String,
        actual: String,
    },

    #[error("Finalize failed, session kept for resume: {0}")]
    FinalizeFailed(String),

    #[error("Committed object is {actual} bytes, expected {expected}")]
    VerificationFailed { expected: u64, actual: u64 },

    #[error("Object needs {parts} parts (max: {max})")]
    TooManyParts { parts: u64, max: u32 },

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Progress store error: {0}")]
    Progress(#[from] ProgressError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Running the upload again may succeed with the persisted session
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Timeout { .. } | Self::RetriesExhausted { .. } | Self::FinalizeFailed(_) => true,
            _ => false,
        }
    }

    /// The container or the remote object cannot be trusted
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::VerificationFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn options(part_size: u64, max_parts: u32) -> UploadOptions {
        UploadOptions {
            part_size,
            min_part_size: 5 * MIB,
            max_parts,
            ..UploadOptions::default()
        }
    }

    #[test]
    fn test_plan_for_ten_mebibyte_container() {
        let plan = PartPlan::new(10_488_448, &options(5 * MIB, 1000)).unwrap();
        assert_eq!(plan.part_count, 3);

        let parts: Vec<_> = plan.parts().collect();
        assert_eq!(parts[0], PartSpec { part_number: 1, offset: 0, len: 5 * MIB });
        assert_eq!(parts[1].offset, 5 * MIB);
        assert_eq!(parts[2].len, 2688);
    }

    #[test]
    fn test_part_size_grows_to_respect_max_parts() {
        let plan = PartPlan::new(20_000 * MIB, &options(5 * MIB, 1000)).unwrap();
        assert_eq!(plan.part_size, 20 * MIB);
        assert_eq!(plan.part_count, 1000);
    }

    #[test]
    fn test_part_size_never_below_minimum() {
        let plan = PartPlan::new(12 * MIB, &options(MIB, 1000)).unwrap();
        assert_eq!(plan.part_size, 5 * MIB);
        assert_eq!(plan.part_count, 3);
    }

    #[test]
    fn test_small_object_is_one_part() {
        let plan = PartPlan::new(144, &options(5 * MIB, 1000)).unwrap();
        assert_eq!(plan.part_count, 1);
        assert_eq!(plan.part(1).unwrap().len, 144);
        assert!(plan.part(2).is_none());
        assert!(plan.part(0).is_none());
    }

    #[test]
    fn test_error_classes() {
        assert!(UploadError::Timeout { operation: "x".into() }.is_retryable());
        let mismatch = UploadError::ChecksumMismatch {
            part_number: 1,
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(!mismatch.is_retryable());
        assert!(mismatch.is_integrity_failure());
    }

    #[test]
    fn test_object_identity_needs_digest_and_recipient() {
        let identity = ObjectIdentity {
            encrypted_len: 144,
            plaintext_sha256: "ab".repeat(32),
            recipient: "cd".repeat(32),
        };
        let object = ObjectMetadata {
            key: "sub-1/files/a.grzc".into(),
            size: 144,
            last_modified: None,
            etag: None,
            metadata: identity.metadata(),
        };
        assert!(identity.matches(&object));

        let untagged = ObjectMetadata { metadata: HashMap::new(), ..object.clone() };
        assert!(!identity.matches(&untagged));

        let other_recipient = ObjectIdentity { recipient: "ef".repeat(32), ..identity.clone() };
        assert!(!other_recipient.matches(&object));

        let shorter = ObjectMetadata { size: 143, ..object };
        assert!(!identity.matches(&shorter));
    }
}
