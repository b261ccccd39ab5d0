//! Storage types

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata about a committed object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    /// User metadata set when the object was created
    pub metadata: HashMap<String, String>,
}

/// What the store returns for an accepted part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub etag: String,
    /// Base64 SHA-256 computed by the store, when it reports one
    pub checksum_sha256: Option<String>,
}

/// A part the store already holds for a multipart session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePart {
    pub part_number: i32,
    pub etag: String,
    pub size: u64,
    pub checksum_sha256: Option<String>,
}

/// A part reference handed to multipart completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
    pub checksum_sha256: Option<String>,
}

/// Strip the quotes some backends wrap ETags in
pub fn normalize_etag(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Throttling, 5xx, dispatch and response failures
    #[error("Transient storage error: {0}")]
    Transient(String),

    #[error("Multipart upload not found: {0}")]
    NoSuchUpload(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    /// The store recomputed the part checksum and it did not match
    #[error("Checksum rejected by storage: {0}")]
    ChecksumRejected(String),

    #[error("Storage error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_etag() {
        assert_eq!(normalize_etag("\"abc\""), "abc");
        assert_eq!(normalize_etag("abc"), "abc");
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(StoreError::Transient("503".into()).is_retryable());
        assert!(!StoreError::NoSuchUpload("u".into()).is_retryable());
        assert!(!StoreError::ChecksumRejected("p1".into()).is_retryable());
    }
}
