//! Sidecar record types for crash-safe resumption

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Current sidecar document version
pub const SIDECAR_VERSION: u32 = 1;

/// Name of the per-state-dir sealing key file
pub const SEALING_KEY_FILE: &str = "sidecar.key";

/// Digest of the empty byte string, the starting point of every running hash
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

// ============================================================================
// File Identity
// ============================================================================

/// Identifies one file of one submission
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub submission_id: String,
    pub file_id: String,
}

impl FileKey {
    pub fn new(submission_id: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            submission_id: submission_id.into(),
            file_id: file_id.into(),
        }
    }

    /// Bytes bound into the sealed session key as associated data
    pub fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.submission_id.len() + self.file_id.len() + 1);
        aad.extend_from_slice(self.submission_id.as_bytes());
        aad.push(0);
        aad.extend_from_slice(self.file_id.as_bytes());
        aad
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.submission_id, self.file_id)
    }
}

// ============================================================================
// Encryption Progress
// ============================================================================

/// Per-file encryption progress, rewritten after every committed segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub file_id: String,

    /// Declared plaintext size
    pub plaintext_len: u64,

    /// Declared plaintext SHA-256 (hex)
    pub declared_sha256: String,

    /// SHA-256 of the recipient public key the container is sealed to
    pub recipient_fingerprint: String,

    /// Number of segments durably written to the output
    pub segments_completed: u64,

    /// Plaintext bytes consumed by the completed segments
    pub plaintext_consumed: u64,

    /// SHA-256 (hex) of the consumed plaintext prefix
    pub plaintext_prefix_sha256: String,

    /// Container bytes written, header included
    pub encrypted_written: u64,

    /// SHA-256 (hex) of the written container prefix
    pub encrypted_prefix_sha256: String,

    /// Session key sealed under the local sidecar key (base64 nonce || ciphertext)
    pub sealed_session_key: String,

    /// Set once the final segment is written and the digest verified
    pub completed: bool,

    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Upload Session
// ============================================================================

/// A part accepted by the object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPart {
    pub part_number: i32,
    pub size: u64,
    pub etag: String,
    /// Base64 SHA-256 of the part body
    pub checksum_sha256: String,
}

/// A remote multipart session, persisted so a restarted process re-attaches to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub object_key: String,
    pub upload_id: String,
    pub part_size: u64,

    /// Length of the container the session uploads
    pub container_len: u64,

    /// SHA-256 (hex) of the container the session uploads
    pub container_sha256: String,

    /// Parts acknowledged and verified so far, in any order
    pub parts: Vec<UploadedPart>,

    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn part(&self, part_number: i32) -> Option<&UploadedPart> {
        self.parts.iter().find(|p| p.part_number == part_number)
    }

    /// Record an acknowledged part, replacing an earlier attempt at the same number
    pub fn record_part(&mut self, part: UploadedPart) {
        self.parts.retain(|p| p.part_number != part.part_number);
        self.parts.push(part);
    }
}

// ============================================================================
// Sidecar Document
// ============================================================================

/// On-disk sidecar: progress and upload session live and die together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    pub version: u32,
    pub key: FileKey,
    pub progress: Option<ProgressRecord>,
    pub upload: Option<UploadSession>,
}

impl Sidecar {
    pub fn new(key: FileKey) -> Self {
        Self {
            version: SIDECAR_VERSION,
            key,
            progress: None,
            upload: None,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Progress store errors
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("Sidecar IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sidecar is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported sidecar version: {0}")]
    UnsupportedVersion(u32),

    #[error("Sidecar belongs to {found}, expected {expected}")]
    KeyMismatch { expected: String, found: String },

    #[error("Invalid sealing key file: {0}")]
    InvalidSealingKey(String),

    #[error("Sealed session key could not be opened")]
    Unseal,
}
