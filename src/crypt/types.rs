//! Container constants and error types

use std::path::PathBuf;

use crate::progress::ProgressError;

// ============================================================================
// Constants
// ============================================================================

/// Container magic bytes
pub const MAGIC: &[u8; 8] = b"GRZCRYPT";

/// Container format version
pub const FORMAT_VERSION: u32 = 1;

/// Plaintext bytes per segment: 64 KiB
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 128;

/// Poly1305 tag appended to every segment
pub const TAG_LEN: usize = 16;

/// Symmetric key length
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// Wrapped session key length (key + tag)
pub const WRAPPED_KEY_LEN: usize = KEY_LEN + TAG_LEN;

/// Extension given to container objects and output files
pub const CONTAINER_EXTENSION: &str = "grzc";

/// HKDF info string for the session key wrap
pub const WRAP_INFO: &[u8] = b"grz-container-v1/wrap";

// ============================================================================
// Result Types
// ============================================================================

/// A finished container on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedContainer {
    pub path: PathBuf,
    pub plaintext_len: u64,
    pub encrypted_len: u64,
    /// SHA-256 (hex) of the plaintext, equal to the declared checksum
    pub plaintext_sha256: String,
    /// SHA-256 (hex) of the container bytes
    pub encrypted_sha256: String,
    /// Fingerprint of the recipient key the session key is sealed to
    pub recipient: String,
    pub segments: u64,
    /// First segment written by this run (0 for a fresh encryption)
    pub resumed_from_segment: u64,
}

/// Result of decrypting a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedSummary {
    pub plaintext_len: u64,
    pub plaintext_sha256: String,
    pub segments: u64,
}

// ============================================================================
// Error Types
// ============================================================================

/// Encryption engine errors
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Invalid key: {0}")]
    Key(String),

    #[error("Size mismatch: declared {declared} bytes, found {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("Digest mismatch: declared {declared}, computed {actual}")]
    DigestMismatch { declared: String, actual: String },

    #[error("Progress record does not match the file: {0}")]
    ProgressMismatch(String),

    #[error("Malformed container: {0}")]
    Malformed(String),

    #[error("Unsupported container version: {0}")]
    UnsupportedVersion(u32),

    #[error("Authentication failed at segment {0}")]
    Authentication(u64),

    #[error("Encryption cancelled")]
    Cancelled,

    #[error("Progress store error: {0}")]
    Progress(#[from] ProgressError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncryptionError {
    /// Integrity failures must never be retried against the same state
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::SizeMismatch { .. }
                | Self::DigestMismatch { .. }
                | Self::ProgressMismatch(_)
                | Self::Malformed(_)
                | Self::Authentication(_)
        )
    }

    /// The sidecar is unusable and encryption should start over from zero
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            Self::ProgressMismatch(_) | Self::Progress(ProgressError::Unseal)
        )
    }
}
