//! Chunked Upload Module
//!
//! Moves encrypted containers into object storage with:
//! - Multipart upload sized to the backend's part limits
//! - Bounded part concurrency with per-request timeouts
//! - Exponential backoff on transient failures
//! - SHA-256 verification of every acknowledged part
//! - Resume by re-attaching to the persisted multipart session
//!
//! Flow:
//! 1. Plan parts for the container length
//! 2. Re-attach to the persisted session (list parts) or create a new one
//! 3. Upload missing parts, persisting each acknowledgement
//! 4. Complete with the ordered part list, then verify the object size

pub mod backoff;
pub mod types;
pub mod uploader;

pub use backoff::Backoff;
pub use types::*;
pub use uploader::ChunkedUploader;
