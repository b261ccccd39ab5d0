//! Checksum/Progress Store
//!
//! Crash-safe per-file state for the pipeline:
//! - Encryption progress (segments committed, running digests, sealed session key)
//! - The remote multipart session and its acknowledged parts
//!
//! Both halves share one sidecar file so they are always deleted together.

pub mod checksum;
pub mod store;
pub mod types;

pub use checksum::{hash_prefix, sha256_base64, sha256_hex, snapshot_hex};
pub use store::ProgressStore;
pub use types::*;
