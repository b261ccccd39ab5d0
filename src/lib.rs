//! GRZ Submission Pipeline
//!
//! Encrypts genomic submission files into resumable public-key containers,
//! uploads them through the multipart API of an S3-compatible store, and
//! records every lifecycle step in a signed, hash-chained ledger.
//!
//! # Modules
//!
//! - `crypt`: container format, resumable encryption and decryption
//! - `progress`: crash-safe per-file sidecars
//! - `storage`: multipart object-store backends (S3 and in-memory)
//! - `upload`: chunked, resumable multipart uploader
//! - `ledger`: submission state ledger
//! - `orchestrator`: drives a submission end to end

pub mod cancel;
pub mod config;
pub mod crypt;
pub mod db;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod progress;
pub mod state;
pub mod storage;
pub mod upload;

pub use cancel::CancelFlag;
pub use error::{AppError, Result};
