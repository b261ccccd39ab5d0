//! Storage module for S3-compatible multipart backends
//!
//! Supports AWS S3, MinIO and Ceph RGW through [`S3MultipartStore`], plus an
//! in-process [`MemoryMultipartStore`].

pub mod memory;
mod s3_client;
pub mod traits;
mod types;

pub use memory::MemoryMultipartStore;
pub use s3_client::S3MultipartStore;
pub use traits::MultipartStore;
pub use types::*;
