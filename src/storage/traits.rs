//! Multipart object-store abstraction

use std::collections::HashMap;

use async_trait::async_trait;

use super::types::{CompletedPart, ObjectMetadata, PartReceipt, RemotePart, StoreError};

/// Backend able to assemble one object from independently uploaded parts
#[async_trait]
pub trait MultipartStore: Send + Sync {
    /// Start a multipart session, returning its upload id
    ///
    /// `metadata` becomes the committed object's user metadata.
    async fn create_multipart(&self, key: &str, metadata: &HashMap<String, String>) -> Result<String, StoreError>;

    /// Upload one part; `checksum_sha256` is the base64 digest of `body`
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
        checksum_sha256: &str,
    ) -> Result<PartReceipt, StoreError>;

    /// All parts the store holds for a session, ascending by part number
    async fn list_parts(&self, key: &str, upload_id: &str) -> Result<Vec<RemotePart>, StoreError>;

    /// Commit the object from parts given in ascending order
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StoreError>;

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata, StoreError>;

    /// Delete a committed object; deleting a missing key succeeds
    async fn delete_object(&self, key: &str) -> Result<(), StoreError>;
}
