//! In-memory multipart backend
//!
//! Behaves like S3 for the operations the uploader uses (part overwrite,
//! `NoSuchUpload`, minimum part size on completion) and can inject faults.
//! Used by tests and local dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::traits::MultipartStore;
use super::types::{
    normalize_etag, CompletedPart, ObjectMetadata, PartReceipt, RemotePart, StoreError,
};
use crate::progress::{sha256_base64, sha256_hex};

/// S3's minimum size for every part but the last
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
struct StoredPart {
    data: Vec<u8>,
    etag: String,
    checksum_sha256: String,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    metadata: HashMap<String, String>,
    parts: BTreeMap<i32, StoredPart>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Transient failures to return before part uploads succeed again
    transient_uploads: u32,
    /// Terminal failures for specific part numbers
    failing_parts: HashMap<i32, u32>,
    /// Part numbers whose receipts carry a wrong checksum
    corrupt_checksums: Vec<i32>,
    transient_completes: u32,
    /// Parts that never answer, to exercise request timeouts
    stalled_parts: Vec<i32>,
    /// Completions that commit an object one byte short
    truncated_commits: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    uploads: HashMap<String, PendingUpload>,
    objects: HashMap<String, StoredObject>,
    next_upload: u64,
    faults: Faults,
    upload_calls: Vec<i32>,
    aborted: Vec<String>,
    completes: u32,
}

/// An in-memory multipart store
#[derive(Debug, Clone)]
pub struct MemoryMultipartStore {
    state: Arc<Mutex<MemoryState>>,
    min_part_size: u64,
}

impl Default for MemoryMultipartStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMultipartStore {
    pub fn new() -> Self {
        Self::with_min_part_size(S3_MIN_PART_SIZE)
    }

    pub fn with_min_part_size(min_part_size: u64) -> Self {
        tracing::debug!(min_part_size, "Creating in-memory multipart store");
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            min_part_size,
        }
    }

    // ========================================================================
    // Fault Injection
    // ========================================================================

    /// The next `n` part uploads fail with a transient error
    pub fn fail_next_uploads(&self, n: u32) {
        self.state.lock().faults.transient_uploads = n;
    }

    /// Uploads of `part_number` fail terminally `times` times
    pub fn fail_part(&self, part_number: i32, times: u32) {
        self.state.lock().faults.failing_parts.insert(part_number, times);
    }

    /// Receipts for `part_number` report a checksum that does not match the body
    pub fn corrupt_checksum(&self, part_number: i32) {
        self.state.lock().faults.corrupt_checksums.push(part_number);
    }

    /// The next `n` completions fail with a transient error
    pub fn fail_next_completes(&self, n: u32) {
        self.state.lock().faults.transient_completes = n;
    }

    /// Uploads of `part_number` hang until the caller gives up
    pub fn stall_part(&self, part_number: i32) {
        self.state.lock().faults.stalled_parts.push(part_number);
    }

    /// The next `n` completions succeed but commit a truncated object
    pub fn truncate_next_commits(&self, n: u32) {
        self.state.lock().faults.truncated_commits = n;
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        self.state.lock().faults = Faults::default();
    }

    /// Drop a pending session, as a lifecycle rule expiring it would
    pub fn expire_upload(&self, upload_id: &str) {
        self.state.lock().uploads.remove(upload_id);
    }

    /// Place a committed object directly
    pub fn insert_object(&self, key: &str, data: Vec<u8>, metadata: HashMap<String, String>) {
        self.state
            .lock()
            .objects
            .insert(key.to_string(), StoredObject { data, metadata });
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().objects.get(key).map(|o| o.data.clone())
    }

    /// Part numbers of every upload_part call, in call order
    pub fn upload_calls(&self) -> Vec<i32> {
        self.state.lock().upload_calls.clone()
    }

    pub fn clear_upload_calls(&self) {
        self.state.lock().upload_calls.clear();
    }

    pub fn pending_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    pub fn aborted_uploads(&self) -> Vec<String> {
        self.state.lock().aborted.clone()
    }

    pub fn completes(&self) -> u32 {
        self.state.lock().completes
    }
}

#[async_trait]
impl MultipartStore for MemoryMultipartStore {
    async fn create_multipart(&self, key: &str, metadata: &HashMap<String, String>) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        state.next_upload += 1;
        let upload_id = format!("mem-upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
        checksum_sha256: &str,
    ) -> Result<PartReceipt, StoreError> {
        let stalled = {
            let mut state = self.state.lock();
            state.upload_calls.push(part_number);
            state.faults.stalled_parts.contains(&part_number)
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();

        if state.faults.transient_uploads > 0 {
            state.faults.transient_uploads -= 1;
            return Err(StoreError::Transient(format!(
                "injected 503 for part {}",
                part_number
            )));
        }
        if let Some(remaining) = state.faults.failing_parts.get_mut(&part_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Backend(format!(
                    "injected failure for part {}",
                    part_number
                )));
            }
        }

        let computed = sha256_base64(&body);
        if computed != checksum_sha256 {
            return Err(StoreError::ChecksumRejected(format!(
                "part {} body does not match supplied checksum",
                part_number
            )));
        }
        let reported = if state.faults.corrupt_checksums.contains(&part_number) {
            sha256_base64(b"corrupted in transit")
        } else {
            computed.clone()
        };

        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;

        let etag = format!("\"{}\"", &sha256_hex(&body)[..32]);
        upload.parts.insert(
            part_number,
            StoredPart {
                data: body,
                etag: etag.clone(),
                checksum_sha256: reported.clone(),
            },
        );

        Ok(PartReceipt {
            etag,
            checksum_sha256: Some(reported),
        })
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> Result<Vec<RemotePart>, StoreError> {
        let state = self.state.lock();
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;

        Ok(upload
            .parts
            .iter()
            .map(|(number, part)| RemotePart {
                part_number: *number,
                etag: part.etag.clone(),
                size: part.data.len() as u64,
                checksum_sha256: Some(part.checksum_sha256.clone()),
            })
            .collect())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();

        if state.faults.transient_completes > 0 {
            state.faults.transient_completes -= 1;
            return Err(StoreError::Transient("injected 500 on complete".into()));
        }

        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;

        if parts.is_empty() {
            return Err(StoreError::Backend("MalformedXML: no parts".into()));
        }

        let mut object = Vec::new();
        let mut previous = 0;
        for (i, part) in parts.iter().enumerate() {
            if part.part_number <= previous {
                return Err(StoreError::Backend("InvalidPartOrder".into()));
            }
            previous = part.part_number;

            let stored = upload.parts.get(&part.part_number).ok_or_else(|| {
                StoreError::Backend(format!("InvalidPart: {} not uploaded", part.part_number))
            })?;
            if normalize_etag(&stored.etag) != normalize_etag(&part.etag) {
                return Err(StoreError::Backend(format!(
                    "InvalidPart: ETag mismatch for {}",
                    part.part_number
                )));
            }
            let is_last = i + 1 == parts.len();
            if !is_last && (stored.data.len() as u64) < self.min_part_size {
                return Err(StoreError::Backend(format!(
                    "EntityTooSmall: part {} is {} bytes",
                    part.part_number,
                    stored.data.len()
                )));
            }
            object.extend_from_slice(&stored.data);
        }

        if state.faults.truncated_commits > 0 {
            state.faults.truncated_commits -= 1;
            object.pop();
        }
        let metadata = state
            .uploads
            .remove(upload_id)
            .map(|u| u.metadata)
            .unwrap_or_default();
        state.objects.insert(key.to_string(), StoredObject { data: object, metadata });
        state.completes += 1;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let known = state.uploads.get(upload_id).is_some_and(|u| u.key == key);
        if !known {
            return Err(StoreError::NoSuchUpload(upload_id.to_string()));
        }
        state.uploads.remove(upload_id);
        state.aborted.push(upload_id.to_string());
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata, StoreError> {
        let state = self.state.lock();
        let object = state
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: object.data.len() as u64,
            last_modified: Some(Utc::now()),
            etag: Some(format!("\"{}\"", &sha256_hex(&object.data)[..32])),
            metadata: object.metadata.clone(),
        })
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.state.lock().objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(n: i32, etag: &str) -> CompletedPart {
        CompletedPart {
            part_number: n,
            etag: etag.to_string(),
            checksum_sha256: None,
        }
    }

    #[tokio::test]
    async fn test_multipart_assembles_in_order() {
        let store = MemoryMultipartStore::with_min_part_size(4);
        let id = store.create_multipart("obj", &HashMap::new()).await.unwrap();

        let b = store
            .upload_part("obj", &id, 2, b"World".to_vec(), &sha256_base64(b"World"))
            .await
            .unwrap();
        let a = store
            .upload_part("obj", &id, 1, b"Hello, ".to_vec(), &sha256_base64(b"Hello, "))
            .await
            .unwrap();

        let listed = store.list_parts("obj", &id).await.unwrap();
        assert_eq!(listed.iter().map(|p| p.part_number).collect::<Vec<_>>(), vec![1, 2]);

        store
            .complete_multipart("obj", &id, &[part(1, &a.etag), part(2, &b.etag)])
            .await
            .unwrap();
        assert_eq!(store.object("obj").unwrap(), b"Hello, World");
        assert_eq!(store.head_object("obj").await.unwrap().size, 12);
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_small_middle_part_rejected() {
        let store = MemoryMultipartStore::with_min_part_size(100);
        let id = store.create_multipart("obj", &HashMap::new()).await.unwrap();
        let a = store
            .upload_part("obj", &id, 1, vec![1; 10], &sha256_base64(&[1; 10]))
            .await
            .unwrap();
        let b = store
            .upload_part("obj", &id, 2, vec![2; 10], &sha256_base64(&[2; 10]))
            .await
            .unwrap();

        let result = store
            .complete_multipart("obj", &id, &[part(1, &a.etag), part(2, &b.etag)])
            .await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert!(store.object("obj").is_none());
    }

    #[tokio::test]
    async fn test_expired_upload() {
        let store = MemoryMultipartStore::new();
        let id = store.create_multipart("obj", &HashMap::new()).await.unwrap();
        store.expire_upload(&id);

        assert!(matches!(
            store.list_parts("obj", &id).await,
            Err(StoreError::NoSuchUpload(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_supplied_checksum_rejected() {
        let store = MemoryMultipartStore::new();
        let id = store.create_multipart("obj", &HashMap::new()).await.unwrap();

        let result = store
            .upload_part("obj", &id, 1, b"data".to_vec(), &sha256_base64(b"other"))
            .await;
        assert!(matches!(result, Err(StoreError::ChecksumRejected(_))));
    }

    #[tokio::test]
    async fn test_metadata_survives_commit() {
        let store = MemoryMultipartStore::with_min_part_size(1);
        let metadata = HashMap::from([("plaintext-sha256".to_string(), "ab".repeat(32))]);
        let id = store.create_multipart("obj", &metadata).await.unwrap();
        let a = store
            .upload_part("obj", &id, 1, b"data".to_vec(), &sha256_base64(b"data"))
            .await
            .unwrap();
        store.complete_multipart("obj", &id, &[part(1, &a.etag)]).await.unwrap();

        assert_eq!(store.head_object("obj").await.unwrap().metadata, metadata);

        store.delete_object("obj").await.unwrap();
        assert!(matches!(
            store.head_object("obj").await,
            Err(StoreError::NotFound(_))
        ));
        store.delete_object("obj").await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_commit() {
        let store = MemoryMultipartStore::with_min_part_size(1);
        store.truncate_next_commits(1);
        let id = store.create_multipart("obj", &HashMap::new()).await.unwrap();
        let a = store
            .upload_part("obj", &id, 1, b"data".to_vec(), &sha256_base64(b"data"))
            .await
            .unwrap();
        store.complete_multipart("obj", &id, &[part(1, &a.etag)]).await.unwrap();

        assert_eq!(store.head_object("obj").await.unwrap().size, 3);
    }
}
