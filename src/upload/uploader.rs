//! Chunked Uploader
//!
//! Uploads an encrypted container as one object through the multipart API:
//! - Parts are read from disk and sent with bounded concurrency
//! - Every request has a timeout and transient failures back off and retry
//! - Each acknowledged part is verified and persisted before the next is recorded
//! - A restarted run re-attaches to the persisted session and sends only missing parts

use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::backoff::Backoff;
use super::types::{ObjectIdentity, PartPlan, PartSpec, UploadError, UploadOptions, UploadOutcome};
use crate::cancel::CancelFlag;
use crate::crypt::EncryptedContainer;
use crate::progress::{sha256_base64, FileKey, ProgressStore, UploadSession, UploadedPart};
use crate::storage::{normalize_etag, CompletedPart, MultipartStore, RemotePart, StoreError};

// ============================================================================
// Chunked Uploader
// ============================================================================

/// Multipart uploader bound to one store and one progress directory
#[derive(Clone)]
pub struct ChunkedUploader {
    inner: Arc<UploaderInner>,
}

struct UploaderInner {
    store: Arc<dyn MultipartStore>,
    progress: ProgressStore,
    options: UploadOptions,
    cancel: CancelFlag,
}

impl ChunkedUploader {
    pub fn new(
        store: Arc<dyn MultipartStore>,
        progress: ProgressStore,
        options: UploadOptions,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            inner: Arc::new(UploaderInner {
                store,
                progress,
                options,
                cancel,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn MultipartStore> {
        &self.inner.store
    }

    pub fn options(&self) -> &UploadOptions {
        &self.inner.options
    }

    /// Upload a container, resuming a persisted session when possible
    ///
    /// On success the object is committed and verified and the file's sidecar
    /// is gone. On a retryable failure the session stays resumable. On a
    /// checksum mismatch the session is aborted and the sidecar discarded, so
    /// the next run re-encrypts from scratch.
    pub async fn upload(
        &self,
        key: &FileKey,
        object_key: &str,
        container: &EncryptedContainer,
    ) -> Result<UploadOutcome, UploadError> {
        let plan = PartPlan::new(container.encrypted_len, &self.inner.options)?;
        let (mut session, parts_reused) =
            self.attach_session(key, object_key, container, &plan).await?;
        let upload_id = session.upload_id.clone();

        let pending: Vec<PartSpec> = plan
            .parts()
            .filter(|spec| session.part(spec.part_number).is_none())
            .collect();

        tracing::info!(
            file = %key,
            object_key,
            upload_id = %upload_id,
            part_size = plan.part_size,
            parts_total = plan.part_count,
            parts_pending = pending.len(),
            "Uploading container"
        );

        let mut parts_uploaded = 0u32;
        let mut bytes_uploaded = 0u64;
        let mut failure = None;
        {
            let upload_id = upload_id.as_str();
            let path = container.path.as_path();
            let mut uploads = stream::iter(pending)
                .map(|spec| self.upload_part(object_key, upload_id, path, spec))
                .buffer_unordered(self.inner.options.concurrency.max(1));

            while let Some(result) = uploads.next().await {
                match result {
                    Ok(part) => {
                        parts_uploaded += 1;
                        bytes_uploaded += part.size;
                        session.record_part(part);
                        self.inner.progress.save_upload(key, &session)?;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if let Some(err) = failure {
            if err.is_integrity_failure() {
                tracing::error!(file = %key, upload_id = %upload_id, error = %err, "Abandoning multipart session");
                self.abandon(key, object_key, &upload_id).await?;
            } else {
                tracing::warn!(
                    file = %key,
                    upload_id = %upload_id,
                    parts_done = session.parts.len(),
                    error = %err,
                    "Upload interrupted, session kept for resume"
                );
            }
            return Err(err);
        }

        let completed = completed_parts(&session, &plan)?;
        let store = self.inner.store.as_ref();
        let finalize = self
            .with_retry("complete multipart upload", || {
                store.complete_multipart(object_key, &upload_id, &completed)
            })
            .await;

        match finalize {
            Ok(()) => {}
            Err(UploadError::Store(StoreError::NoSuchUpload(_))) => {
                // An earlier complete may have committed the object with its response lost
                if !self.object_matches(object_key, &ObjectIdentity::of(container)).await? {
                    self.inner.progress.clear_upload(key)?;
                    return Err(UploadError::FinalizeFailed(format!(
                        "session {} vanished before completion",
                        upload_id
                    )));
                }
            }
            Err(UploadError::Cancelled) => return Err(UploadError::Cancelled),
            Err(e) => return Err(UploadError::FinalizeFailed(e.to_string())),
        }

        let metadata = self
            .with_retry("head object", || store.head_object(object_key))
            .await?;
        if metadata.size != container.encrypted_len {
            tracing::error!(
                file = %key,
                object_key,
                expected = container.encrypted_len,
                actual = metadata.size,
                "Committed object has the wrong size, deleting it"
            );
            self.with_retry("delete object", || store.delete_object(object_key))
                .await?;
            self.inner.progress.remove(key)?;
            return Err(UploadError::VerificationFailed {
                expected: container.encrypted_len,
                actual: metadata.size,
            });
        }

        self.inner.progress.remove(key)?;

        tracing::info!(
            file = %key,
            object_key,
            parts = plan.part_count,
            parts_uploaded,
            parts_reused,
            "Upload committed and verified"
        );

        Ok(UploadOutcome {
            object_key: object_key.to_string(),
            upload_id,
            part_count: plan.part_count,
            parts_uploaded,
            parts_reused,
            bytes_uploaded,
        })
    }

    // ========================================================================
    // Session Management
    // ========================================================================

    /// Re-attach to the persisted session or create a new one
    async fn attach_session(
        &self,
        key: &FileKey,
        object_key: &str,
        container: &EncryptedContainer,
        plan: &PartPlan,
    ) -> Result<(UploadSession, u32), UploadError> {
        let store = self.inner.store.as_ref();
        let existing = self.inner.progress.load(key)?.and_then(|s| s.upload);

        if let Some(session) = existing {
            let compatible = session.object_key == object_key
                && session.container_sha256 == container.encrypted_sha256
                && session.container_len == container.encrypted_len
                && session.part_size == plan.part_size;

            if compatible {
                let listed = self
                    .with_retry("list parts", || store.list_parts(object_key, &session.upload_id))
                    .await;
                match listed {
                    Ok(remote) => {
                        let session = reconcile(session, &remote, plan);
                        let reused = session.parts.len() as u32;
                        self.inner.progress.save_upload(key, &session)?;
                        tracing::info!(
                            file = %key,
                            upload_id = %session.upload_id,
                            parts_reused = reused,
                            "Re-attached to multipart session"
                        );
                        return Ok((session, reused));
                    }
                    Err(UploadError::Store(StoreError::NoSuchUpload(_))) => {
                        tracing::warn!(
                            file = %key,
                            upload_id = %session.upload_id,
                            "Multipart session no longer exists, starting a new one"
                        );
                    }
                    Err(e) => return Err(e),
                }
            } else {
                tracing::warn!(
                    file = %key,
                    upload_id = %session.upload_id,
                    "Persisted session does not match the container, abandoning it"
                );
                self.abort_quietly(&session.object_key, &session.upload_id).await;
            }
            self.inner.progress.clear_upload(key)?;
        }

        let metadata = ObjectIdentity::of(container).metadata();
        let upload_id = self
            .with_retry("create multipart upload", || store.create_multipart(object_key, &metadata))
            .await?;
        let session = UploadSession {
            object_key: object_key.to_string(),
            upload_id,
            part_size: plan.part_size,
            container_len: container.encrypted_len,
            container_sha256: container.encrypted_sha256.clone(),
            parts: Vec::new(),
            created_at: Utc::now(),
        };
        self.inner.progress.save_upload(key, &session)?;

        tracing::info!(file = %key, upload_id = %session.upload_id, "Created multipart session");
        Ok((session, 0))
    }

    /// Abort the session and forget the file's progress entirely
    async fn abandon(&self, key: &FileKey, object_key: &str, upload_id: &str) -> Result<(), UploadError> {
        self.abort_quietly(object_key, upload_id).await;
        self.inner.progress.remove(key)?;
        Ok(())
    }

    async fn abort_quietly(&self, object_key: &str, upload_id: &str) {
        let store = self.inner.store.as_ref();
        let aborted = tokio::time::timeout(
            self.inner.options.request_timeout,
            store.abort_multipart(object_key, upload_id),
        )
        .await;

        match aborted {
            Ok(Ok(())) => tracing::debug!(upload_id, "Aborted multipart session"),
            Ok(Err(e)) => tracing::warn!(upload_id, error = %e, "Abort failed"),
            Err(_) => tracing::warn!(upload_id, "Abort timed out"),
        }
    }

    async fn object_matches(&self, object_key: &str, identity: &ObjectIdentity) -> Result<bool, UploadError> {
        let store = self.inner.store.as_ref();
        match self.with_retry("head object", || store.head_object(object_key)).await {
            Ok(metadata) => Ok(identity.matches(&metadata)),
            Err(UploadError::Store(StoreError::NotFound(_))) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Parts
    // ========================================================================

    async fn upload_part(
        &self,
        object_key: &str,
        upload_id: &str,
        path: &Path,
        spec: PartSpec,
    ) -> Result<UploadedPart, UploadError> {
        if self.inner.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let body = read_part(path, spec).await?;
        let checksum = sha256_base64(&body);
        let store = self.inner.store.as_ref();
        let operation = format!("upload part {}", spec.part_number);

        let receipt = match self
            .with_retry(&operation, || {
                store.upload_part(object_key, upload_id, spec.part_number, body.clone(), &checksum)
            })
            .await
        {
            Ok(receipt) => receipt,
            Err(UploadError::Store(StoreError::ChecksumRejected(message))) => {
                return Err(UploadError::ChecksumMismatch {
                    part_number: spec.part_number,
                    expected: checksum.clone(),
                    actual: message,
                })
            }
            Err(e) => return Err(e),
        };

        match receipt.checksum_sha256.as_deref() {
            Some(actual) if actual == checksum => {}
            Some(actual) => {
                return Err(UploadError::ChecksumMismatch {
                    part_number: spec.part_number,
                    expected: checksum.clone(),
                    actual: actual.to_string(),
                })
            }
            None if self.inner.options.require_checksum => {
                return Err(UploadError::ChecksumMismatch {
                    part_number: spec.part_number,
                    expected: checksum.clone(),
                    actual: "<none reported>".to_string(),
                })
            }
            None => {}
        }

        tracing::debug!(
            upload_id,
            part_number = spec.part_number,
            size = spec.len,
            "Part acknowledged"
        );

        Ok(UploadedPart {
            part_number: spec.part_number,
            size: spec.len,
            etag: receipt.etag,
            checksum_sha256: checksum,
        })
    }

    /// Run a storage call with timeout, backoff and bounded attempts
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let options = &self.inner.options;
        let mut backoff = Backoff::new(options.backoff_base, options.backoff_max, 2.0, 0.1);
        let mut attempt = 0u32;

        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            attempt += 1;

            let (last_error, timed_out) = match tokio::time::timeout(options.request_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_retryable() => (e.to_string(), false),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => (
                    format!("no response within {:?}", options.request_timeout),
                    true,
                ),
            };

            if attempt >= options.max_attempts {
                if timed_out {
                    return Err(UploadError::Timeout {
                        operation: operation.to_string(),
                    });
                }
                return Err(UploadError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error,
                });
            }

            let delay = backoff.next_delay();
            tracing::warn!(
                operation,
                attempt,
                max_attempts = options.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Retrying storage operation"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn read_part(path: &Path, spec: PartSpec) -> Result<Vec<u8>, UploadError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(spec.offset)).await?;
    let mut buf = vec![0u8; spec.len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Keep only local parts the store still holds unchanged
fn reconcile(mut session: UploadSession, remote: &[RemotePart], plan: &PartPlan) -> UploadSession {
    session.parts.retain(|local| {
        let expected_len = plan.part(local.part_number).map(|spec| spec.len);
        let held = remote.iter().any(|r| {
            r.part_number == local.part_number
                && normalize_etag(&r.etag) == normalize_etag(&local.etag)
                && r.size == local.size
                && r
                    .checksum_sha256
                    .as_deref()
                    .map_or(true, |c| c == local.checksum_sha256)
        });
        held && expected_len == Some(local.size)
    });
    session
}

/// Ordered, contiguous part list for completion
fn completed_parts(session: &UploadSession, plan: &PartPlan) -> Result<Vec<CompletedPart>, UploadError> {
    plan.parts()
        .map(|spec| {
            let part = session
                .part(spec.part_number)
                .filter(|p| p.size == spec.len)
                .ok_or_else(|| {
                    UploadError::FinalizeFailed(format!("part {} was never acknowledged", spec.part_number))
                })?;
            Ok(CompletedPart {
                part_number: part.part_number,
                etag: part.etag.clone(),
                checksum_sha256: Some(part.checksum_sha256.clone()),
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::{decrypt_stream, EncryptJob, Encryptor, RecipientSecretKey};
    use crate::progress::sha256_hex;
    use crate::storage::MemoryMultipartStore;
    use std::time::Duration;
    use tempfile::TempDir;

    const PART: u64 = 1024;

    struct Fixture {
        _dir: TempDir,
        progress: ProgressStore,
        store: MemoryMultipartStore,
        container: EncryptedContainer,
        data: Vec<u8>,
    }

    fn fixture(len: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let progress = ProgressStore::open(dir.path().join("state")).unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let path = dir.path().join("file.grzc");
        std::fs::write(&path, &data).unwrap();

        let container = EncryptedContainer {
            path,
            plaintext_len: 0,
            encrypted_len: len as u64,
            plaintext_sha256: String::new(),
            encrypted_sha256: sha256_hex(&data),
            recipient: String::new(),
            segments: 1,
            resumed_from_segment: 0,
        };

        Fixture {
            _dir: dir,
            progress,
            store: MemoryMultipartStore::with_min_part_size(PART),
            container,
            data,
        }
    }

    fn options() -> UploadOptions {
        UploadOptions {
            part_size: PART,
            min_part_size: PART,
            max_parts: 1000,
            concurrency: 1,
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            request_timeout: Duration::from_secs(5),
            require_checksum: true,
        }
    }

    fn uploader(f: &Fixture, options: UploadOptions) -> ChunkedUploader {
        ChunkedUploader::new(
            Arc::new(f.store.clone()),
            f.progress.clone(),
            options,
            CancelFlag::new(),
        )
    }

    fn key() -> FileKey {
        FileKey::new("sub-1", "file")
    }

    #[tokio::test]
    async fn test_fresh_upload_commits_object() {
        let f = fixture(2500);
        let outcome = uploader(&f, UploadOptions { concurrency: 3, ..options() })
            .upload(&key(), "sub-1/files/file.grzc", &f.container)
            .await
            .unwrap();

        assert_eq!(outcome.part_count, 3);
        assert_eq!(outcome.parts_uploaded, 3);
        assert_eq!(outcome.parts_reused, 0);
        assert_eq!(outcome.bytes_uploaded, 2500);
        assert_eq!(f.store.object("sub-1/files/file.grzc").unwrap(), f.data);
        assert!(f.progress.load(&key()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interrupted_upload_resumes_missing_parts_only() {
        let f = fixture(2500);
        f.store.fail_part(3, 1);

        let err = uploader(&f, options())
            .upload(&key(), "obj", &f.container)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Store(StoreError::Backend(_))));

        let session = f.progress.load(&key()).unwrap().unwrap().upload.unwrap();
        assert_eq!(session.parts.len(), 2);

        f.store.clear_upload_calls();
        let outcome = uploader(&f, options())
            .upload(&key(), "obj", &f.container)
            .await
            .unwrap();

        assert_eq!(f.store.upload_calls(), vec![3]);
        assert_eq!(outcome.parts_reused, 2);
        assert_eq!(outcome.upload_id, session.upload_id);
        assert_eq!(f.store.object("obj").unwrap(), f.data);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let f = fixture(2500);
        f.store.fail_next_uploads(2);

        uploader(&f, options())
            .upload(&key(), "obj", &f.container)
            .await
            .unwrap();

        assert_eq!(f.store.upload_calls().len(), 5);
        assert_eq!(f.store.object("obj").unwrap(), f.data);
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_session() {
        let f = fixture(2500);
        f.store.fail_next_uploads(100);

        let err = uploader(&f, UploadOptions { max_attempts: 2, ..options() })
            .upload(&key(), "obj", &f.container)
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::RetriesExhausted { attempts: 2, .. }));
        assert!(err.is_retryable());
        assert!(f.progress.load(&key()).unwrap().unwrap().upload.is_some());
        assert_eq!(f.store.pending_uploads(), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_aborts_session() {
        let f = fixture(2500);
        f.store.corrupt_checksum(2);

        let err = uploader(&f, options())
            .upload(&key(), "obj", &f.container)
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::ChecksumMismatch { part_number: 2, .. }));
        assert_eq!(f.store.aborted_uploads().len(), 1);
        assert_eq!(f.store.pending_uploads(), 0);
        assert!(f.store.object("obj").is_none());
        assert!(f.progress.load(&key()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_session_starts_over() {
        let f = fixture(2500);
        f.store.fail_part(2, 1);
        let _ = uploader(&f, options()).upload(&key(), "obj", &f.container).await;

        let old = f.progress.load(&key()).unwrap().unwrap().upload.unwrap();
        f.store.expire_upload(&old.upload_id);
        f.store.clear_upload_calls();

        let outcome = uploader(&f, options())
            .upload(&key(), "obj", &f.container)
            .await
            .unwrap();

        assert_ne!(outcome.upload_id, old.upload_id);
        assert_eq!(f.store.upload_calls(), vec![1, 2, 3]);
        assert_eq!(outcome.parts_reused, 0);
    }

    #[tokio::test]
    async fn test_stalled_part_times_out() {
        let f = fixture(2500);
        f.store.stall_part(1);

        let err = uploader(
            &f,
            UploadOptions {
                max_attempts: 2,
                request_timeout: Duration::from_millis(50),
                ..options()
            },
        )
        .upload(&key(), "obj", &f.container)
        .await
        .unwrap_err();

        assert!(matches!(err, UploadError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_finalize_failure_is_resumable() {
        let f = fixture(2500);
        f.store.fail_next_completes(2);

        let err = uploader(&f, UploadOptions { max_attempts: 2, ..options() })
            .upload(&key(), "obj", &f.container)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::FinalizeFailed(_)));
        assert!(f.store.object("obj").is_none());

        f.store.clear_upload_calls();
        let outcome = uploader(&f, options())
            .upload(&key(), "obj", &f.container)
            .await
            .unwrap();

        assert!(f.store.upload_calls().is_empty());
        assert_eq!(outcome.parts_reused, 3);
        assert_eq!(f.store.completes(), 1);
    }

    #[tokio::test]
    async fn test_wrong_size_commit_is_deleted() {
        let f = fixture(2500);
        f.store.truncate_next_commits(1);

        let err = uploader(&f, options())
            .upload(&key(), "obj", &f.container)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::VerificationFailed { expected: 2500, actual: 2499 }
        ));
        assert!(err.is_integrity_failure());
        assert!(f.store.object("obj").is_none());
        assert!(f.progress.load(&key()).unwrap().is_none());

        uploader(&f, options())
            .upload(&key(), "obj", &f.container)
            .await
            .unwrap();
        assert_eq!(f.store.object("obj").unwrap(), f.data);
    }

    #[tokio::test]
    async fn test_object_carries_container_identity() {
        let f = fixture(2500);
        let container = EncryptedContainer {
            plaintext_sha256: "ab".repeat(32),
            recipient: "cd".repeat(32),
            ..f.container.clone()
        };
        uploader(&f, options())
            .upload(&key(), "obj", &container)
            .await
            .unwrap();

        let head = f.store.head_object("obj").await.unwrap();
        assert!(ObjectIdentity::of(&container).matches(&head));
    }

    #[tokio::test]
    async fn test_session_for_other_container_is_abandoned() {
        let f = fixture(2500);
        f.store.fail_part(2, 1);
        let _ = uploader(&f, options()).upload(&key(), "obj", &f.container).await;

        let mut changed = f.container.clone();
        changed.encrypted_sha256 = "00".repeat(32);
        std::fs::write(&changed.path, &f.data).unwrap();

        uploader(&f, options())
            .upload(&key(), "obj", &changed)
            .await
            .unwrap();

        assert_eq!(f.store.aborted_uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_ten_mebibyte_file_resumes_after_second_part() {
        let dir = TempDir::new().unwrap();
        let progress = ProgressStore::open(dir.path().join("state")).unwrap();
        let secret = RecipientSecretKey::generate();

        let data: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
        let source = dir.path().join("sample.bam");
        std::fs::write(&source, &data).unwrap();

        let encryptor = Encryptor::new(progress.clone(), secret.public_key(), CancelFlag::new());
        let container = encryptor
            .encrypt_file(&EncryptJob {
                key: key(),
                source,
                declared_size: data.len() as u64,
                declared_sha256: sha256_hex(&data),
                output: dir.path().join("sample.bam.grzc"),
            })
            .unwrap();
        assert_eq!(container.segments, 160);
        assert_eq!(container.encrypted_len, 10_488_448);

        let store = MemoryMultipartStore::new();
        store.fail_part(3, 1);
        let options = UploadOptions {
            part_size: 5 * 1024 * 1024,
            min_part_size: 5 * 1024 * 1024,
            concurrency: 1,
            ..options()
        };
        let uploader = ChunkedUploader::new(
            Arc::new(store.clone()),
            progress.clone(),
            options,
            CancelFlag::new(),
        );

        assert!(uploader.upload(&key(), "obj", &container).await.is_err());
        assert_eq!(store.upload_calls(), vec![1, 2, 3]);

        store.clear_upload_calls();
        let outcome = uploader.upload(&key(), "obj", &container).await.unwrap();
        assert_eq!(store.upload_calls(), vec![3]);
        assert_eq!(outcome.part_count, 3);
        assert_eq!(store.completes(), 1);

        let object = store.object("obj").unwrap();
        let mut plain = Vec::new();
        let summary = decrypt_stream(&mut object.as_slice(), &mut plain, &secret).unwrap();
        assert_eq!(summary.plaintext_sha256, sha256_hex(&data));
    }
}
