//! Per-file pipeline: encrypt, upload, verify

use std::io;
use std::path::PathBuf;

use tokio::sync::mpsc::UnboundedSender;

use super::types::{FileDescriptor, FileOutcome, FileStatus};
use crate::crypt::{encrypted_len, EncryptJob, EncryptedContainer, EncryptionError, Encryptor, CONTAINER_EXTENSION};
use crate::progress::{FileKey, ProgressError, ProgressStore};
use crate::storage::StoreError;
use crate::upload::{ChunkedUploader, ObjectIdentity, UploadError};

/// Object key of a file's container
pub fn object_key(submission_id: &str, file_id: &str) -> String {
    format!("{}/files/{}.{}", submission_id, file_id, CONTAINER_EXTENSION)
}

/// Everything one file task needs; cheap to clone into tasks
#[derive(Clone)]
pub(crate) struct FileWorker {
    pub encryptor: Encryptor,
    pub uploader: ChunkedUploader,
    pub progress: ProgressStore,
    pub output_dir: PathBuf,
}

impl FileWorker {
    /// Drive one file to a committed object
    ///
    /// Sends the file id on `encrypted` once its container is complete, so the
    /// ledger can advance while other files are still in flight.
    pub async fn process(
        &self,
        submission_id: &str,
        file: &FileDescriptor,
        encrypted: &UnboundedSender<String>,
    ) -> FileOutcome {
        let key = FileKey::new(submission_id, &file.file_id);
        let object_key = object_key(submission_id, &file.file_id);

        match self.already_uploaded(&key, &object_key, file).await {
            Ok(true) => {
                tracing::info!(submission_id, file_id = %file.file_id, "Object already committed, skipping");
                let _ = encrypted.send(file.file_id.clone());
                return FileOutcome {
                    encrypted_len: Some(encrypted_len(file.size)),
                    ..FileOutcome::new(&file.file_id, &object_key, FileStatus::AlreadyUploaded)
                };
            }
            Ok(false) => {}
            Err(e) => return FileOutcome::failed(&file.file_id, &object_key, false, e),
        }

        let job = EncryptJob {
            key: key.clone(),
            source: file.path.clone(),
            declared_size: file.size,
            declared_sha256: file.sha256.clone(),
            output: self
                .output_dir
                .join(submission_id)
                .join(format!("{}.{}", file.file_id, CONTAINER_EXTENSION)),
        };

        let mut announced = false;
        let mut restarted = false;
        loop {
            let container = match self.encrypt(&job).await {
                Ok(container) => container,
                Err(e) => {
                    tracing::error!(submission_id, file_id = %file.file_id, error = %e, "Encryption failed");
                    return FileOutcome::failed(&file.file_id, &object_key, encryption_is_fatal(&e), e);
                }
            };
            if !announced {
                let _ = encrypted.send(file.file_id.clone());
                announced = true;
            }

            match self.uploader.upload(&key, &object_key, &container).await {
                Ok(outcome) => {
                    if let Err(e) = tokio::fs::remove_file(&container.path).await {
                        tracing::warn!(path = %container.path.display(), error = %e, "Could not remove local container");
                    }
                    return FileOutcome {
                        encrypted_len: Some(container.encrypted_len),
                        resumed_from_segment: container.resumed_from_segment,
                        parts_uploaded: outcome.parts_uploaded,
                        parts_reused: outcome.parts_reused,
                        ..FileOutcome::new(&file.file_id, &object_key, FileStatus::Uploaded)
                    };
                }
                Err(e) if e.is_integrity_failure() && !restarted => {
                    tracing::warn!(
                        submission_id,
                        file_id = %file.file_id,
                        error = %e,
                        "Integrity failure, re-encrypting from zero"
                    );
                    if let Err(e) = self.encryptor.discard(&key, &job.output) {
                        return FileOutcome::failed(&file.file_id, &object_key, false, e);
                    }
                    restarted = true;
                }
                Err(e) => {
                    tracing::error!(submission_id, file_id = %file.file_id, error = %e, "Upload failed");
                    return FileOutcome {
                        encrypted_len: Some(container.encrypted_len),
                        ..FileOutcome::failed(&file.file_id, &object_key, upload_is_fatal(&e), e)
                    };
                }
            }
        }
    }

    /// Encrypt on a blocking thread, starting over once if the sidecar is stale
    async fn encrypt(&self, job: &EncryptJob) -> Result<EncryptedContainer, EncryptionError> {
        match self.encrypt_blocking(job.clone()).await {
            Err(e) if e.requires_restart() => {
                tracing::warn!(file = %job.key, error = %e, "Discarding stale progress");
                self.encryptor.discard(&job.key, &job.output)?;
                self.encrypt_blocking(job.clone()).await
            }
            other => other,
        }
    }

    async fn encrypt_blocking(&self, job: EncryptJob) -> Result<EncryptedContainer, EncryptionError> {
        let encryptor = self.encryptor.clone();
        tokio::task::spawn_blocking(move || encryptor.encrypt_file(&job))
            .await
            .map_err(|e| EncryptionError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?
    }

    /// Committed from this plaintext for this recipient, with nothing left in flight locally
    async fn already_uploaded(
        &self,
        key: &FileKey,
        object_key: &str,
        file: &FileDescriptor,
    ) -> Result<bool, ProgressError> {
        if self.progress.load(key)?.is_some() {
            return Ok(false);
        }

        let identity = ObjectIdentity {
            encrypted_len: encrypted_len(file.size),
            plaintext_sha256: file.sha256.clone(),
            recipient: self.encryptor.recipient().fingerprint(),
        };
        match self.uploader.store().head_object(object_key).await {
            Ok(metadata) if identity.matches(&metadata) => Ok(true),
            Ok(metadata) => {
                tracing::warn!(
                    object_key,
                    size = metadata.size,
                    "Committed object is not this file's container, replacing it"
                );
                Ok(false)
            }
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => {
                tracing::warn!(object_key, error = %e, "Head before upload failed, uploading anyway");
                Ok(false)
            }
        }
    }
}

fn encryption_is_fatal(e: &EncryptionError) -> bool {
    !matches!(
        e,
        EncryptionError::Cancelled | EncryptionError::Io(_) | EncryptionError::Progress(ProgressError::Io(_))
    )
}

fn upload_is_fatal(e: &UploadError) -> bool {
    !e.is_retryable() && !matches!(e, UploadError::Cancelled | UploadError::Io(_))
}
