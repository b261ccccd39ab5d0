//! Encryption Engine
//!
//! Encrypts one submission file into a container on local disk. Progress is
//! committed after every segment: the segment is written and fsync'd, then
//! the sidecar is atomically rewritten. A crash can therefore redo the last
//! segment but never skip one, and a restart resumes at the first segment
//! the sidecar does not cover.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};

use super::container::{
    encrypted_len, segment_count, segment_plaintext_len, ContainerHeader, SegmentCipher,
    SessionKey,
};
use super::keys::RecipientPublicKey;
use super::types::{EncryptedContainer, EncryptionError, HEADER_LEN, SEGMENT_SIZE, TAG_LEN};
use crate::cancel::CancelFlag;
use crate::progress::{
    hash_prefix, snapshot_hex, FileKey, ProgressRecord, ProgressStore, EMPTY_SHA256,
};

// ============================================================================
// Job Description
// ============================================================================

/// One file to encrypt
#[derive(Debug, Clone)]
pub struct EncryptJob {
    pub key: FileKey,
    pub source: PathBuf,
    pub declared_size: u64,
    /// Declared plaintext SHA-256, hex
    pub declared_sha256: String,
    pub output: PathBuf,
}

/// Mutable state of an encryption in progress
struct ActiveSession {
    record: ProgressRecord,
    cipher: SegmentCipher,
    source: File,
    output: File,
    plaintext_hasher: Sha256,
    encrypted_hasher: Sha256,
}

// ============================================================================
// Encryptor
// ============================================================================

/// Resumable file encryptor; cheap to clone into blocking tasks
#[derive(Clone)]
pub struct Encryptor {
    store: ProgressStore,
    recipient: RecipientPublicKey,
    cancel: CancelFlag,
}

impl Encryptor {
    pub fn new(store: ProgressStore, recipient: RecipientPublicKey, cancel: CancelFlag) -> Self {
        Self {
            store,
            recipient,
            cancel,
        }
    }

    pub fn recipient(&self) -> &RecipientPublicKey {
        &self.recipient
    }

    /// Encrypt a file, resuming from its sidecar when one exists
    ///
    /// Blocking; run it on a blocking thread.
    pub fn encrypt_file(&self, job: &EncryptJob) -> Result<EncryptedContainer, EncryptionError> {
        let source_len = fs::metadata(&job.source)?.len();
        if source_len != job.declared_size {
            return Err(EncryptionError::SizeMismatch {
                declared: job.declared_size,
                actual: source_len,
            });
        }

        let total_segments = segment_count(job.declared_size, SEGMENT_SIZE);
        let existing = self.store.load(&job.key)?.and_then(|s| s.progress);

        let mut session = match existing {
            Some(record) if record.completed => return self.verify_completed(job, &record),
            Some(record) => self.resume(job, record)?,
            None => self.start(job)?,
        };
        let resumed_from = session.record.segments_completed;

        let mut buf = vec![0u8; SEGMENT_SIZE];
        for index in resumed_from..total_segments {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    file = %job.key,
                    segments_completed = index,
                    "Encryption cancelled at segment boundary"
                );
                return Err(EncryptionError::Cancelled);
            }

            let len = segment_plaintext_len(job.declared_size, SEGMENT_SIZE, index);
            session.source.read_exact(&mut buf[..len]).map_err(|e| {
                if e.kind() == ErrorKind::UnexpectedEof {
                    EncryptionError::SizeMismatch {
                        declared: job.declared_size,
                        actual: session.record.plaintext_consumed,
                    }
                } else {
                    e.into()
                }
            })?;

            let is_final = index + 1 == total_segments;
            let sealed = session.cipher.seal(index, is_final, &buf[..len])?;
            session.output.write_all(&sealed)?;
            session.output.sync_data()?;

            session.plaintext_hasher.update(&buf[..len]);
            session.encrypted_hasher.update(&sealed);

            let record = &mut session.record;
            record.segments_completed = index + 1;
            record.plaintext_consumed += len as u64;
            record.encrypted_written += sealed.len() as u64;
            record.plaintext_prefix_sha256 = snapshot_hex(&session.plaintext_hasher);
            record.encrypted_prefix_sha256 = snapshot_hex(&session.encrypted_hasher);
            record.updated_at = Utc::now();
            self.store.save_progress(&job.key, record)?;
        }

        let mut trailing = [0u8; 1];
        if session.source.read(&mut trailing)? != 0 {
            return Err(EncryptionError::SizeMismatch {
                declared: job.declared_size,
                actual: fs::metadata(&job.source)?.len(),
            });
        }

        let plaintext_sha256 = hex::encode(session.plaintext_hasher.finalize());
        if plaintext_sha256 != job.declared_sha256.to_ascii_lowercase() {
            tracing::error!(
                file = %job.key,
                declared = %job.declared_sha256,
                computed = %plaintext_sha256,
                "Plaintext digest mismatch, discarding container"
            );
            self.discard(&job.key, &job.output)?;
            return Err(EncryptionError::DigestMismatch {
                declared: job.declared_sha256.clone(),
                actual: plaintext_sha256,
            });
        }

        let encrypted_sha256 = hex::encode(session.encrypted_hasher.finalize());
        let mut record = session.record;
        record.completed = true;
        record.encrypted_prefix_sha256 = encrypted_sha256.clone();
        record.updated_at = Utc::now();
        self.store.save_progress(&job.key, &record)?;

        tracing::info!(
            file = %job.key,
            plaintext_len = job.declared_size,
            encrypted_len = record.encrypted_written,
            segments = total_segments,
            resumed_from_segment = resumed_from,
            "Encrypted file"
        );

        Ok(EncryptedContainer {
            path: job.output.clone(),
            plaintext_len: job.declared_size,
            encrypted_len: record.encrypted_written,
            plaintext_sha256,
            encrypted_sha256,
            recipient: self.recipient.fingerprint(),
            segments: total_segments,
            resumed_from_segment: resumed_from,
        })
    }

    /// Forget all progress for a file and delete its partial output
    pub fn discard(&self, key: &FileKey, output: &Path) -> Result<(), EncryptionError> {
        self.store.remove(key)?;
        match fs::remove_file(output) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Session Setup
    // ========================================================================

    fn start(&self, job: &EncryptJob) -> Result<ActiveSession, EncryptionError> {
        let session_key = SessionKey::generate();
        let header = ContainerHeader::seal(&self.recipient, &session_key, job.declared_size)?;
        let header_bytes = header.to_bytes();

        if let Some(parent) = job.output.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&job.output)?;
        output.write_all(&header_bytes)?;
        output.sync_data()?;

        let mut encrypted_hasher = Sha256::new();
        encrypted_hasher.update(header_bytes);

        let record = ProgressRecord {
            file_id: job.key.file_id.clone(),
            plaintext_len: job.declared_size,
            declared_sha256: job.declared_sha256.to_ascii_lowercase(),
            recipient_fingerprint: self.recipient.fingerprint(),
            segments_completed: 0,
            plaintext_consumed: 0,
            plaintext_prefix_sha256: EMPTY_SHA256.to_string(),
            encrypted_written: HEADER_LEN as u64,
            encrypted_prefix_sha256: snapshot_hex(&encrypted_hasher),
            sealed_session_key: self.store.seal(&job.key, session_key.as_bytes())?,
            completed: false,
            updated_at: Utc::now(),
        };
        self.store.save_progress(&job.key, &record)?;

        tracing::debug!(file = %job.key, output = %job.output.display(), "Started encryption");

        Ok(ActiveSession {
            record,
            cipher: SegmentCipher::new(&session_key, header.nonce_seed),
            source: File::open(&job.source)?,
            output,
            plaintext_hasher: Sha256::new(),
            encrypted_hasher,
        })
    }

    fn resume(
        &self,
        job: &EncryptJob,
        record: ProgressRecord,
    ) -> Result<ActiveSession, EncryptionError> {
        self.check_record_identity(job, &record)?;

        let total_segments = segment_count(job.declared_size, SEGMENT_SIZE);
        if record.segments_completed > total_segments {
            return Err(EncryptionError::ProgressMismatch(format!(
                "{} segments recorded, file has {}",
                record.segments_completed, total_segments
            )));
        }
        let consumed = (record.segments_completed * SEGMENT_SIZE as u64).min(job.declared_size);
        let written = HEADER_LEN as u64 + consumed + TAG_LEN as u64 * record.segments_completed;
        if record.plaintext_consumed != consumed || record.encrypted_written != written {
            return Err(EncryptionError::ProgressMismatch(
                "recorded byte counts are inconsistent with segment count".into(),
            ));
        }

        let mut source = File::open(&job.source)?;
        let plaintext_hasher = hash_prefix(&mut source, consumed)?;
        if snapshot_hex(&plaintext_hasher) != record.plaintext_prefix_sha256 {
            return Err(EncryptionError::ProgressMismatch(
                "source prefix changed since the last run".into(),
            ));
        }

        let mut output = match OpenOptions::new().read(true).write(true).open(&job.output) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(EncryptionError::ProgressMismatch("partial output is missing".into()))
            }
            Err(e) => return Err(e.into()),
        };
        if output.metadata()?.len() < written {
            return Err(EncryptionError::ProgressMismatch(
                "partial output is shorter than recorded".into(),
            ));
        }

        let encrypted_hasher = hash_prefix(&mut output, written)?;
        if snapshot_hex(&encrypted_hasher) != record.encrypted_prefix_sha256 {
            return Err(EncryptionError::ProgressMismatch(
                "partial output does not match recorded digest".into(),
            ));
        }

        // Anything past the recorded prefix is an uncommitted segment
        output.set_len(written)?;
        output.sync_data()?;

        output.seek(SeekFrom::Start(0))?;
        let mut header_bytes = [0u8; HEADER_LEN];
        output.read_exact(&mut header_bytes)?;
        let header = ContainerHeader::from_bytes(&header_bytes)?;
        if header.plaintext_len != job.declared_size {
            return Err(EncryptionError::ProgressMismatch(
                "container header declares a different length".into(),
            ));
        }
        output.seek(SeekFrom::Start(written))?;

        let key_bytes = self.store.unseal(&job.key, &record.sealed_session_key)?;
        let session_key = SessionKey::from_slice(&key_bytes)?;

        tracing::info!(
            file = %job.key,
            segments_completed = record.segments_completed,
            segments_total = total_segments,
            "Resuming encryption"
        );

        Ok(ActiveSession {
            record,
            cipher: SegmentCipher::new(&session_key, header.nonce_seed),
            source,
            output,
            plaintext_hasher,
            encrypted_hasher,
        })
    }

    /// A completed record still has to match the container on disk
    fn verify_completed(
        &self,
        job: &EncryptJob,
        record: &ProgressRecord,
    ) -> Result<EncryptedContainer, EncryptionError> {
        self.check_record_identity(job, record)?;

        let expected_len = encrypted_len(job.declared_size);
        let mut output = match File::open(&job.output) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(EncryptionError::ProgressMismatch("container is missing".into()))
            }
            Err(e) => return Err(e.into()),
        };
        let actual_len = output.metadata()?.len();
        if actual_len != expected_len || record.encrypted_written != expected_len {
            return Err(EncryptionError::ProgressMismatch(format!(
                "container is {} bytes, expected {}",
                actual_len, expected_len
            )));
        }

        let digest = snapshot_hex(&hash_prefix(&mut output, expected_len)?);
        if digest != record.encrypted_prefix_sha256 {
            return Err(EncryptionError::ProgressMismatch(
                "container digest changed since encryption".into(),
            ));
        }

        let segments = segment_count(job.declared_size, SEGMENT_SIZE);
        tracing::info!(file = %job.key, "Container already encrypted");

        Ok(EncryptedContainer {
            path: job.output.clone(),
            plaintext_len: job.declared_size,
            encrypted_len: expected_len,
            plaintext_sha256: record.declared_sha256.clone(),
            encrypted_sha256: digest,
            recipient: self.recipient.fingerprint(),
            segments,
            resumed_from_segment: segments,
        })
    }

    fn check_record_identity(
        &self,
        job: &EncryptJob,
        record: &ProgressRecord,
    ) -> Result<(), EncryptionError> {
        if record.file_id != job.key.file_id {
            return Err(EncryptionError::ProgressMismatch("record is for another file".into()));
        }
        if record.plaintext_len != job.declared_size {
            return Err(EncryptionError::ProgressMismatch(format!(
                "record declares {} bytes, file declares {}",
                record.plaintext_len, job.declared_size
            )));
        }
        if record.declared_sha256 != job.declared_sha256.to_ascii_lowercase() {
            return Err(EncryptionError::ProgressMismatch(
                "declared checksum changed".into(),
            ));
        }
        if record.recipient_fingerprint != self.recipient.fingerprint() {
            return Err(EncryptionError::ProgressMismatch(
                "container was sealed to a different recipient".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Streaming (non-resumable)
// ============================================================================

/// Encrypt exactly `plaintext_len` bytes from a reader; returns the plaintext SHA-256
pub fn encrypt_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    plaintext_len: u64,
    recipient: &RecipientPublicKey,
) -> Result<String, EncryptionError> {
    let session_key = SessionKey::generate();
    let header = ContainerHeader::seal(recipient, &session_key, plaintext_len)?;
    writer.write_all(&header.to_bytes())?;

    let cipher = SegmentCipher::new(&session_key, header.nonce_seed);
    let total_segments = segment_count(plaintext_len, SEGMENT_SIZE);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; SEGMENT_SIZE];
    let mut consumed = 0u64;

    for index in 0..total_segments {
        let len = segment_plaintext_len(plaintext_len, SEGMENT_SIZE, index);
        reader.read_exact(&mut buf[..len]).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                EncryptionError::SizeMismatch {
                    declared: plaintext_len,
                    actual: consumed,
                }
            } else {
                e.into()
            }
        })?;
        hasher.update(&buf[..len]);
        writer.write_all(&cipher.seal(index, index + 1 == total_segments, &buf[..len])?)?;
        consumed += len as u64;
    }

    writer.flush()?;
    Ok(hex::encode(hasher.finalize()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::decrypt::decrypt_file;
    use crate::crypt::keys::RecipientSecretKey;
    use crate::progress::sha256_hex;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: ProgressStore,
        secret: RecipientSecretKey,
        source: PathBuf,
        output: PathBuf,
        data: Vec<u8>,
    }

    fn fixture(len: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::open(dir.path().join("state")).unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
        let source = dir.path().join("sample.fastq.gz");
        fs::write(&source, &data).unwrap();
        let output = dir.path().join("out").join("sample.fastq.gz.grzc");

        Fixture {
            _dir: dir,
            store,
            secret: RecipientSecretKey::generate(),
            source,
            output,
            data,
        }
    }

    fn job(f: &Fixture) -> EncryptJob {
        EncryptJob {
            key: FileKey::new("sub-1", "sample"),
            source: f.source.clone(),
            declared_size: f.data.len() as u64,
            declared_sha256: sha256_hex(&f.data),
            output: f.output.clone(),
        }
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let f = fixture(3 * SEGMENT_SIZE + 17);
        let encryptor = Encryptor::new(f.store.clone(), f.secret.public_key(), CancelFlag::new());

        let container = encryptor.encrypt_file(&job(&f)).unwrap();
        assert_eq!(container.segments, 4);
        assert_eq!(container.encrypted_len, encrypted_len(f.data.len() as u64));
        assert_eq!(fs::metadata(&f.output).unwrap().len(), container.encrypted_len);
        assert_eq!(container.plaintext_sha256, sha256_hex(&f.data));

        let plain = f.output.with_extension("plain");
        let summary = decrypt_file(&f.output, &plain, &f.secret).unwrap();
        assert_eq!(summary.plaintext_sha256, sha256_hex(&f.data));
        assert_eq!(fs::read(&plain).unwrap(), f.data);
    }

    #[test]
    fn test_empty_file() {
        let f = fixture(0);
        let encryptor = Encryptor::new(f.store.clone(), f.secret.public_key(), CancelFlag::new());

        let container = encryptor.encrypt_file(&job(&f)).unwrap();
        assert_eq!(container.segments, 1);
        assert_eq!(container.encrypted_len, (HEADER_LEN + TAG_LEN) as u64);

        let plain = f.output.with_extension("plain");
        decrypt_file(&f.output, &plain, &f.secret).unwrap();
        assert!(fs::read(&plain).unwrap().is_empty());
    }

    #[test]
    fn test_size_mismatch() {
        let f = fixture(1000);
        let encryptor = Encryptor::new(f.store.clone(), f.secret.public_key(), CancelFlag::new());
        let mut j = job(&f);
        j.declared_size = 999;

        assert!(matches!(
            encryptor.encrypt_file(&j),
            Err(EncryptionError::SizeMismatch { declared: 999, actual: 1000 })
        ));
    }

    #[test]
    fn test_digest_mismatch_discards_progress() {
        let f = fixture(1000);
        let encryptor = Encryptor::new(f.store.clone(), f.secret.public_key(), CancelFlag::new());
        let mut j = job(&f);
        j.declared_sha256 = "00".repeat(32);

        let err = encryptor.encrypt_file(&j).unwrap_err();
        assert!(matches!(err, EncryptionError::DigestMismatch { .. }));
        assert!(err.is_integrity_failure());
        assert!(f.store.load(&j.key).unwrap().is_none());
        assert!(!f.output.exists());
    }

    #[test]
    fn test_cancel_leaves_resumable_state() {
        let f = fixture(5 * SEGMENT_SIZE + 100);
        let j = job(&f);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let encryptor = Encryptor::new(f.store.clone(), f.secret.public_key(), cancel);
        assert!(matches!(encryptor.encrypt_file(&j), Err(EncryptionError::Cancelled)));

        let record = f.store.load(&j.key).unwrap().unwrap().progress.unwrap();
        assert_eq!(record.segments_completed, 0);
        assert!(!record.completed);

        let resumed = Encryptor::new(f.store.clone(), f.secret.public_key(), CancelFlag::new());
        let container = resumed.encrypt_file(&j).unwrap();
        assert_eq!(container.resumed_from_segment, 0);

        let plain = f.output.with_extension("plain");
        decrypt_file(&f.output, &plain, &f.secret).unwrap();
        assert_eq!(fs::read(&plain).unwrap(), f.data);
    }

    #[test]
    fn test_resume_mid_file_continues_stream() {
        let f = fixture(6 * SEGMENT_SIZE + 5);
        let j = job(&f);
        let encryptor = Encryptor::new(f.store.clone(), f.secret.public_key(), CancelFlag::new());

        let full = encryptor.encrypt_file(&j).unwrap();
        let full_bytes = fs::read(&f.output).unwrap();

        // Roll the sidecar back to "3 segments committed" with a torn 4th
        // segment on disk, as a crash between write and sidecar save leaves it.
        let mut record = f.store.load(&j.key).unwrap().unwrap().progress.unwrap();
        let committed = 3u64;
        let consumed = committed * SEGMENT_SIZE as u64;
        let written = HEADER_LEN as u64 + consumed + TAG_LEN as u64 * committed;
        record.completed = false;
        record.segments_completed = committed;
        record.plaintext_consumed = consumed;
        record.plaintext_prefix_sha256 = sha256_hex(&f.data[..consumed as usize]);
        record.encrypted_written = written;
        record.encrypted_prefix_sha256 = sha256_hex(&full_bytes[..written as usize]);
        f.store.save_progress(&j.key, &record).unwrap();

        let torn = OpenOptions::new().write(true).open(&f.output).unwrap();
        torn.set_len(written + 1000).unwrap();

        let resumed = encryptor.encrypt_file(&j).unwrap();
        assert_eq!(resumed.resumed_from_segment, 3);
        assert_eq!(resumed.encrypted_sha256, full.encrypted_sha256);
        assert_eq!(fs::read(&f.output).unwrap(), full_bytes);
    }

    #[test]
    fn test_changed_source_is_progress_mismatch() {
        let f = fixture(4 * SEGMENT_SIZE);
        let j = job(&f);
        let encryptor = Encryptor::new(f.store.clone(), f.secret.public_key(), CancelFlag::new());
        encryptor.encrypt_file(&j).unwrap();

        let mut record = f.store.load(&j.key).unwrap().unwrap().progress.unwrap();
        record.completed = false;
        record.segments_completed = 1;
        record.plaintext_consumed = SEGMENT_SIZE as u64;
        record.plaintext_prefix_sha256 = sha256_hex(b"something else");
        record.encrypted_written = (HEADER_LEN + SEGMENT_SIZE + TAG_LEN) as u64;
        f.store.save_progress(&j.key, &record).unwrap();

        let err = encryptor.encrypt_file(&j).unwrap_err();
        assert!(matches!(err, EncryptionError::ProgressMismatch(_)));
        assert!(err.requires_restart());

        encryptor.discard(&j.key, &f.output).unwrap();
        let container = encryptor.encrypt_file(&j).unwrap();
        assert_eq!(container.resumed_from_segment, 0);
    }

    #[test]
    fn test_completed_container_is_reused() {
        let f = fixture(2 * SEGMENT_SIZE);
        let j = job(&f);
        let encryptor = Encryptor::new(f.store.clone(), f.secret.public_key(), CancelFlag::new());

        let first = encryptor.encrypt_file(&j).unwrap();
        let second = encryptor.encrypt_file(&j).unwrap();
        assert_eq!(second.encrypted_sha256, first.encrypted_sha256);
        assert_eq!(second.resumed_from_segment, second.segments);
    }

    #[test]
    fn test_different_recipient_rejects_resume() {
        let f = fixture(SEGMENT_SIZE);
        let j = job(&f);
        Encryptor::new(f.store.clone(), f.secret.public_key(), CancelFlag::new())
            .encrypt_file(&j)
            .unwrap();

        let other = RecipientSecretKey::generate().public_key();
        let err = Encryptor::new(f.store.clone(), other, CancelFlag::new())
            .encrypt_file(&j)
            .unwrap_err();
        assert!(matches!(err, EncryptionError::ProgressMismatch(_)));
    }

    #[test]
    fn test_encrypt_stream_matches_declared_length() {
        let secret = RecipientSecretKey::generate();
        let data = vec![42u8; SEGMENT_SIZE + 1];
        let mut out = Vec::new();

        let digest =
            encrypt_stream(&mut data.as_slice(), &mut out, data.len() as u64, &secret.public_key())
                .unwrap();
        assert_eq!(digest, sha256_hex(&data));
        assert_eq!(out.len() as u64, encrypted_len(data.len() as u64));

        let mut short = Vec::new();
        assert!(matches!(
            encrypt_stream(&mut &data[..10], &mut short, 11, &secret.public_key()),
            Err(EncryptionError::SizeMismatch { declared: 11, actual: 0 })
        ));
    }
}
