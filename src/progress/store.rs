//! Progress Store
//!
//! One JSON sidecar per (submission, file) under a state directory. Every
//! write goes to a temp file that is fsync'd and renamed over the old one,
//! so a crash leaves either the previous or the new document, never a torn
//! one. Session keys are sealed with a key that never leaves the state dir.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use super::checksum::sha256_hex;
use super::types::{
    FileKey, ProgressError, ProgressRecord, Sidecar, UploadSession, SEALING_KEY_FILE,
    SIDECAR_VERSION,
};

const SEAL_NONCE_LEN: usize = 12;

// ============================================================================
// Progress Store
// ============================================================================

/// Sidecar store rooted at a state directory
#[derive(Clone)]
pub struct ProgressStore {
    inner: Arc<ProgressStoreInner>,
}

struct ProgressStoreInner {
    root: PathBuf,
    sealing_key: Zeroizing<[u8; 32]>,
}

impl ProgressStore {
    /// Open (or initialize) a store, creating the sealing key on first use
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ProgressError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let sealing_key = load_or_create_sealing_key(&root.join(SEALING_KEY_FILE))?;

        tracing::debug!(state_dir = %root.display(), "Opened progress store");

        Ok(Self {
            inner: Arc::new(ProgressStoreInner { root, sealing_key }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Location of the sidecar for a file
    pub fn sidecar_path(&self, key: &FileKey) -> PathBuf {
        let digest = sha256_hex(key.file_id.as_bytes());
        self.submission_dir(&key.submission_id)
            .join(format!("{}.json", &digest[..32]))
    }

    fn submission_dir(&self, submission_id: &str) -> PathBuf {
        self.inner.root.join(sanitize_component(submission_id))
    }

    // ========================================================================
    // Sidecar Lifecycle
    // ========================================================================

    /// Load the sidecar for a file, if one exists
    pub fn load(&self, key: &FileKey) -> Result<Option<Sidecar>, ProgressError> {
        let path = self.sidecar_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let sidecar: Sidecar = serde_json::from_slice(&bytes)?;
        if sidecar.version != SIDECAR_VERSION {
            return Err(ProgressError::UnsupportedVersion(sidecar.version));
        }
        if &sidecar.key != key {
            return Err(ProgressError::KeyMismatch {
                expected: key.to_string(),
                found: sidecar.key.to_string(),
            });
        }

        Ok(Some(sidecar))
    }

    /// Atomically replace the sidecar document
    pub fn save(&self, sidecar: &Sidecar) -> Result<(), ProgressError> {
        let path = self.sidecar_path(&sidecar.key);
        let dir = self.submission_dir(&sidecar.key.submission_id);
        fs::create_dir_all(&dir)?;

        let json = serde_json::to_vec_pretty(sidecar)?;
        let temp_path = path.with_extension("json.tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;
        sync_dir(&dir)?;

        Ok(())
    }

    /// Replace the progress half of a sidecar, keeping any upload session
    pub fn save_progress(
        &self,
        key: &FileKey,
        record: &ProgressRecord,
    ) -> Result<(), ProgressError> {
        let mut sidecar = self.load(key)?.unwrap_or_else(|| Sidecar::new(key.clone()));
        sidecar.progress = Some(record.clone());
        self.save(&sidecar)
    }

    /// Replace the upload half of a sidecar, keeping the progress record
    pub fn save_upload(
        &self,
        key: &FileKey,
        session: &UploadSession,
    ) -> Result<(), ProgressError> {
        let mut sidecar = self.load(key)?.unwrap_or_else(|| Sidecar::new(key.clone()));
        sidecar.upload = Some(session.clone());
        self.save(&sidecar)
    }

    /// Drop a stale upload session while keeping encryption progress
    pub fn clear_upload(&self, key: &FileKey) -> Result<(), ProgressError> {
        if let Some(mut sidecar) = self.load(key)? {
            if sidecar.upload.take().is_some() {
                self.save(&sidecar)?;
            }
        }
        Ok(())
    }

    /// Delete progress and upload session together
    pub fn remove(&self, key: &FileKey) -> Result<bool, ProgressError> {
        let path = self.sidecar_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(dir) = path.parent() {
                    sync_dir(dir)?;
                }
                tracing::debug!(file = %key, "Removed sidecar");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All sidecars left for a submission
    pub fn list(&self, submission_id: &str) -> Result<Vec<Sidecar>, ProgressError> {
        let dir = self.submission_dir(submission_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sidecars = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            match serde_json::from_slice::<Sidecar>(&bytes) {
                Ok(sidecar) if sidecar.key.submission_id == submission_id => {
                    sidecars.push(sidecar)
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable sidecar");
                }
            }
        }

        sidecars.sort_by(|a, b| a.key.file_id.cmp(&b.key.file_id));
        Ok(sidecars)
    }

    // ========================================================================
    // Session Key Sealing
    // ========================================================================

    /// Seal secret bytes for this file; the result is safe to persist
    pub fn seal(&self, key: &FileKey, secret: &[u8]) -> Result<String, ProgressError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.inner.sealing_key[..]));
        let mut nonce = [0u8; SEAL_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let aad = key.associated_data();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: secret,
                    aad: &aad,
                },
            )
            .map_err(|_| ProgressError::Unseal)?;

        let mut sealed = Vec::with_capacity(SEAL_NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    /// Open a value produced by [`ProgressStore::seal`] for the same file
    pub fn unseal(&self, key: &FileKey, sealed: &str) -> Result<Zeroizing<Vec<u8>>, ProgressError> {
        let sealed = STANDARD.decode(sealed).map_err(|_| ProgressError::Unseal)?;
        if sealed.len() < SEAL_NONCE_LEN {
            return Err(ProgressError::Unseal);
        }
        let (nonce, ciphertext) = sealed.split_at(SEAL_NONCE_LEN);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.inner.sealing_key[..]));
        let aad = key.associated_data();
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| ProgressError::Unseal)?;

        Ok(Zeroizing::new(plaintext))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn load_or_create_sealing_key(path: &Path) -> Result<Zeroizing<[u8; 32]>, ProgressError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    match options.open(path) {
        Ok(mut file) => {
            let mut key = Zeroizing::new([0u8; 32]);
            OsRng.fill_bytes(&mut key[..]);
            file.write_all(key.as_ref())?;
            file.sync_all()?;
            tracing::info!(path = %path.display(), "Created sidecar sealing key");
            Ok(key)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let mut bytes = Zeroizing::new(Vec::new());
            File::open(path)?.read_to_end(&mut bytes)?;
            if bytes.len() != 32 {
                return Err(ProgressError::InvalidSealingKey(format!(
                    "expected 32 bytes, found {}",
                    bytes.len()
                )));
            }
            let mut key = Zeroizing::new([0u8; 32]);
            key.copy_from_slice(&bytes);
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

/// Make a directory entry change (create/rename/unlink) durable
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Map a submission id onto a single safe path component
fn sanitize_component(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", &sha256_hex(id.as_bytes())[..16]),
        _ => cleaned,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::types::{UploadedPart, EMPTY_SHA256};
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(file_id: &str) -> ProgressRecord {
        ProgressRecord {
            file_id: file_id.to_string(),
            plaintext_len: 100,
            declared_sha256: "ab".repeat(32),
            recipient_fingerprint: "cd".repeat(32),
            segments_completed: 0,
            plaintext_consumed: 0,
            plaintext_prefix_sha256: EMPTY_SHA256.to_string(),
            encrypted_written: 128,
            encrypted_prefix_sha256: EMPTY_SHA256.to_string(),
            sealed_session_key: String::new(),
            completed: false,
            updated_at: Utc::now(),
        }
    }

    fn session() -> UploadSession {
        UploadSession {
            object_key: "sub/files/a.grzc".to_string(),
            upload_id: "upload-1".to_string(),
            part_size: 5 * 1024 * 1024,
            container_len: 1000,
            container_sha256: "ef".repeat(32),
            parts: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_and_load_keeps_both_halves() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProgressStore::open(temp_dir.path()).unwrap();
        let key = FileKey::new("sub-1", "reads/sample_R1.fastq.gz");

        assert!(store.load(&key).unwrap().is_none());

        store.save_progress(&key, &record("reads/sample_R1.fastq.gz")).unwrap();
        store.save_upload(&key, &session()).unwrap();

        let sidecar = store.load(&key).unwrap().unwrap();
        assert_eq!(sidecar.progress.unwrap().plaintext_len, 100);
        assert_eq!(sidecar.upload.unwrap().upload_id, "upload-1");

        store.clear_upload(&key).unwrap();
        let sidecar = store.load(&key).unwrap().unwrap();
        assert!(sidecar.progress.is_some());
        assert!(sidecar.upload.is_none());
    }

    #[test]
    fn test_remove_deletes_everything() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProgressStore::open(temp_dir.path()).unwrap();
        let key = FileKey::new("sub-1", "a");

        store.save_progress(&key, &record("a")).unwrap();
        store.save_upload(&key, &session()).unwrap();

        assert!(store.remove(&key).unwrap());
        assert!(store.load(&key).unwrap().is_none());
        assert!(!store.remove(&key).unwrap());
    }

    #[test]
    fn test_record_part_replaces_same_number() {
        let mut s = session();
        s.record_part(UploadedPart {
            part_number: 1,
            size: 10,
            etag: "a".into(),
            checksum_sha256: "x".into(),
        });
        s.record_part(UploadedPart {
            part_number: 1,
            size: 10,
            etag: "b".into(),
            checksum_sha256: "y".into(),
        });
        assert_eq!(s.parts.len(), 1);
        assert_eq!(s.part(1).unwrap().etag, "b");
    }

    #[test]
    fn test_seal_round_trip_bound_to_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProgressStore::open(temp_dir.path()).unwrap();
        let key = FileKey::new("sub-1", "a");
        let other = FileKey::new("sub-1", "b");

        let sealed = store.seal(&key, &[7u8; 32]).unwrap();
        assert_eq!(store.unseal(&key, &sealed).unwrap().as_slice(), &[7u8; 32]);
        assert!(matches!(store.unseal(&other, &sealed), Err(ProgressError::Unseal)));
    }

    #[test]
    fn test_sealing_key_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let key = FileKey::new("sub-1", "a");

        let sealed = {
            let store = ProgressStore::open(temp_dir.path()).unwrap();
            store.seal(&key, b"secret").unwrap()
        };

        let reopened = ProgressStore::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.unseal(&key, &sealed).unwrap().as_slice(), b"secret");
    }

    #[test]
    fn test_list_by_submission() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProgressStore::open(temp_dir.path()).unwrap();

        store.save_progress(&FileKey::new("sub-1", "b"), &record("b")).unwrap();
        store.save_progress(&FileKey::new("sub-1", "a"), &record("a")).unwrap();
        store.save_progress(&FileKey::new("sub-2", "c"), &record("c")).unwrap();

        let listed = store.list("sub-1").unwrap();
        let ids: Vec<_> = listed.iter().map(|s| s.key.file_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(store.list("missing").unwrap().is_empty());
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("123456789_2024-07-15_a1b2c3d4"), "123456789_2024-07-15_a1b2c3d4");
        assert_eq!(sanitize_component("a/b\\c"), "a_b_c");
        assert!(sanitize_component("..").starts_with('_'));
        assert_ne!(sanitize_component(".."), "..");
    }
}
