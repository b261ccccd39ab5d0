//! Digest helpers shared by the engine and the uploader

use std::io::{self, Read};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// Buffer size for prefix re-hashing
const HASH_BUFFER: usize = 1024 * 1024;

/// Compute SHA-256 of data as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute SHA-256 of data as base64, the form S3 reports part checksums in
pub fn sha256_base64(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// Hex digest of a hasher's current state without consuming it
pub fn snapshot_hex(hasher: &Sha256) -> String {
    hex::encode(hasher.clone().finalize())
}

/// Feed exactly `len` bytes from `reader` into a fresh hasher
///
/// Fails with `UnexpectedEof` if the reader is shorter than `len`.
pub fn hash_prefix<R: Read>(reader: &mut R, len: u64) -> io::Result<Sha256> {
    let mut hasher = Sha256::new();
    let mut remaining = len;
    let mut buf = vec![0u8; HASH_BUFFER];

    while remaining > 0 {
        let want = remaining.min(HASH_BUFFER as u64) as usize;
        reader.read_exact(&mut buf[..want])?;
        hasher.update(&buf[..want]);
        remaining -= want as u64;
    }

    Ok(hasher)
}
