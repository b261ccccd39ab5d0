//! Recipient-side decryption

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use super::container::{segment_plaintext_len, ContainerHeader, SegmentCipher};
use super::keys::RecipientSecretKey;
use super::types::{DecryptedSummary, EncryptionError, HEADER_LEN, TAG_LEN};

/// Refuse headers that would make us allocate absurd segment buffers
const MAX_SEGMENT_SIZE: u32 = 16 * 1024 * 1024;

/// Decrypt a container stream, verifying every segment tag
///
/// Truncated containers, appended data and reordered segments all fail.
pub fn decrypt_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    secret: &RecipientSecretKey,
) -> Result<DecryptedSummary, EncryptionError> {
    let mut header_bytes = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header_bytes)
        .map_err(|e| eof_as_malformed(e, "container is shorter than its header"))?;

    let header = ContainerHeader::from_bytes(&header_bytes)?;
    if header.segment_size > MAX_SEGMENT_SIZE {
        return Err(EncryptionError::Malformed(format!(
            "segment size {} exceeds {}",
            header.segment_size, MAX_SEGMENT_SIZE
        )));
    }

    let session_key = header.open(secret)?;
    let cipher = SegmentCipher::new(&session_key, header.nonce_seed);
    let segment_size = header.segment_size as usize;
    let total_segments = header.segment_count();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; segment_size + TAG_LEN];

    for index in 0..total_segments {
        let len = segment_plaintext_len(header.plaintext_len, segment_size, index) + TAG_LEN;
        reader
            .read_exact(&mut buf[..len])
            .map_err(|e| eof_as_malformed(e, "container is truncated"))?;

        let plaintext = cipher.open(index, index + 1 == total_segments, &buf[..len])?;
        hasher.update(&plaintext);
        writer.write_all(&plaintext)?;
    }

    let mut trailing = [0u8; 1];
    if reader.read(&mut trailing)? != 0 {
        return Err(EncryptionError::Malformed(
            "data after the final segment".into(),
        ));
    }
    writer.flush()?;

    Ok(DecryptedSummary {
        plaintext_len: header.plaintext_len,
        plaintext_sha256: hex::encode(hasher.finalize()),
        segments: total_segments,
    })
}

/// Decrypt a container file into `destination`
pub fn decrypt_file(
    source: &Path,
    destination: &Path,
    secret: &RecipientSecretKey,
) -> Result<DecryptedSummary, EncryptionError> {
    let mut reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(File::create(destination)?);
    let summary = decrypt_stream(&mut reader, &mut writer, secret)?;

    writer
        .into_inner()
        .map_err(|e| EncryptionError::Io(e.into_error()))?
        .sync_all()?;

    tracing::debug!(
        source = %source.display(),
        plaintext_len = summary.plaintext_len,
        "Decrypted container"
    );
    Ok(summary)
}

fn eof_as_malformed(e: std::io::Error, what: &str) -> EncryptionError {
    if e.kind() == ErrorKind::UnexpectedEof {
        EncryptionError::Malformed(what.to_string())
    } else {
        e.into()
    }
}
