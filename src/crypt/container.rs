//! Container format v1
//!
//! ```text
//! offset  size  field
//! 0       8     magic "GRZCRYPT"
//! 8       4     format version (u32 LE)
//! 12      4     segment size (u32 LE)
//! 16      8     plaintext length (u64 LE)
//! 24      32    ephemeral X25519 public key
//! 56      12    wrap nonce
//! 68      48    wrapped session key (key || tag)
//! 116     12    segment nonce seed
//! 128     ...   segments: ciphertext || tag
//! ```
//!
//! The session key is wrapped with ChaCha20-Poly1305 under
//! HKDF-SHA256(salt = ephemeral_pk || recipient_pk, ikm = X25519 shared secret).
//! The first 24 header bytes are the wrap's associated data, so the declared
//! plaintext length cannot be altered without breaking the key unwrap.
//!
//! Segment `i` uses the nonce seed with bytes 4..12 XORed with `i` (u64 LE)
//! and a single byte of associated data marking the final segment, which
//! makes truncation and extension detectable.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use super::keys::{RecipientPublicKey, RecipientSecretKey};
use super::types::{
    EncryptionError, FORMAT_VERSION, HEADER_LEN, KEY_LEN, MAGIC, NONCE_LEN, SEGMENT_SIZE,
    TAG_LEN, WRAPPED_KEY_LEN, WRAP_INFO,
};

/// Bytes of the header covered by the key wrap's associated data
const WRAP_AAD_LEN: usize = 24;

// ============================================================================
// Geometry
// ============================================================================

/// Number of segments for a plaintext; an empty file still gets one final segment
pub fn segment_count(plaintext_len: u64, segment_size: usize) -> u64 {
    let seg = segment_size as u64;
    if plaintext_len == 0 {
        1
    } else {
        plaintext_len.div_ceil(seg)
    }
}

/// Total container length for a plaintext of the given size
pub fn encrypted_len(plaintext_len: u64) -> u64 {
    HEADER_LEN as u64 + plaintext_len + TAG_LEN as u64 * segment_count(plaintext_len, SEGMENT_SIZE)
}

/// Plaintext length of segment `index`
pub fn segment_plaintext_len(plaintext_len: u64, segment_size: usize, index: u64) -> usize {
    let start = index * segment_size as u64;
    plaintext_len.saturating_sub(start).min(segment_size as u64) as usize
}

/// Nonce for segment `index`
pub fn segment_nonce(seed: &[u8; NONCE_LEN], index: u64) -> [u8; NONCE_LEN] {
    let mut nonce = *seed;
    for (n, c) in nonce[4..].iter_mut().zip(index.to_le_bytes()) {
        *n ^= c;
    }
    nonce
}

// ============================================================================
// Session Key
// ============================================================================

/// Per-file symmetric key; zeroed on drop
pub struct SessionKey(Zeroizing<[u8; KEY_LEN]>);

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        Self(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, EncryptionError> {
        if bytes.len() != KEY_LEN {
            return Err(EncryptionError::Key(format!(
                "session key must be {} bytes, found {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

// ============================================================================
// Header
// ============================================================================

/// Parsed container header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub segment_size: u32,
    pub plaintext_len: u64,
    pub ephemeral_public: [u8; KEY_LEN],
    pub wrap_nonce: [u8; NONCE_LEN],
    pub wrapped_key: [u8; WRAPPED_KEY_LEN],
    pub nonce_seed: [u8; NONCE_LEN],
}

impl ContainerHeader {
    /// Wrap a session key to the recipient, producing a fresh header
    pub fn seal(
        recipient: &RecipientPublicKey,
        session_key: &SessionKey,
        plaintext_len: u64,
    ) -> Result<Self, EncryptionError> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient.to_x25519());
        if !shared.was_contributory() {
            return Err(EncryptionError::Key(
                "recipient public key is a low-order point".into(),
            ));
        }

        let mut header = Self {
            segment_size: SEGMENT_SIZE as u32,
            plaintext_len,
            ephemeral_public: *ephemeral_public.as_bytes(),
            wrap_nonce: [0u8; NONCE_LEN],
            wrapped_key: [0u8; WRAPPED_KEY_LEN],
            nonce_seed: [0u8; NONCE_LEN],
        };
        OsRng.fill_bytes(&mut header.wrap_nonce);
        OsRng.fill_bytes(&mut header.nonce_seed);

        let wrap_key = derive_wrap_key(
            shared.as_bytes(),
            &header.ephemeral_public,
            recipient.as_bytes(),
        )?;
        let aad = header.wrap_aad();
        let wrapped = ChaCha20Poly1305::new(Key::from_slice(&wrap_key[..]))
            .encrypt(
                Nonce::from_slice(&header.wrap_nonce),
                Payload {
                    msg: session_key.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|_| EncryptionError::Key("session key wrap failed".into()))?;
        header.wrapped_key.copy_from_slice(&wrapped);

        Ok(header)
    }

    /// Unwrap the session key with the recipient's secret key
    pub fn open(&self, secret: &RecipientSecretKey) -> Result<SessionKey, EncryptionError> {
        let ephemeral = PublicKey::from(self.ephemeral_public);
        let shared = secret.as_x25519().diffie_hellman(&ephemeral);
        if !shared.was_contributory() {
            return Err(EncryptionError::Malformed(
                "ephemeral key is a low-order point".into(),
            ));
        }

        let recipient = secret.public_key();
        let wrap_key = derive_wrap_key(shared.as_bytes(), &self.ephemeral_public, recipient.as_bytes())?;
        let aad = self.wrap_aad();
        let key = ChaCha20Poly1305::new(Key::from_slice(&wrap_key[..]))
            .decrypt(
                Nonce::from_slice(&self.wrap_nonce),
                Payload {
                    msg: &self.wrapped_key,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                EncryptionError::Key("session key does not unwrap with this secret key".into())
            })?;

        SessionKey::from_slice(&Zeroizing::new(key))
    }

    pub fn segment_count(&self) -> u64 {
        segment_count(self.plaintext_len, self.segment_size as usize)
    }

    pub fn encrypted_len(&self) -> u64 {
        HEADER_LEN as u64 + self.plaintext_len + TAG_LEN as u64 * self.segment_count()
    }

    fn wrap_aad(&self) -> [u8; WRAP_AAD_LEN] {
        let mut aad = [0u8; WRAP_AAD_LEN];
        aad.copy_from_slice(&self.to_bytes()[..WRAP_AAD_LEN]);
        aad
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(MAGIC);
        out[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        out[12..16].copy_from_slice(&self.segment_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.plaintext_len.to_le_bytes());
        out[24..56].copy_from_slice(&self.ephemeral_public);
        out[56..68].copy_from_slice(&self.wrap_nonce);
        out[68..116].copy_from_slice(&self.wrapped_key);
        out[116..128].copy_from_slice(&self.nonce_seed);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncryptionError> {
        if bytes.len() < HEADER_LEN {
            return Err(EncryptionError::Malformed(format!(
                "header is {} bytes, expected {}",
                bytes.len(),
                HEADER_LEN
            )));
        }
        if &bytes[0..8] != MAGIC {
            return Err(EncryptionError::Malformed("bad magic".into()));
        }

        let version = u32::from_le_bytes(array(&bytes[8..12]));
        if version != FORMAT_VERSION {
            return Err(EncryptionError::UnsupportedVersion(version));
        }

        let segment_size = u32::from_le_bytes(array(&bytes[12..16]));
        if segment_size == 0 {
            return Err(EncryptionError::Malformed("zero segment size".into()));
        }

        Ok(Self {
            segment_size,
            plaintext_len: u64::from_le_bytes(array(&bytes[16..24])),
            ephemeral_public: array(&bytes[24..56]),
            wrap_nonce: array(&bytes[56..68]),
            wrapped_key: array(&bytes[68..116]),
            nonce_seed: array(&bytes[116..128]),
        })
    }
}

fn array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

fn derive_wrap_key(
    shared: &[u8; KEY_LEN],
    ephemeral_public: &[u8; KEY_LEN],
    recipient_public: &[u8; KEY_LEN],
) -> Result<Zeroizing<[u8; KEY_LEN]>, EncryptionError> {
    let mut salt = [0u8; 2 * KEY_LEN];
    salt[..KEY_LEN].copy_from_slice(ephemeral_public);
    salt[KEY_LEN..].copy_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), shared);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(WRAP_INFO, &mut okm[..])
        .map_err(|_| EncryptionError::Key("key derivation failed".into()))?;
    Ok(okm)
}

// ============================================================================
// Segment Cipher
// ============================================================================

/// Seals and opens individual segments of one container
pub struct SegmentCipher {
    cipher: ChaCha20Poly1305,
    nonce_seed: [u8; NONCE_LEN],
}

impl SegmentCipher {
    pub fn new(session_key: &SessionKey, nonce_seed: [u8; NONCE_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(session_key.as_bytes())),
            nonce_seed,
        }
    }

    pub fn seal(&self, index: u64, is_final: bool, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = segment_nonce(&self.nonce_seed, index);
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &[is_final as u8],
                },
            )
            .map_err(|_| EncryptionError::Authentication(index))
    }

    pub fn open(&self, index: u64, is_final: bool, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = segment_nonce(&self.nonce_seed, index);
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &[is_final as u8],
                },
            )
            .map_err(|_| EncryptionError::Authentication(index))
    }
}
