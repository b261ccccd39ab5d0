//! Recipient key handling
//!
//! Public keys are accepted raw (32 bytes) or armored:
//!
//! ```text
//! -----BEGIN CRYPT4GH PUBLIC KEY-----
//! <base64 of 32 bytes>
//! -----END CRYPT4GH PUBLIC KEY-----
//! ```

use std::fmt;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::types::{EncryptionError, KEY_LEN};
use crate::progress::sha256_hex;

const PUBLIC_LABEL: &str = "CRYPT4GH PUBLIC KEY";
const PRIVATE_LABEL: &str = "GRZ PRIVATE KEY";

// ============================================================================
// Public Key
// ============================================================================

/// X25519 public key of the data-processing site
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecipientPublicKey([u8; KEY_LEN]);

impl RecipientPublicKey {
    /// Build from raw bytes, rejecting the all-zero point
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Result<Self, EncryptionError> {
        if bytes.iter().all(|&b| b == 0) {
            return Err(EncryptionError::Key("public key is the identity point".into()));
        }
        Ok(Self(bytes))
    }

    /// Parse raw or armored key material
    pub fn parse(data: &[u8]) -> Result<Self, EncryptionError> {
        if data.len() == KEY_LEN {
            let mut bytes = [0u8; KEY_LEN];
            bytes.copy_from_slice(data);
            return Self::from_bytes(bytes);
        }

        let text = std::str::from_utf8(data)
            .map_err(|_| EncryptionError::Key("public key is neither raw nor armored".into()))?;
        let decoded = decode_armor(text, PUBLIC_LABEL)?;
        let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            EncryptionError::Key(format!(
                "public key must be {} bytes, found {}",
                KEY_LEN,
                decoded.len()
            ))
        })?;
        Self::from_bytes(bytes)
    }

    /// Read a key file
    pub fn load(path: &Path) -> Result<Self, EncryptionError> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub(crate) fn to_x25519(self) -> PublicKey {
        PublicKey::from(self.0)
    }

    /// SHA-256 of the key bytes, used to bind progress records to a recipient
    pub fn fingerprint(&self) -> String {
        sha256_hex(&self.0)
    }

    pub fn to_armored(&self) -> String {
        encode_armor(&self.0, PUBLIC_LABEL)
    }
}

impl fmt::Debug for RecipientPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecipientPublicKey({})", &self.fingerprint()[..16])
    }
}

// ============================================================================
// Secret Key
// ============================================================================

/// X25519 secret key held by the recipient; needed only for decryption
pub struct RecipientSecretKey(StaticSecret);

impl RecipientSecretKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn parse(data: &[u8]) -> Result<Self, EncryptionError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| EncryptionError::Key("secret key must be armored text".into()))?;
        let decoded = Zeroizing::new(decode_armor(text, PRIVATE_LABEL)?);
        let bytes: [u8; KEY_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| EncryptionError::Key("secret key must be 32 bytes".into()))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn load(path: &Path) -> Result<Self, EncryptionError> {
        let data = Zeroizing::new(std::fs::read(path)?);
        Self::parse(&data)
    }

    pub fn public_key(&self) -> RecipientPublicKey {
        RecipientPublicKey(*PublicKey::from(&self.0).as_bytes())
    }

    pub fn to_armored(&self) -> Zeroizing<String> {
        Zeroizing::new(encode_armor(self.0.as_bytes(), PRIVATE_LABEL))
    }

    pub(crate) fn as_x25519(&self) -> &StaticSecret {
        &self.0
    }
}

// ============================================================================
// Armor
// ============================================================================

fn encode_armor(bytes: &[u8], label: &str) -> String {
    format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        STANDARD.encode(bytes)
    )
}

fn decode_armor(text: &str, label: &str) -> Result<Vec<u8>, EncryptionError> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");

    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    match (lines.first(), lines.last()) {
        (Some(first), Some(last)) if *first == begin && *last == end && lines.len() >= 3 => {
            let body: String = lines[1..lines.len() - 1].concat();
            STANDARD
                .decode(body.as_bytes())
                .map_err(|e| EncryptionError::Key(format!("invalid base64 in key: {}", e)))
        }
        _ => Err(EncryptionError::Key(format!("expected a {} block", label))),
    }
}
