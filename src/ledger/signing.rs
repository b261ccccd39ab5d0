//! Record signing and content hashing
//!
//! A state record is signed over a fixed-order JSON payload behind a domain
//! prefix. The content hash covers the payload and the signature, so it
//! changes if either is altered.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::state::SubmissionState;
use super::types::LedgerError;

/// Domain prefix of every signable payload
pub const PAYLOAD_DOMAIN: &[u8] = b"grz-ledger/state-record/v1\n";

/// Prior hash of a genesis record
pub const GENESIS_PRIOR_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

// ============================================================================
// Author
// ============================================================================

/// A named signer of ledger records
pub struct Author {
    name: String,
    signing_key: SigningKey,
}

impl Author {
    pub fn new(name: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            name: name.into(),
            signing_key,
        }
    }

    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(name, SigningKey::generate(&mut OsRng))
    }

    /// Build from a hex-encoded 32-byte seed
    pub fn from_seed_hex(name: impl Into<String>, seed_hex: &str) -> Result<Self, LedgerError> {
        let seed = Zeroizing::new(
            hex::decode(seed_hex.trim())
                .map_err(|e| LedgerError::InvalidKey(format!("seed is not hex: {}", e)))?,
        );
        let seed: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| LedgerError::InvalidKey(format!("seed must be 32 bytes, got {}", seed.len())))?;
        let author = Self::new(name, SigningKey::from_bytes(&seed));
        Ok(author)
    }

    /// Load a hex seed from a file
    pub fn load(name: impl Into<String>, path: &Path) -> Result<Self, LedgerError> {
        let contents = Zeroizing::new(
            std::fs::read_to_string(path)
                .map_err(|e| LedgerError::InvalidKey(format!("{}: {}", path.display(), e)))?,
        );
        Self::from_seed_hex(name, &contents)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    pub fn sign(&self, payload: &[u8]) -> Signature {
        self.signing_key.sign(payload)
    }
}

impl std::fmt::Debug for Author {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Author")
            .field("name", &self.name)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Fields covered by a record signature, in signing order
#[derive(Serialize)]
struct SignablePayload<'a> {
    submission_id: &'a str,
    sequence: i64,
    prior_hash: &'a str,
    state: SubmissionState,
    data: Option<&'a serde_json::Value>,
    timestamp: &'a str,
    author: &'a str,
}

pub fn signable_payload(
    submission_id: &str,
    sequence: i64,
    prior_hash: &str,
    state: SubmissionState,
    data: Option<&serde_json::Value>,
    timestamp: &str,
    author: &str,
) -> Result<Vec<u8>, LedgerError> {
    let body = serde_json::to_vec(&SignablePayload {
        submission_id,
        sequence,
        prior_hash,
        state,
        data,
        timestamp,
        author,
    })?;

    let mut payload = Vec::with_capacity(PAYLOAD_DOMAIN.len() + body.len());
    payload.extend_from_slice(PAYLOAD_DOMAIN);
    payload.extend_from_slice(&body);
    Ok(payload)
}

/// SHA-256 over payload and signature, lowercase hex
pub fn content_hash(payload: &[u8], signature: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(signature);
    hex::encode(hasher.finalize())
}

/// Record timestamps: UTC, microsecond precision, fixed width
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.trunc_subsecs(6).to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn parse_verifying_key(public_key_hex: &str) -> Result<VerifyingKey, LedgerError> {
    let bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|e| LedgerError::InvalidKey(e.to_string()))?
        .try_into()
        .map_err(|_| LedgerError::InvalidKey("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| LedgerError::InvalidKey(e.to_string()))
}

pub fn parse_signature(signature_hex: &str) -> Result<Signature, LedgerError> {
    let bytes: [u8; 64] = hex::decode(signature_hex)
        .map_err(|e| LedgerError::Corrupt(format!("signature is not hex: {}", e)))?
        .try_into()
        .map_err(|_| LedgerError::Corrupt("signature must be 64 bytes".to_string()))?;
    Ok(Signature::from_bytes(&bytes))
}

pub fn verify_signature(key: &VerifyingKey, payload: &[u8], signature: &Signature) -> bool {
    key.verify(payload, signature).is_ok()
}
