//! Encryption Engine
//!
//! Public-key envelope encryption of submission files:
//! - X25519 key agreement wraps a random per-file session key
//! - ChaCha20-Poly1305 seals fixed 64 KiB plaintext segments
//! - Progress is committed per segment so interrupted runs resume
//!
//! Containers are decrypted by the data-processing site with its X25519
//! secret key; see [`decrypt`].

pub mod container;
pub mod decrypt;
pub mod engine;
pub mod keys;
pub mod types;

pub use container::{encrypted_len, segment_count, ContainerHeader, SessionKey};
pub use decrypt::{decrypt_file, decrypt_stream};
pub use engine::{encrypt_stream, EncryptJob, Encryptor};
pub use keys::{RecipientPublicKey, RecipientSecretKey};
pub use types::*;
