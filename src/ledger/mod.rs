//! Submission State Ledger
//!
//! Append-only, per-submission chain of signed state records in SQLite:
//! - Each record names the content hash of the record before it
//! - Records are signed with the author's Ed25519 key
//! - Author keys live in a separate append-only registry
//! - `verify` re-walks the chain and names the first broken link

mod authors;
mod repository;
mod signing;
mod state;
mod types;

pub use authors::AuthorKeyRepository;
pub use repository::Ledger;
pub use signing::{
    content_hash, format_timestamp, signable_payload, Author, GENESIS_PRIOR_HASH, PAYLOAD_DOMAIN,
};
pub use state::SubmissionState;
pub use types::{AuthorKey, ChainStatus, LedgerError, OperatorConfirmation, StateRecord, Submission};
