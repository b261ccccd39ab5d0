//! Submission ledger
//!
//! Every write runs in a `BEGIN IMMEDIATE` transaction on one connection:
//! read the head, check it is still the one the caller saw, check the
//! transition, insert the signed record, then move the head pointer with a
//! conditional update. A writer that lost the race sees the moved head and
//! fails with `ConcurrentModification`.

use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;
use serde_json::json;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

use super::authors::AuthorKeyRepository;
use super::signing::{
    content_hash, now_timestamp, parse_signature, parse_verifying_key, signable_payload,
    verify_signature, Author, GENESIS_PRIOR_HASH,
};
use super::state::SubmissionState;
use super::types::{
    AuthorKey, ChainStatus, LedgerError, OperatorConfirmation, StateRecord, StateRecordRow,
    Submission, SubmissionRow,
};
use crate::db::create_pool;

/// What a write proposes to append
enum Proposal {
    Transition {
        state: SubmissionState,
        data: Option<serde_json::Value>,
    },
    Recovery(OperatorConfirmation),
}

/// Append-only, signed submission state ledger
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (and initialize) the ledger database
    pub async fn open(database_url: &str) -> Result<Self, LedgerError> {
        let pool = create_pool(database_url).await?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn authors(&self) -> AuthorKeyRepository<'_> {
        AuthorKeyRepository::new(&self.pool)
    }

    // ========================================================================
    // Author Keys
    // ========================================================================

    pub async fn register_author_key(
        &self,
        author_name: &str,
        key: &VerifyingKey,
        comment: Option<&str>,
    ) -> Result<AuthorKey, LedgerError> {
        self.authors().register(author_name, key, comment).await
    }

    pub async fn revoke_author_key(&self, author_name: &str, key: &VerifyingKey) -> Result<AuthorKey, LedgerError> {
        self.authors().revoke(author_name, key).await
    }

    pub async fn author_keys(&self, author_name: &str) -> Result<Vec<AuthorKey>, LedgerError> {
        self.authors().list(author_name).await
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Create a submission with its genesis `received` record
    pub async fn register_submission(
        &self,
        submission_id: &str,
        author: &Author,
    ) -> Result<StateRecord, LedgerError> {
        self.ensure_active(author).await?;

        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let result = insert_genesis(tx.conn()?, submission_id, author).await;
        let record = tx.finish(result).await?;

        tracing::info!(submission_id, author = author.name(), "Registered submission");
        Ok(record)
    }

    /// Append a transition on top of `expected_head`
    ///
    /// `expected_head` is the head sequence the caller last observed. If
    /// another writer advanced the head since, nothing is written and the
    /// call fails with `ConcurrentModification`.
    pub async fn append(
        &self,
        submission_id: &str,
        expected_head: i64,
        state: SubmissionState,
        data: Option<serde_json::Value>,
        author: &Author,
    ) -> Result<StateRecord, LedgerError> {
        self.write(
            submission_id,
            Some(expected_head),
            Proposal::Transition { state, data },
            author,
        )
        .await
    }

    /// Move a submission out of `error` back to its last non-error state
    pub async fn recover(
        &self,
        submission_id: &str,
        confirmation: &OperatorConfirmation,
        author: &Author,
    ) -> Result<StateRecord, LedgerError> {
        if !confirmation.is_complete() {
            return Err(LedgerError::RecoveryNotConfirmed);
        }
        self.write(
            submission_id,
            None,
            Proposal::Recovery(confirmation.clone()),
            author,
        )
        .await
    }

    async fn write(
        &self,
        submission_id: &str,
        expected_head: Option<i64>,
        proposal: Proposal,
        author: &Author,
    ) -> Result<StateRecord, LedgerError> {
        self.ensure_active(author).await?;

        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let result = append_in(tx.conn()?, submission_id, expected_head, proposal, author).await;
        let record = tx.finish(result).await?;

        tracing::info!(
            submission_id,
            sequence = record.sequence,
            state = %record.state,
            author = author.name(),
            "Appended state record"
        );
        Ok(record)
    }

    async fn ensure_active(&self, author: &Author) -> Result<(), LedgerError> {
        if self.authors().is_active(author.name(), &author.verifying_key()).await? {
            Ok(())
        } else {
            tracing::warn!(author = author.name(), "Rejected write by unregistered author key");
            Err(LedgerError::UnregisteredAuthor(author.name().to_string()))
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn submission(&self, submission_id: &str) -> Result<Submission, LedgerError> {
        let row = sqlx::query_as::<_, SubmissionRow>(
            r#"
            SELECT id, head_sequence, head_hash, head_state, created_at, updated_at
            FROM submissions
            WHERE id = ?
            "#,
        )
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::SubmissionNotFound(submission_id.to_string()))?;

        row.try_into()
    }

    /// The record the head pointer names
    pub async fn head(&self, submission_id: &str) -> Result<StateRecord, LedgerError> {
        let submission = self.submission(submission_id).await?;
        let row = sqlx::query_as::<_, StateRecordRow>(
            r#"
            SELECT submission_id, sequence, prior_hash, state, data, timestamp,
                   author_name, signature, content_hash
            FROM submission_states
            WHERE submission_id = ? AND sequence = ?
            "#,
        )
        .bind(submission_id)
        .bind(submission.head_sequence)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            LedgerError::Corrupt(format!(
                "head of {} names missing record {}",
                submission_id, submission.head_sequence
            ))
        })?;

        row.try_into()
    }

    /// All records of a submission in sequence order
    pub async fn history(&self, submission_id: &str) -> Result<Vec<StateRecord>, LedgerError> {
        self.submission(submission_id).await?;
        self.history_rows(submission_id)
            .await?
            .into_iter()
            .map(StateRecord::try_from)
            .collect()
    }

    /// Submissions by most recent activity, optionally only those in one state
    pub async fn list_submissions(
        &self,
        limit: u32,
        state_filter: Option<SubmissionState>,
    ) -> Result<Vec<Submission>, LedgerError> {
        let rows = match state_filter {
            Some(state) => {
                sqlx::query_as::<_, SubmissionRow>(
                    r#"
                    SELECT id, head_sequence, head_hash, head_state, created_at, updated_at
                    FROM submissions
                    WHERE head_state = ?
                    ORDER BY updated_at DESC, id ASC
                    LIMIT ?
                    "#,
                )
                .bind(state.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SubmissionRow>(
                    r#"
                    SELECT id, head_sequence, head_hash, head_state, created_at, updated_at
                    FROM submissions
                    ORDER BY updated_at DESC, id ASC
                    LIMIT ?
                    "#,
                )
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(Submission::try_from).collect()
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Walk the chain from genesis and report the first broken link
    pub async fn verify(&self, submission_id: &str) -> Result<ChainStatus, LedgerError> {
        let submission = self.submission(submission_id).await?;
        let rows = self.history_rows(submission_id).await?;

        let mut keys: HashMap<String, Vec<(AuthorKey, Option<VerifyingKey>)>> = HashMap::new();
        let mut prior_hash = GENESIS_PRIOR_HASH.to_string();
        let mut previous: Option<SubmissionState> = None;
        let mut last_stable: Option<SubmissionState> = None;
        let mut last: Option<StateRecord> = None;

        for (index, row) in rows.into_iter().enumerate() {
            let expected_sequence = index as i64;
            let sequence = row.sequence;
            let broken = |reason: String| ChainStatus::Broken { sequence, reason };

            if sequence != expected_sequence {
                return Ok(ChainStatus::Broken {
                    sequence: expected_sequence,
                    reason: format!("expected sequence {}, found {}", expected_sequence, sequence),
                });
            }

            let record = match StateRecord::try_from(row) {
                Ok(record) => record,
                Err(e) => return Ok(broken(e.to_string())),
            };

            if record.prior_hash != prior_hash {
                return Ok(broken("prior hash does not match the preceding record".to_string()));
            }

            let allowed = match previous {
                None => record.state == SubmissionState::Received,
                Some(SubmissionState::Error) => {
                    record.state != SubmissionState::Error && Some(record.state) == last_stable
                }
                Some(prev) => prev.can_transition_to(record.state),
            };
            if !allowed {
                return Ok(broken(match previous {
                    Some(prev) => format!("transition {} -> {} is not allowed", prev, record.state),
                    None => format!("genesis record is {}", record.state),
                }));
            }

            let payload = signable_payload(
                &record.submission_id,
                record.sequence,
                &record.prior_hash,
                record.state,
                record.data.as_ref(),
                &record.timestamp,
                &record.author,
            )?;
            let signature = match parse_signature(&record.signature) {
                Ok(signature) => signature,
                Err(e) => return Ok(broken(e.to_string())),
            };

            if !keys.contains_key(&record.author) {
                let registered = self
                    .authors()
                    .list(&record.author)
                    .await?
                    .into_iter()
                    .map(|key| {
                        let verifying = parse_verifying_key(&key.public_key).ok();
                        (key, verifying)
                    })
                    .collect();
                keys.insert(record.author.clone(), registered);
            }
            let signed = keys.get(&record.author).is_some_and(|candidates| {
                candidates.iter().any(|(key, verifying)| {
                    key.active_at(&record.timestamp)
                        && verifying
                            .as_ref()
                            .is_some_and(|vk| verify_signature(vk, &payload, &signature))
                })
            });
            if !signed {
                return Ok(broken(format!(
                    "signature does not verify against an active key of {}",
                    record.author
                )));
            }

            if content_hash(&payload, &signature.to_bytes()) != record.content_hash {
                return Ok(broken("content hash does not match record".to_string()));
            }

            prior_hash = record.content_hash.clone();
            previous = Some(record.state);
            if record.state != SubmissionState::Error {
                last_stable = Some(record.state);
            }
            last = Some(record);
        }

        let Some(last) = last else {
            return Ok(ChainStatus::Broken {
                sequence: 0,
                reason: "submission has no records".to_string(),
            });
        };

        if submission.head_sequence != last.sequence
            || submission.head_hash != last.content_hash
            || submission.head_state != last.state
        {
            return Ok(ChainStatus::Broken {
                sequence: submission.head_sequence,
                reason: format!(
                    "head pointer names {} ({}) but the chain ends at {} ({})",
                    submission.head_sequence, submission.head_state, last.sequence, last.state
                ),
            });
        }

        Ok(ChainStatus::Intact {
            records: last.sequence as u64 + 1,
            head_hash: last.content_hash,
        })
    }

    async fn history_rows(&self, submission_id: &str) -> Result<Vec<StateRecordRow>, LedgerError> {
        let rows = sqlx::query_as::<_, StateRecordRow>(
            r#"
            SELECT submission_id, sequence, prior_hash, state, data, timestamp,
                   author_name, signature, content_hash
            FROM submission_states
            WHERE submission_id = ?
            ORDER BY sequence ASC
            "#,
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

// ============================================================================
// Transaction Helpers
// ============================================================================

/// A `BEGIN IMMEDIATE` transaction on a pooled connection
///
/// The connection goes back to the pool only after `COMMIT` or `ROLLBACK`
/// succeeded. Dropped any earlier (a cancelled future, a failed rollback),
/// the connection is detached and closed, and SQLite discards the open
/// transaction with it.
struct WriteTransaction {
    conn: Option<PoolConnection<Sqlite>>,
}

impl WriteTransaction {
    async fn begin(pool: &SqlitePool) -> Result<Self, LedgerError> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self { conn: Some(conn) })
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection, LedgerError> {
        self.conn.as_deref_mut().ok_or(LedgerError::TransactionClosed)
    }

    /// Commit on success, roll back otherwise
    async fn finish<T>(mut self, result: Result<T, LedgerError>) -> Result<T, LedgerError> {
        let outcome = match result {
            Ok(value) => match sqlx::query("COMMIT").execute(self.conn()?).await {
                Ok(_) => {
                    self.release();
                    return Ok(value);
                }
                Err(e) => LedgerError::from(e),
            },
            Err(e) => e,
        };

        match sqlx::query("ROLLBACK").execute(self.conn()?).await {
            Ok(_) => self.release(),
            Err(rollback) => tracing::error!(error = %rollback, "Rollback failed, closing connection"),
        }
        Err(outcome)
    }

    /// Hand the connection back to the pool once no transaction is open
    fn release(&mut self) {
        self.conn.take();
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!("Write transaction abandoned before commit, closing its connection");
            drop(conn.detach());
        }
    }
}

async fn fetch_head(conn: &mut SqliteConnection, submission_id: &str) -> Result<Option<Submission>, LedgerError> {
    let row = sqlx::query_as::<_, SubmissionRow>(
        r#"
        SELECT id, head_sequence, head_hash, head_state, created_at, updated_at
        FROM submissions
        WHERE id = ?
        "#,
    )
    .bind(submission_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(Submission::try_from).transpose()
}

async fn insert_genesis(
    conn: &mut SqliteConnection,
    submission_id: &str,
    author: &Author,
) -> Result<StateRecord, LedgerError> {
    if fetch_head(conn, submission_id).await?.is_some() {
        return Err(LedgerError::DuplicateSubmission(submission_id.to_string()));
    }

    let record = sign_record(
        submission_id,
        0,
        GENESIS_PRIOR_HASH,
        SubmissionState::Received,
        None,
        author,
    )?;

    sqlx::query(
        r#"
        INSERT INTO submissions (id, head_sequence, head_hash, head_state, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(submission_id)
    .bind(record.sequence)
    .bind(&record.content_hash)
    .bind(record.state.as_str())
    .bind(&record.timestamp)
    .bind(&record.timestamp)
    .execute(&mut *conn)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            LedgerError::DuplicateSubmission(submission_id.to_string())
        }
        other => other.into(),
    })?;

    insert_record(conn, &record).await?;
    Ok(record)
}

async fn append_in(
    conn: &mut SqliteConnection,
    submission_id: &str,
    expected_head: Option<i64>,
    proposal: Proposal,
    author: &Author,
) -> Result<StateRecord, LedgerError> {
    let head = fetch_head(conn, submission_id)
        .await?
        .ok_or_else(|| LedgerError::SubmissionNotFound(submission_id.to_string()))?;

    if let Some(expected) = expected_head {
        if head.head_sequence != expected {
            return Err(LedgerError::ConcurrentModification {
                submission_id: submission_id.to_string(),
                expected,
                found: head.head_sequence,
            });
        }
    }

    let (state, data) = match proposal {
        Proposal::Transition { state, data } => {
            if !head.head_state.can_transition_to(state) {
                return Err(LedgerError::InvalidTransition {
                    from: head.head_state,
                    to: state,
                });
            }
            (state, data)
        }
        Proposal::Recovery(confirmation) => {
            if head.head_state != SubmissionState::Error {
                return Err(LedgerError::NothingToRecover {
                    submission_id: submission_id.to_string(),
                    state: head.head_state,
                });
            }
            let restored = last_stable_state(conn, submission_id).await?;
            let data = json!({
                "recovered_from": SubmissionState::Error,
                "operator": confirmation.operator,
                "reason": confirmation.reason,
            });
            (restored, Some(data))
        }
    };

    let record = sign_record(
        submission_id,
        head.head_sequence + 1,
        &head.head_hash,
        state,
        data,
        author,
    )?;

    insert_record(conn, &record).await.map_err(|e| match e {
        LedgerError::Database(sqlx::Error::Database(ref db)) if db.is_unique_violation() => {
            LedgerError::ConcurrentModification {
                submission_id: submission_id.to_string(),
                expected: head.head_sequence,
                found: head.head_sequence + 1,
            }
        }
        other => other,
    })?;

    let moved = sqlx::query(
        r#"
        UPDATE submissions
        SET head_sequence = ?, head_hash = ?, head_state = ?, updated_at = ?
        WHERE id = ? AND head_sequence = ?
        "#,
    )
    .bind(record.sequence)
    .bind(&record.content_hash)
    .bind(record.state.as_str())
    .bind(&record.timestamp)
    .bind(submission_id)
    .bind(head.head_sequence)
    .execute(&mut *conn)
    .await?;

    if moved.rows_affected() != 1 {
        return Err(LedgerError::ConcurrentModification {
            submission_id: submission_id.to_string(),
            expected: head.head_sequence,
            found: head.head_sequence + 1,
        });
    }

    Ok(record)
}

async fn last_stable_state(conn: &mut SqliteConnection, submission_id: &str) -> Result<SubmissionState, LedgerError> {
    let state: Option<String> = sqlx::query_scalar(
        r#"
        SELECT state FROM submission_states
        WHERE submission_id = ? AND state != ?
        ORDER BY sequence DESC
        LIMIT 1
        "#,
    )
    .bind(submission_id)
    .bind(SubmissionState::Error.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    state
        .ok_or_else(|| LedgerError::Corrupt(format!("{} has no state before error", submission_id)))?
        .parse()
        .map_err(LedgerError::Corrupt)
}

async fn insert_record(conn: &mut SqliteConnection, record: &StateRecord) -> Result<(), LedgerError> {
    let data = record.data.as_ref().map(serde_json::to_string).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO submission_states
            (submission_id, sequence, prior_hash, state, data, timestamp,
             author_name, signature, content_hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.submission_id)
    .bind(record.sequence)
    .bind(&record.prior_hash)
    .bind(record.state.as_str())
    .bind(data)
    .bind(&record.timestamp)
    .bind(&record.author)
    .bind(&record.signature)
    .bind(&record.content_hash)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn sign_record(
    submission_id: &str,
    sequence: i64,
    prior_hash: &str,
    state: SubmissionState,
    data: Option<serde_json::Value>,
    author: &Author,
) -> Result<StateRecord, LedgerError> {
    let timestamp = now_timestamp();
    let payload = signable_payload(
        submission_id,
        sequence,
        prior_hash,
        state,
        data.as_ref(),
        &timestamp,
        author.name(),
    )?;
    let signature = author.sign(&payload).to_bytes();

    Ok(StateRecord {
        submission_id: submission_id.to_string(),
        sequence,
        prior_hash: prior_hash.to_string(),
        state,
        data,
        timestamp,
        author: author.name().to_string(),
        signature: hex::encode(signature),
        content_hash: content_hash(&payload, &signature),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    use SubmissionState::*;

    async fn setup() -> (TempDir, Ledger, Author) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
        let ledger = Ledger::open(&url).await.unwrap();

        let author = Author::generate("alice");
        ledger
            .register_author_key(author.name(), &author.verifying_key(), Some("test key"))
            .await
            .unwrap();

        (dir, ledger, author)
    }

    async fn advance(ledger: &Ledger, id: &str, author: &Author, states: &[SubmissionState]) {
        for state in states {
            let head = ledger.head(id).await.unwrap();
            ledger.append(id, head.sequence, *state, None, author).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_register_creates_genesis() {
        let (_dir, ledger, author) = setup().await;

        let genesis = ledger.register_submission("sub-1", &author).await.unwrap();
        assert_eq!(genesis.sequence, 0);
        assert_eq!(genesis.prior_hash, GENESIS_PRIOR_HASH);
        assert_eq!(genesis.state, Received);
        assert_eq!(ledger.head("sub-1").await.unwrap(), genesis);

        let err = ledger.register_submission("sub-1", &author).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateSubmission(_)));
    }

    #[tokio::test]
    async fn test_append_links_to_head() {
        let (_dir, ledger, author) = setup().await;
        let genesis = ledger.register_submission("sub-1", &author).await.unwrap();

        let next = ledger
            .append("sub-1", 0, Validating, Some(json!({ "files": 2 })), &author)
            .await
            .unwrap();
        assert_eq!(next.sequence, 1);
        assert_eq!(next.prior_hash, genesis.content_hash);
        assert_eq!(next.data, Some(json!({ "files": 2 })));

        let history = ledger.history("sub-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], next);
    }

    #[tokio::test]
    async fn test_transition_table_enforced() {
        let (_dir, ledger, author) = setup().await;
        ledger.register_submission("sub-1", &author).await.unwrap();

        let err = ledger.append("sub-1", 0, Encrypting, None, &author).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidTransition { from: Received, to: Encrypting }
        ));

        advance(&ledger, "sub-1", &author, &[Validating, Invalid]).await;
        let err = ledger.append("sub-1", 2, Error, None, &author).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { from: Invalid, .. }));
        assert_eq!(ledger.history("sub-1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_submission() {
        let (_dir, ledger, author) = setup().await;
        let err = ledger.append("nope", 0, Validating, None, &author).await.unwrap_err();
        assert!(matches!(err, LedgerError::SubmissionNotFound(_)));
        assert!(matches!(
            ledger.verify("nope").await.unwrap_err(),
            LedgerError::SubmissionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_unregistered_author_persists_nothing() {
        let (_dir, ledger, author) = setup().await;
        ledger.register_submission("sub-1", &author).await.unwrap();

        let mallory = Author::generate("mallory");
        let err = ledger.append("sub-1", 0, Validating, None, &mallory).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnregisteredAuthor(_)));

        // Same name, different key
        let impostor = Author::generate("alice");
        let err = ledger.append("sub-1", 0, Validating, None, &impostor).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnregisteredAuthor(_)));

        assert_eq!(ledger.history("sub-1").await.unwrap().len(), 1);
        assert!(matches!(
            ledger.register_submission("sub-2", &mallory).await.unwrap_err(),
            LedgerError::UnregisteredAuthor(_)
        ));
        assert_eq!(ledger.list_submissions(10, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revoked_key_stops_writes_but_history_verifies() {
        let (_dir, ledger, author) = setup().await;
        ledger.register_submission("sub-1", &author).await.unwrap();
        advance(&ledger, "sub-1", &author, &[Validating]).await;

        let revoked = ledger
            .revoke_author_key(author.name(), &author.verifying_key())
            .await
            .unwrap();
        assert!(revoked.revoked_at.is_some());

        let err = ledger.append("sub-1", 1, Valid, None, &author).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnregisteredAuthor(_)));
        assert!(ledger.verify("sub-1").await.unwrap().is_intact());

        let keys = ledger.author_keys(author.name()).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].is_revoked());
    }

    #[tokio::test]
    async fn test_append_detects_moved_head() {
        let (_dir, ledger, author) = setup().await;
        ledger.register_submission("sub-1", &author).await.unwrap();
        ledger.append("sub-1", 0, Validating, None, &author).await.unwrap();

        let err = ledger
            .append("sub-1", 0, Valid, None, &author)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::ConcurrentModification { expected: 0, found: 1, .. }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_concurrent_appends_one_wins() {
        let (_dir, ledger, author) = setup().await;
        let author = Arc::new(author);
        ledger.register_submission("sub-1", &author).await.unwrap();

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let ledger = ledger.clone();
                let author = author.clone();
                tokio::spawn(async move {
                    ledger.append("sub-1", 0, Validating, None, &author).await
                })
            })
            .collect();

        let mut ok = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(LedgerError::ConcurrentModification { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!((ok, conflicts), (1, 1));

        let history = ledger.history("sub-1").await.unwrap();
        let sequences: Vec<_> = history.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_racing_appends_from_same_head() {
        let (_dir, ledger, author) = setup().await;
        let author = Arc::new(author);
        ledger.register_submission("sub-1", &author).await.unwrap();
        advance(&ledger, "sub-1", &author, &[Validating, Valid]).await;
        let seen = ledger.head("sub-1").await.unwrap().sequence;

        let tasks: Vec<_> = [Encrypting, Error]
            .into_iter()
            .map(|state| {
                let ledger = ledger.clone();
                let author = author.clone();
                tokio::spawn(async move { ledger.append("sub-1", seen, state, None, &author).await })
            })
            .collect();

        let mut winners = Vec::new();
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(record) => winners.push(record),
                Err(LedgerError::ConcurrentModification { expected, found, .. }) => {
                    assert_eq!((expected, found), (2, 3));
                    conflicts += 1;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(conflicts, 1);

        let history = ledger.history("sub-1").await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[3], winners[0]);
        assert!(ledger.verify("sub-1").await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn test_abandoned_write_is_discarded() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
        let options = SqliteConnectOptions::from_str(&url)
            .unwrap()
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(10))
            .journal_mode(SqliteJournalMode::Wal);
        // A single connection, so the next write would inherit a leaked transaction
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        crate::db::initialize_schema(&pool).await.unwrap();
        let ledger = Ledger::new(pool);

        let author = Author::generate("alice");
        ledger
            .register_author_key(author.name(), &author.verifying_key(), None)
            .await
            .unwrap();
        ledger.register_submission("sub-1", &author).await.unwrap();

        let mut tx = WriteTransaction::begin(ledger.pool()).await.unwrap();
        let proposal = Proposal::Transition { state: Validating, data: None };
        let uncommitted = append_in(tx.conn().unwrap(), "sub-1", Some(0), proposal, &author)
            .await
            .unwrap();
        assert_eq!(uncommitted.sequence, 1);
        drop(tx);

        let record = ledger.append("sub-1", 0, Validating, None, &author).await.unwrap();
        assert_eq!(record.sequence, 1);

        let history = ledger.history("sub-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], record);
        assert!(ledger.verify("sub-1").await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn test_verify_intact_chain() {
        let (_dir, ledger, author) = setup().await;
        ledger.register_submission("sub-1", &author).await.unwrap();
        advance(
            &ledger,
            "sub-1",
            &author,
            &[Validating, Valid, Encrypting, Encrypted, Uploading, Uploaded],
        )
        .await;

        let head = ledger.head("sub-1").await.unwrap();
        assert_eq!(
            ledger.verify("sub-1").await.unwrap(),
            ChainStatus::Intact { records: 7, head_hash: head.content_hash }
        );
    }

    #[tokio::test]
    async fn test_records_are_append_only() {
        let (_dir, ledger, author) = setup().await;
        ledger.register_submission("sub-1", &author).await.unwrap();

        let update = sqlx::query("UPDATE submission_states SET state = 'archived'")
            .execute(ledger.pool())
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM submission_states").execute(ledger.pool()).await;
        assert!(delete.is_err());

        let delete = sqlx::query("DELETE FROM author_keys").execute(ledger.pool()).await;
        assert!(delete.is_err());
    }

    async fn tamper(ledger: &Ledger, sql: &str, sequence: i64) {
        sqlx::query("DROP TRIGGER submission_states_no_update")
            .execute(ledger.pool())
            .await
            .unwrap();
        sqlx::query(sql)
            .bind(sequence)
            .execute(ledger.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_verify_reports_tampered_state() {
        let (_dir, ledger, author) = setup().await;
        ledger.register_submission("sub-1", &author).await.unwrap();
        advance(&ledger, "sub-1", &author, &[Validating, Valid, Encrypting]).await;

        tamper(
            &ledger,
            "UPDATE submission_states SET state = 'invalid' WHERE sequence = ?",
            2,
        )
        .await;

        assert_eq!(ledger.verify("sub-1").await.unwrap().broken_at(), Some(2));
    }

    #[tokio::test]
    async fn test_verify_reports_tampered_signature() {
        let (_dir, ledger, author) = setup().await;
        ledger.register_submission("sub-1", &author).await.unwrap();
        advance(&ledger, "sub-1", &author, &[Validating, Valid]).await;

        let forged = hex::encode(author.sign(b"something else").to_bytes());
        let sql = format!(
            "UPDATE submission_states SET signature = '{}' WHERE sequence = ?",
            forged
        );
        tamper(&ledger, &sql, 1).await;

        assert_eq!(ledger.verify("sub-1").await.unwrap().broken_at(), Some(1));
    }

    #[tokio::test]
    async fn test_verify_reports_stale_head_pointer() {
        let (_dir, ledger, author) = setup().await;
        ledger.register_submission("sub-1", &author).await.unwrap();
        advance(&ledger, "sub-1", &author, &[Validating]).await;

        sqlx::query("UPDATE submissions SET head_state = 'valid'")
            .execute(ledger.pool())
            .await
            .unwrap();

        assert_eq!(ledger.verify("sub-1").await.unwrap().broken_at(), Some(1));
    }

    #[tokio::test]
    async fn test_recover_requires_confirmation() {
        let (_dir, ledger, author) = setup().await;
        ledger.register_submission("sub-1", &author).await.unwrap();
        advance(&ledger, "sub-1", &author, &[Validating, Valid, Encrypting, Error]).await;

        let err = ledger
            .append("sub-1", 4, Encrypting, None, &author)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { from: Error, .. }));

        let err = ledger
            .recover("sub-1", &OperatorConfirmation::new("ops", "  "), &author)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::RecoveryNotConfirmed));

        let recovered = ledger
            .recover(
                "sub-1",
                &OperatorConfirmation::new("ops", "storage outage resolved"),
                &author,
            )
            .await
            .unwrap();
        assert_eq!(recovered.state, Encrypting);
        assert_eq!(recovered.data.as_ref().unwrap()["operator"], "ops");
        assert!(ledger.verify("sub-1").await.unwrap().is_intact());

        let err = ledger
            .recover("sub-1", &OperatorConfirmation::new("ops", "again"), &author)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NothingToRecover { state: Encrypting, .. }));
    }

    #[tokio::test]
    async fn test_list_submissions_filters_by_state() {
        let (_dir, ledger, author) = setup().await;
        for id in ["a", "b", "c"] {
            ledger.register_submission(id, &author).await.unwrap();
        }
        advance(&ledger, "b", &author, &[Validating]).await;

        let all = ledger.list_submissions(10, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "b");

        let received = ledger.list_submissions(10, Some(Received)).await.unwrap();
        let ids: Vec<_> = received.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&"b"));

        assert_eq!(ledger.list_submissions(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_newer_schema_is_rejected() {
        let (_dir, ledger, _author) = setup().await;
        sqlx::query("PRAGMA user_version = 99")
            .execute(ledger.pool())
            .await
            .unwrap();

        let err = crate::db::initialize_schema(ledger.pool()).await.unwrap_err();
        assert!(matches!(err, LedgerError::OutdatedSchema { found: 99, .. }));
    }
}
