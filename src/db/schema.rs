//! Database schema initialization

use sqlx::SqlitePool;

use crate::ledger::LedgerError;

/// Schema revision this build reads and writes
pub const SCHEMA_VERSION: i64 = 1;

/// Initialize the database schema, refusing databases from a newer build
pub async fn initialize_schema(pool: &SqlitePool) -> Result<(), LedgerError> {
    let found = schema_version(pool).await?;
    if found > SCHEMA_VERSION {
        return Err(LedgerError::OutdatedSchema {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    if found < SCHEMA_VERSION {
        sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
            .execute(pool)
            .await?;
        tracing::info!(from = found, to = SCHEMA_VERSION, "Ledger schema initialized");
    }

    Ok(())
}

pub async fn schema_version(pool: &SqlitePool) -> Result<i64, LedgerError> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

const SCHEMA_SQL: &str = r#"
-- Submissions table (head pointer per submission)
CREATE TABLE IF NOT EXISTS submissions (
    id TEXT PRIMARY KEY,
    head_sequence INTEGER NOT NULL,
    head_hash TEXT NOT NULL,
    head_state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_submissions_head_state ON submissions(head_state);
CREATE INDEX IF NOT EXISTS idx_submissions_updated ON submissions(updated_at);

-- Signed, hash-chained state records
CREATE TABLE IF NOT EXISTS submission_states (
    submission_id TEXT NOT NULL REFERENCES submissions(id),
    sequence INTEGER NOT NULL,
    prior_hash TEXT NOT NULL,
    state TEXT NOT NULL,
    data TEXT,
    timestamp TEXT NOT NULL,
    author_name TEXT NOT NULL,
    signature TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    PRIMARY KEY (submission_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_submission_states_author ON submission_states(author_name);

-- Author key registry (register/revoke events)
CREATE TABLE IF NOT EXISTS author_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    author_name TEXT NOT NULL,
    public_key TEXT NOT NULL,
    action TEXT NOT NULL CHECK (action IN ('register', 'revoke')),
    comment TEXT,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_author_keys_author ON author_keys(author_name, public_key);

-- Records and key events are append-only
CREATE TRIGGER IF NOT EXISTS submission_states_no_update
BEFORE UPDATE ON submission_states
BEGIN
    SELECT RAISE(ABORT, 'submission_states is append-only');
END;

CREATE TRIGGER IF NOT EXISTS submission_states_no_delete
BEFORE DELETE ON submission_states
BEGIN
    SELECT RAISE(ABORT, 'submission_states is append-only');
END;

CREATE TRIGGER IF NOT EXISTS author_keys_no_update
BEFORE UPDATE ON author_keys
BEGIN
    SELECT RAISE(ABORT, 'author_keys is append-only');
END;

CREATE TRIGGER IF NOT EXISTS author_keys_no_delete
BEFORE DELETE ON author_keys
BEGIN
    SELECT RAISE(ABORT, 'author_keys is append-only');
END;
"#;
