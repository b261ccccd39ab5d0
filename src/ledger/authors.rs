//! Author key registry
//!
//! Keys are never edited. Registration and revocation are both appended as
//! events; the current view is folded from them in insertion order.

use ed25519_dalek::VerifyingKey;
use sqlx::SqlitePool;

use super::signing::now_timestamp;
use super::types::{AuthorKey, AuthorKeyEventRow, LedgerError};

const REGISTER: &str = "register";
const REVOKE: &str = "revoke";

/// Author key repository
pub struct AuthorKeyRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AuthorKeyRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a key; registering an already active key is a no-op
    pub async fn register(
        &self,
        author_name: &str,
        key: &VerifyingKey,
        comment: Option<&str>,
    ) -> Result<AuthorKey, LedgerError> {
        let public_key = hex::encode(key.as_bytes());

        if let Some(existing) = self.active_key(author_name, &public_key).await? {
            return Ok(existing);
        }

        let now = now_timestamp();
        sqlx::query(
            r#"
            INSERT INTO author_keys (author_name, public_key, action, comment, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(author_name)
        .bind(&public_key)
        .bind(REGISTER)
        .bind(comment)
        .bind(&now)
        .execute(self.pool)
        .await?;

        tracing::info!(author = author_name, public_key = %public_key, "Registered author key");

        Ok(AuthorKey {
            author_name: author_name.to_string(),
            public_key,
            comment: comment.map(str::to_string),
            registered_at: now,
            revoked_at: None,
        })
    }

    /// Revoke an active key; records signed before now stay valid
    pub async fn revoke(&self, author_name: &str, key: &VerifyingKey) -> Result<AuthorKey, LedgerError> {
        let public_key = hex::encode(key.as_bytes());
        let mut active = self
            .active_key(author_name, &public_key)
            .await?
            .ok_or_else(|| LedgerError::UnregisteredAuthor(author_name.to_string()))?;

        let now = now_timestamp();
        sqlx::query(
            r#"
            INSERT INTO author_keys (author_name, public_key, action, comment, recorded_at)
            VALUES (?, ?, ?, NULL, ?)
            "#,
        )
        .bind(author_name)
        .bind(&public_key)
        .bind(REVOKE)
        .bind(&now)
        .execute(self.pool)
        .await?;

        tracing::warn!(author = author_name, public_key = %public_key, "Revoked author key");

        active.revoked_at = Some(now);
        Ok(active)
    }

    /// All keys ever registered for an author, oldest first
    pub async fn list(&self, author_name: &str) -> Result<Vec<AuthorKey>, LedgerError> {
        let events = sqlx::query_as::<_, AuthorKeyEventRow>(
            r#"
            SELECT author_name, public_key, action, comment, recorded_at
            FROM author_keys
            WHERE author_name = ?
            ORDER BY id ASC
            "#,
        )
        .bind(author_name)
        .fetch_all(self.pool)
        .await?;

        fold_events(events)
    }

    pub async fn is_active(&self, author_name: &str, key: &VerifyingKey) -> Result<bool, LedgerError> {
        let public_key = hex::encode(key.as_bytes());
        Ok(self.active_key(author_name, &public_key).await?.is_some())
    }

    async fn active_key(&self, author_name: &str, public_key: &str) -> Result<Option<AuthorKey>, LedgerError> {
        let keys = self.list(author_name).await?;
        Ok(keys
            .into_iter()
            .find(|k| k.public_key == public_key && !k.is_revoked()))
    }
}

fn fold_events(events: Vec<AuthorKeyEventRow>) -> Result<Vec<AuthorKey>, LedgerError> {
    let mut keys: Vec<AuthorKey> = Vec::new();

    for event in events {
        match event.action.as_str() {
            REGISTER => keys.push(AuthorKey {
                author_name: event.author_name,
                public_key: event.public_key,
                comment: event.comment,
                registered_at: event.recorded_at,
                revoked_at: None,
            }),
            REVOKE => {
                let target = keys
                    .iter_mut()
                    .rev()
                    .find(|k| k.public_key == event.public_key && k.revoked_at.is_none());
                match target {
                    Some(key) => key.revoked_at = Some(event.recorded_at),
                    None => {
                        return Err(LedgerError::Corrupt(format!(
                            "revocation of unregistered key {} for {}",
                            event.public_key, event.author_name
                        )))
                    }
                }
            }
            other => {
                return Err(LedgerError::Corrupt(format!("unknown author key action: {}", other)));
            }
        }
    }

    Ok(keys)
}
