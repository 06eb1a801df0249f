//! Encrypted credential storage using SQLite.
//!
//! Tokens are encrypted at rest with AES-256-GCM; everything else is stored
//! in the clear. Rows are keyed by credential id, since one credential may be
//! shared by many applets and is never duplicated per-applet.

use super::{encryption, Credential};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id TEXT PRIMARY KEY,
///     account_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     access_token TEXT NOT NULL,       -- Encrypted
///     access_token_nonce TEXT NOT NULL,
///     refresh_token TEXT,               -- Encrypted (optional)
///     refresh_token_nonce TEXT,
///     expires_at TEXT NOT NULL,         -- ISO 8601 timestamp
///     context TEXT NOT NULL,            -- Opaque provider JSON blob
///     permanent INTEGER NOT NULL,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL
/// );
/// ```
///
/// # Concurrency
/// The connection is wrapped in a Mutex; `update_tokens` is a single UPDATE,
/// so concurrent refreshes of the same credential from different units are
/// last-writer-wins on the token fields.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    encryption_key: Vec<u8>,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// `encryption_key` is the base64-encoded 32-byte master key.
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let key_bytes =
            encryption::validate_key(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open credential database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token TEXT NOT NULL,
                access_token_nonce TEXT NOT NULL,
                refresh_token TEXT,
                refresh_token_nonce TEXT,
                expires_at TEXT NOT NULL,
                context TEXT NOT NULL,
                permanent INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create credentials table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_credentials_account ON credentials(account_id, provider)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
            encryption_key: key_bytes,
        })
    }

    /// Inserts a new credential.
    pub fn insert(&self, credential: &Credential) -> Result<()> {
        let (access_encrypted, access_nonce) =
            encryption::encrypt(&credential.access_token, &self.encryption_key)
                .context("Failed to encrypt access token")?;

        let (refresh_encrypted, refresh_nonce) = match &credential.refresh_token {
            Some(token) => {
                let (encrypted, nonce) = encryption::encrypt(token, &self.encryption_key)
                    .context("Failed to encrypt refresh token")?;
                (Some(encrypted), Some(nonce))
            }
            None => (None, None),
        };

        let now = Utc::now().to_rfc3339();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO credentials (
                    id, account_id, provider,
                    access_token, access_token_nonce,
                    refresh_token, refresh_token_nonce,
                    expires_at, context, permanent, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    credential.id.to_string(),
                    credential.account_id.to_string(),
                    credential.provider,
                    access_encrypted,
                    access_nonce,
                    refresh_encrypted,
                    refresh_nonce,
                    credential.expires_at.to_rfc3339(),
                    credential.context,
                    credential.permanent,
                    now,
                    now,
                ],
            )
            .context("Failed to insert credential")?;

        Ok(())
    }

    /// Retrieves and decrypts one credential by id.
    pub fn get(&self, id: Uuid) -> Result<Option<Credential>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, account_id, provider,
                       access_token, access_token_nonce,
                       refresh_token, refresh_token_nonce,
                       expires_at, context, permanent
                FROM credentials
                WHERE id = ?1
                "#,
            )
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![id.to_string()])
            .context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(self.parse_credential(row)?)),
            None => Ok(None),
        }
    }

    /// Persists refreshed token fields for an existing credential.
    ///
    /// Called by the broker before a refreshed credential is handed back to
    /// any caller; a plain UPDATE, so concurrent refreshes of the same row
    /// resolve last-writer-wins.
    pub fn update_tokens(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let (access_encrypted, access_nonce) =
            encryption::encrypt(access_token, &self.encryption_key)
                .context("Failed to encrypt access token")?;

        let (refresh_encrypted, refresh_nonce) = match refresh_token {
            Some(token) => {
                let (encrypted, nonce) = encryption::encrypt(token, &self.encryption_key)
                    .context("Failed to encrypt refresh token")?;
                (Some(encrypted), Some(nonce))
            }
            None => (None, None),
        };

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE credentials SET
                    access_token = ?1,
                    access_token_nonce = ?2,
                    refresh_token = ?3,
                    refresh_token_nonce = ?4,
                    expires_at = ?5,
                    updated_at = ?6
                WHERE id = ?7
                "#,
                params![
                    access_encrypted,
                    access_nonce,
                    refresh_encrypted,
                    refresh_nonce,
                    expires_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                ],
            )
            .context("Failed to persist refreshed tokens")?;

        Ok(())
    }

    /// Deletes a credential. Permanent credentials (the ones backing account
    /// login) are refused; returns `Ok(false)` for them and for unknown ids.
    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM credentials WHERE id = ?1 AND permanent = 0",
                params![id.to_string()],
            )
            .context("Failed to delete credential")?;
        Ok(rows > 0)
    }

    /// All credentials owned by one account, for the authoring layer.
    pub fn list_by_account(&self, account_id: Uuid) -> Result<Vec<Credential>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, account_id, provider,
                       access_token, access_token_nonce,
                       refresh_token, refresh_token_nonce,
                       expires_at, context, permanent
                FROM credentials
                WHERE account_id = ?1
                ORDER BY provider
                "#,
            )
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![account_id.to_string()])
            .context("Failed to execute query")?;

        let mut credentials = Vec::new();
        while let Some(row) = rows.next().context("Failed to read row")? {
            credentials.push(self.parse_credential(row)?);
        }
        Ok(credentials)
    }

    fn parse_credential(&self, row: &Row<'_>) -> Result<Credential> {
        let id: String = row.get(0)?;
        let account_id: String = row.get(1)?;

        let access_encrypted: String = row.get(3)?;
        let access_nonce: String = row.get(4)?;
        let access_token =
            encryption::decrypt(&access_encrypted, &access_nonce, &self.encryption_key)
                .context("Failed to decrypt access token")?;

        let refresh_encrypted: Option<String> = row.get(5)?;
        let refresh_nonce: Option<String> = row.get(6)?;
        let refresh_token = match (refresh_encrypted, refresh_nonce) {
            (Some(encrypted), Some(nonce)) => Some(
                encryption::decrypt(&encrypted, &nonce, &self.encryption_key)
                    .context("Failed to decrypt refresh token")?,
            ),
            _ => None,
        };

        let expires_at: String = row.get(7)?;

        Ok(Credential {
            id: Uuid::parse_str(&id).context("Invalid credential id")?,
            account_id: Uuid::parse_str(&account_id).context("Invalid account id")?,
            provider: row.get(2)?,
            access_token,
            refresh_token,
            expires_at: DateTime::parse_from_rfc3339(&expires_at)
                .context("Failed to parse expires_at timestamp")?
                .with_timezone(&Utc),
            context: row.get(8)?,
            permanent: row.get(9)?,
        })
    }
}
