//! Encrypted credential storage using SQLite.
//!
//! One row per user identity, keyed on `user_id`. Access and refresh tokens
//! pass through the [`Cipher`] on the way in and out; only ciphertext ever
//! reaches disk. Writes are upserts with field-level merge: a submission
//! that omits the refresh token must not erase a previously stored one.

use crate::crypto::{Cipher, CryptoError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A user's stored credential, with secrets decrypted.
///
/// This form only exists in memory on the privileged read path; the stored
/// form always carries ciphertext. Both secrets are `None` after the
/// credential has been invalidated (the user must re-authorize upstream).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    pub photo_url: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Profile view of a credential. Never carries secrets.
#[derive(Clone, Debug, Serialize)]
pub struct CredentialProfile {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    pub photo_url: Option<String>,
    pub scopes: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Expiry and profile metadata for the validity check.
///
/// Read without touching ciphertext, so a corrupt stored secret cannot
/// break validation.
#[derive(Clone, Debug)]
pub struct CredentialStatus {
    pub email: String,
    pub display_name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// An inbound token submission (plaintext secrets).
///
/// `refresh_token: None` means "leave any stored refresh token in place";
/// every other field overwrites on each submission.
#[derive(Clone, Debug)]
pub struct TokenSubmission {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    pub photo_url: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     user_id TEXT PRIMARY KEY,
///     email TEXT NOT NULL,
///     display_name TEXT NOT NULL,
///     photo_url TEXT,
///     access_token TEXT,       -- Encrypted; NULL after invalidation
///     refresh_token TEXT,      -- Encrypted (optional)
///     expires_at TEXT,         -- RFC 3339 timestamp (optional)
///     scopes TEXT NOT NULL,    -- JSON array
///     updated_at TEXT NOT NULL -- RFC 3339 timestamp
/// );
/// ```
///
/// # Thread safety
/// Connection is wrapped in a Mutex; SQLite's single-statement upsert gives
/// field-level last-write-wins for concurrent submissions on the same user.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    cipher: Arc<Cipher>,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    pub fn new<P: AsRef<Path>>(db_path: P, cipher: Arc<Cipher>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                user_id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                display_name TEXT NOT NULL,
                photo_url TEXT,
                access_token TEXT,
                refresh_token TEXT,
                expires_at TEXT,
                scopes TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create credentials table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    /// Merges a token submission into the stored credential (creating one
    /// if absent) and stamps `updated_at`.
    ///
    /// All fields overwrite except the refresh token, which is only written
    /// when the submission carries one (`COALESCE` keeps the stored value
    /// otherwise). The merge happens in a single statement, so concurrent
    /// submissions cannot leave a half-written row.
    pub fn upsert(&self, submission: &TokenSubmission) -> Result<(), StoreError> {
        let access_token = self.cipher.encrypt(&submission.access_token)?;
        let refresh_token = submission
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t))
            .transpose()?;

        let expires_at = submission.expires_at.map(|dt| dt.to_rfc3339());
        let scopes = serde_json::to_string(&submission.scopes)
            .map_err(|e| StoreError::Corrupt(format!("failed to encode scopes: {}", e)))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO credentials (
                    user_id, email, display_name, photo_url,
                    access_token, refresh_token, expires_at, scopes, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(user_id) DO UPDATE SET
                    email = excluded.email,
                    display_name = excluded.display_name,
                    photo_url = excluded.photo_url,
                    access_token = excluded.access_token,
                    refresh_token = COALESCE(excluded.refresh_token, refresh_token),
                    expires_at = excluded.expires_at,
                    scopes = excluded.scopes,
                    updated_at = excluded.updated_at
                "#,
                params![
                    submission.user_id,
                    submission.email,
                    submission.display_name,
                    submission.photo_url,
                    access_token,
                    refresh_token,
                    expires_at,
                    scopes,
                    now,
                ],
            )?;

        Ok(())
    }

    /// Retrieves a credential with decrypted secrets.
    ///
    /// A decrypt failure propagates as [`StoreError::Crypto`]; it indicates
    /// data corruption or a passphrase rotation and must not be swallowed.
    pub fn get(&self, user_id: &str) -> Result<Option<Credential>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT user_id, email, display_name, photo_url,
                       access_token, refresh_token, expires_at, scopes, updated_at
                FROM credentials
                WHERE user_id = ?1
                "#,
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            user_id,
            email,
            display_name,
            photo_url,
            access_token,
            refresh_token,
            expires_at,
            scopes,
            updated_at,
        )) = row
        else {
            return Ok(None);
        };

        let access_token = access_token
            .as_deref()
            .map(|c| self.cipher.decrypt(c))
            .transpose()?;
        let refresh_token = refresh_token
            .as_deref()
            .map(|c| self.cipher.decrypt(c))
            .transpose()?;

        Ok(Some(Credential {
            user_id,
            email,
            display_name,
            photo_url,
            access_token,
            refresh_token,
            expires_at: expires_at.as_deref().map(parse_timestamp).transpose()?,
            scopes: parse_scopes(&scopes)?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    /// Retrieves profile metadata and expiry without decrypting secrets.
    pub fn status(&self, user_id: &str) -> Result<Option<CredentialStatus>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT email, display_name, expires_at FROM credentials WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((email, display_name, expires_at)) = row else {
            return Ok(None);
        };

        Ok(Some(CredentialStatus {
            email,
            display_name,
            expires_at: expires_at.as_deref().map(parse_timestamp).transpose()?,
        }))
    }

    /// Lists profile records for every stored credential. Never returns
    /// secrets and never decrypts.
    pub fn list_all(&self) -> Result<Vec<CredentialProfile>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id, email, display_name, photo_url, scopes, updated_at
            FROM credentials
            ORDER BY user_id
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut profiles = Vec::new();
        for row in rows {
            let (user_id, email, display_name, photo_url, scopes, updated_at) = row?;
            profiles.push(CredentialProfile {
                user_id,
                email,
                display_name,
                photo_url,
                scopes: parse_scopes(&scopes)?,
                updated_at: parse_timestamp(&updated_at)?,
            });
        }

        Ok(profiles)
    }

    /// Writes refreshed tokens for an existing credential.
    ///
    /// Both secrets are re-encrypted from plaintext (the orchestrator works
    /// from decrypted values, so an unrotated refresh token gets a fresh
    /// ciphertext rather than reusing the old one).
    pub fn update_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let access_token = self.cipher.encrypt(access_token)?;
        let refresh_token = self.cipher.encrypt(refresh_token)?;
        let expires_at = expires_at.map(|dt| dt.to_rfc3339());
        let now = Utc::now().to_rfc3339();

        self.conn.lock().unwrap().execute(
            r#"
            UPDATE credentials
            SET access_token = ?2, refresh_token = ?3, expires_at = ?4, updated_at = ?5
            WHERE user_id = ?1
            "#,
            params![user_id, access_token, refresh_token, expires_at, now],
        )?;

        Ok(())
    }

    /// Clears both secrets and the expiry, forcing full re-authorization
    /// upstream. Profile fields are kept.
    pub fn invalidate(&self, user_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();

        self.conn.lock().unwrap().execute(
            r#"
            UPDATE credentials
            SET access_token = NULL, refresh_token = NULL, expires_at = NULL, updated_at = ?2
            WHERE user_id = ?1
            "#,
            params![user_id, now],
        )?;

        Ok(())
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{}': {}", s, e)))
}

fn parse_scopes(s: &str) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(s)
        .map_err(|e| StoreError::Corrupt(format!("invalid scopes column: {}", e)))
}

/// Store errors
#[derive(Debug)]
pub enum StoreError {
    /// Underlying SQLite failure
    Database(rusqlite::Error),
    /// Encrypt/decrypt failure on a stored secret
    Crypto(CryptoError),
    /// A stored column failed to parse
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e)
    }
}

impl From<CryptoError> for StoreError {
    fn from(e: CryptoError) -> Self {
        StoreError::Crypto(e)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Crypto(e) => write!(f, "Crypto error: {}", e),
            StoreError::Corrupt(msg) => write!(f, "Corrupt record: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn create_test_store() -> CredentialStore {
        let cipher = Arc::new(Cipher::new("test-passphrase"));
        CredentialStore::new(":memory:", cipher).expect("Failed to create test store")
    }

    fn test_submission(user_id: &str) -> TokenSubmission {
        TokenSubmission {
            user_id: user_id.to_string(),
            email: format!("{}@example.com", user_id),
            display_name: "Test User".to_string(),
            photo_url: Some("https://example.com/photo.jpg".to_string()),
            access_token: "access-token-12345".to_string(),
            refresh_token: Some("refresh-token-67890".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            scopes: vec!["email".to_string(), "calendar".to_string()],
        }
    }

    #[test]
    fn test_upsert_and_get_roundtrip() {
        let store = create_test_store();
        let submission = test_submission("user1");

        store.upsert(&submission).expect("Failed to upsert");

        let cred = store
            .get("user1")
            .expect("Failed to get")
            .expect("Credential not found");

        // Secrets come back decrypted
        assert_eq!(cred.access_token.as_deref(), Some("access-token-12345"));
        assert_eq!(cred.refresh_token.as_deref(), Some("refresh-token-67890"));
        assert_eq!(cred.email, "user1@example.com");
        assert_eq!(cred.scopes, vec!["email", "calendar"]);
        assert!(cred.expires_at.is_some());
    }

    #[test]
    fn test_secrets_encrypted_at_rest() {
        let store = create_test_store();
        store.upsert(&test_submission("user1")).unwrap();

        // Read the raw column, bypassing the decrypting accessor
        let conn = store.conn.lock().unwrap();
        let raw: String = conn
            .query_row(
                "SELECT access_token FROM credentials WHERE user_id = 'user1'",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_ne!(raw, "access-token-12345");
        assert!(!raw.contains("access-token"));
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();
        assert!(store.get("missing").unwrap().is_none());
        assert!(store.status("missing").unwrap().is_none());
    }

    #[test]
    fn test_partial_update_preserves_refresh_token() {
        let store = create_test_store();
        store.upsert(&test_submission("user1")).unwrap();

        // Second submission omits the refresh token
        let mut second = test_submission("user1");
        second.access_token = "newer-access-token".to_string();
        second.refresh_token = None;
        store.upsert(&second).unwrap();

        let cred = store.get("user1").unwrap().unwrap();
        assert_eq!(cred.access_token.as_deref(), Some("newer-access-token"));
        // Merge semantics: the original refresh token survives unchanged
        assert_eq!(cred.refresh_token.as_deref(), Some("refresh-token-67890"));
    }

    #[test]
    fn test_upsert_overwrites_profile_and_access() {
        let store = create_test_store();
        store.upsert(&test_submission("user1")).unwrap();

        let mut second = test_submission("user1");
        second.email = "renamed@example.com".to_string();
        second.access_token = "rotated".to_string();
        second.refresh_token = Some("rotated-refresh".to_string());
        second.scopes = vec!["drive".to_string()];
        store.upsert(&second).unwrap();

        let cred = store.get("user1").unwrap().unwrap();
        assert_eq!(cred.email, "renamed@example.com");
        assert_eq!(cred.access_token.as_deref(), Some("rotated"));
        assert_eq!(cred.refresh_token.as_deref(), Some("rotated-refresh"));
        assert_eq!(cred.scopes, vec!["drive"]);
    }

    #[test]
    fn test_update_tokens() {
        let store = create_test_store();
        store.upsert(&test_submission("user1")).unwrap();

        let expires = Utc::now() + Duration::hours(2);
        store
            .update_tokens("user1", "fresh-access", "fresh-refresh", Some(expires))
            .unwrap();

        let cred = store.get("user1").unwrap().unwrap();
        assert_eq!(cred.access_token.as_deref(), Some("fresh-access"));
        assert_eq!(cred.refresh_token.as_deref(), Some("fresh-refresh"));
        let delta = (cred.expires_at.unwrap() - expires).num_seconds().abs();
        assert!(delta < 1);
        // Profile fields untouched by the refresh path
        assert_eq!(cred.email, "user1@example.com");
    }

    #[test]
    fn test_invalidate_clears_secrets_and_expiry() {
        let store = create_test_store();
        store.upsert(&test_submission("user1")).unwrap();

        store.invalidate("user1").unwrap();

        let cred = store.get("user1").unwrap().unwrap();
        assert!(cred.access_token.is_none());
        assert!(cred.refresh_token.is_none());
        assert!(cred.expires_at.is_none());
        // Profile survives invalidation
        assert_eq!(cred.email, "user1@example.com");
    }

    #[test]
    fn test_list_all_profiles_only() {
        let store = create_test_store();
        store.upsert(&test_submission("user1")).unwrap();
        store.upsert(&test_submission("user2")).unwrap();

        let profiles = store.list_all().unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].user_id, "user1");
        assert_eq!(profiles[1].user_id, "user2");
        assert_eq!(profiles[0].scopes, vec!["email", "calendar"]);
    }

    #[test]
    fn test_status_skips_ciphertext() {
        let store = create_test_store();
        store.upsert(&test_submission("user1")).unwrap();

        // Corrupt the stored access token directly
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE credentials SET access_token = 'garbage' WHERE user_id = 'user1'",
                [],
            )
            .unwrap();
        }

        // get() must now fail loudly...
        assert!(matches!(
            store.get("user1"),
            Err(StoreError::Crypto(_))
        ));

        // ...but status() never touches the ciphertext
        let status = store.status("user1").unwrap().unwrap();
        assert_eq!(status.email, "user1@example.com");
        assert!(status.expires_at.is_some());
    }

    #[test]
    fn test_different_users_isolated() {
        let store = create_test_store();
        store.upsert(&test_submission("user1")).unwrap();

        let mut other = test_submission("user2");
        other.access_token = "other-access".to_string();
        store.upsert(&other).unwrap();

        assert_eq!(
            store.get("user1").unwrap().unwrap().access_token.as_deref(),
            Some("access-token-12345")
        );
        assert_eq!(
            store.get("user2").unwrap().unwrap().access_token.as_deref(),
            Some("other-access")
        );
    }
}
