//! Vidgate persistence layer: the per-user storage quota catalog.
//!
//! This crate offers an async API around SQLite (sqlx) for the gateway's
//! bookkeeping: how much storage a user has, how much is used, and which
//! files they own. The streaming path only reads this catalog; the upload and
//! delete flows mutate it.

use std::{str::FromStr, time::Duration};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use thiserror::Error;

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Primary entry point to the quota catalog.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database
    /// located at the given URL (e.g. `sqlite:///var/lib/vidgate/catalog.db`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .connect_with(options)
            .await?;

        // Run embedded migrations. The directory is resolved relative to this crate.
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns a user's storage record with its file list, or `None` when the
    /// user has never uploaded anything.
    pub async fn find_user_storage(&self, email: &str) -> Result<Option<UserStorageRecord>> {
        let row = sqlx::query("SELECT * FROM user_storage WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut record = map_user_storage(row)?;
        record.files = self.list_files(email).await?;
        Ok(Some(record))
    }

    /// Creates an empty storage record with the given quota.
    pub async fn initialize_user_storage(
        &self,
        email: &str,
        total_storage: u64,
    ) -> Result<UserStorageRecord> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO user_storage (email, total_storage, used_storage, created_at, updated_at)
            VALUES (?, ?, 0, ?, ?)
            "#,
        )
        .bind(email)
        .bind(total_storage as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.find_user_storage(email)
            .await?
            .ok_or_else(|| anyhow!("storage record inserted but missing when reloaded ({email})"))
    }

    /// Registers an uploaded file and bumps the user's used storage. Fails
    /// with [`StorageError::UserNotFound`] when the user has no storage row,
    /// and [`StorageError::DuplicateFile`] when the filename is already taken.
    pub async fn add_file(&self, email: &str, filename: &str, size: u64) -> Result<FileRecord> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO storage_files (email, filename, size, uploaded_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(email)
        .bind(filename)
        .bind(size as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                anyhow::Error::new(StorageError::DuplicateFile(filename.to_owned()))
            } else if is_foreign_key_violation(&err) {
                anyhow::Error::new(StorageError::UserNotFound(email.to_owned()))
            } else {
                err.into()
            }
        })?;

        sqlx::query(
            r#"
            UPDATE user_storage
            SET used_storage = used_storage + ?, updated_at = ?
            WHERE email = ?
            "#,
        )
        .bind(size as i64)
        .bind(&now)
        .bind(email)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.find_file(email, filename)
            .await?
            .ok_or_else(|| anyhow!("file row inserted but missing when reloaded ({filename})"))
    }

    /// Removes a file and releases its bytes from the user's used storage.
    /// Returns the removed record, or `None` when the catalog never held it.
    pub async fn remove_file(&self, email: &str, filename: &str) -> Result<Option<FileRecord>> {
        let Some(record) = self.find_file(email, filename).await? else {
            return Ok(None);
        };

        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM storage_files WHERE email = ? AND filename = ?")
            .bind(email)
            .bind(filename)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE user_storage
            SET used_storage = MAX(used_storage - ?, 0), updated_at = ?
            WHERE email = ?
            "#,
        )
        .bind(record.size as i64)
        .bind(&now)
        .bind(email)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(record))
    }

    /// Looks up a single file row in a user's catalog.
    pub async fn find_file(&self, email: &str, filename: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM storage_files WHERE email = ? AND filename = ?")
            .bind(email)
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_file).transpose()
    }

    /// Lists a user's files ordered by upload time ascending.
    pub async fn list_files(&self, email: &str) -> Result<Vec<FileRecord>> {
        let mut rows =
            sqlx::query("SELECT * FROM storage_files WHERE email = ? ORDER BY uploaded_at ASC, id ASC")
                .bind(email)
                .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_file(row)?);
        }
        Ok(out)
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.message().contains("FOREIGN KEY"))
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn map_user_storage(row: SqliteRow) -> Result<UserStorageRecord> {
    Ok(UserStorageRecord {
        email: row.try_get("email")?,
        total_storage: row.try_get::<i64, _>("total_storage")? as u64,
        used_storage: row.try_get::<i64, _>("used_storage")? as u64,
        files: Vec::new(),
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}

fn map_file(row: SqliteRow) -> Result<FileRecord> {
    Ok(FileRecord {
        filename: row.try_get("filename")?,
        size: row.try_get::<i64, _>("size")? as u64,
        uploaded_at: parse_datetime(row.try_get("uploaded_at")?)?,
    })
}

/// Errors returned by the catalog layer.
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("file '{0}' already exists in the user's storage")]
    DuplicateFile(String),
    #[error("no storage record for user '{0}'")]
    UserNotFound(String),
}

/// Persisted per-user quota row, with the file list attached on lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserStorageRecord {
    pub email: String,
    pub total_storage: u64,
    pub used_storage: u64,
    pub files: Vec<FileRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserStorageRecord {
    /// Used storage as a percentage of the quota.
    pub fn usage_percentage(&self) -> f64 {
        if self.total_storage == 0 {
            return 0.0;
        }
        self.used_storage as f64 / self.total_storage as f64 * 100.0
    }
}

/// One stored object in a user's catalog. The `filename` is the full blob key
/// (`{username}/{name}`), matching the key in the blob store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub filename: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DB_URL: &str = "sqlite::memory:";

    async fn setup_db() -> Database {
        Database::connect(TEST_DB_URL).await.unwrap()
    }

    #[tokio::test]
    async fn initialize_and_find_roundtrip() {
        let db = setup_db().await;
        let record = db
            .initialize_user_storage("alice@example.com", 50 * 1024 * 1024)
            .await
            .unwrap();

        assert_eq!(record.email, "alice@example.com");
        assert_eq!(record.used_storage, 0);
        assert!(record.files.is_empty());

        let fetched = db
            .find_user_storage("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.total_storage, 50 * 1024 * 1024);

        assert!(db.find_user_storage("bob@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn add_file_bumps_used_storage() {
        let db = setup_db().await;
        db.initialize_user_storage("alice@example.com", 1_000_000)
            .await
            .unwrap();

        let file = db
            .add_file("alice@example.com", "alice/movie.mkv", 4_096)
            .await
            .unwrap();
        assert_eq!(file.filename, "alice/movie.mkv");
        assert_eq!(file.size, 4_096);

        let storage = db
            .find_user_storage("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(storage.used_storage, 4_096);
        assert_eq!(storage.files.len(), 1);
    }

    #[tokio::test]
    async fn add_file_for_unknown_user_is_rejected() {
        let db = setup_db().await;

        let err = db
            .add_file("ghost@example.com", "ghost/a.mp4", 10)
            .await
            .unwrap_err();
        let storage_err = err.downcast::<StorageError>().unwrap();
        assert!(matches!(storage_err, StorageError::UserNotFound(_)));

        // The rolled-back file row must not linger.
        assert!(db
            .find_file("ghost@example.com", "ghost/a.mp4")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_filenames_are_rejected() {
        let db = setup_db().await;
        db.initialize_user_storage("alice@example.com", 1_000_000)
            .await
            .unwrap();
        db.add_file("alice@example.com", "alice/movie.mkv", 10)
            .await
            .unwrap();

        let err = db
            .add_file("alice@example.com", "alice/movie.mkv", 10)
            .await
            .unwrap_err();
        let storage_err = err.downcast::<StorageError>().unwrap();
        assert!(matches!(storage_err, StorageError::DuplicateFile(_)));
    }

    #[tokio::test]
    async fn remove_file_releases_quota() {
        let db = setup_db().await;
        db.initialize_user_storage("alice@example.com", 1_000_000)
            .await
            .unwrap();
        db.add_file("alice@example.com", "alice/a.mp4", 500)
            .await
            .unwrap();
        db.add_file("alice@example.com", "alice/b.mp4", 300)
            .await
            .unwrap();

        let removed = db
            .remove_file("alice@example.com", "alice/a.mp4")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(removed.size, 500);

        let storage = db
            .find_user_storage("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(storage.used_storage, 300);
        assert_eq!(storage.files.len(), 1);

        assert!(db
            .remove_file("alice@example.com", "alice/ghost.mp4")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn usage_percentage_handles_zero_quota() {
        let record = UserStorageRecord {
            email: "x@example.com".into(),
            total_storage: 0,
            used_storage: 0,
            files: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(record.usage_percentage(), 0.0);
    }
}
