use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
}

/// Metadata row fetched for the reconciler's light snapshot query.
#[derive(Debug, Clone, Copy)]
pub struct ActiveFaceUser {
    pub enroll_id: i64,
    pub is_active: bool,
}

/// One row of the full face record, used when the reconciler or enrollment
/// controller needs to re-embed an image.
#[derive(Debug, Clone)]
pub struct FaceRow {
    pub name: String,
    pub image: Vec<u8>,
    pub is_active: bool,
}

/// Result row for `search_users_by_name`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserSummary {
    pub enroll_id: i64,
    pub name: String,
    pub is_active: bool,
}

/// The abstract repository contract every biometric access-control store
/// backend must satisfy. The daemon never speaks SQL directly outside an
/// implementation of this trait.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn has_face_data(&self, enroll_id: i64) -> Result<bool, StoreError>;

    async fn upsert_user(
        &self,
        enroll_id: i64,
        name: &str,
        backup_num: i64,
        is_admin: bool,
        image: &[u8],
    ) -> Result<(), StoreError>;

    /// Purge all rows for `enroll_id` — user, face record, and attendance.
    async fn delete_user(&self, enroll_id: i64) -> Result<(), StoreError>;

    async fn set_user_active(&self, enroll_id: i64, active: bool) -> Result<(), StoreError>;

    /// Insert an attendance row unless one already exists for this user
    /// within `debounce_secs` seconds. Returns whether a row was written.
    async fn log_attendance(
        &self,
        enroll_id: i64,
        device_serial: &str,
        debounce_secs: i64,
    ) -> Result<bool, StoreError>;

    async fn search_users_by_name(&self, fragment: &str) -> Result<Vec<UserSummary>, StoreError>;

    /// Monotonically increasing, floored to 1000, never reused.
    async fn next_enroll_id(&self) -> Result<i64, StoreError>;

    async fn snapshot_active_face_users(&self) -> Result<Vec<ActiveFaceUser>, StoreError>;

    async fn fetch_face_row(&self, enroll_id: i64) -> Result<Option<FaceRow>, StoreError>;
}

/// SQLite-backed repository.
///
/// Uses `tokio-rusqlite` to run SQLite operations on a blocking thread
/// without starving the tokio runtime.
#[derive(Clone)]
pub struct SqliteRepository {
    conn: Connection,
}

pub const FACE_BACKUP_NUM: i64 = 50;

impl SqliteRepository {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS users (
                     enroll_id INTEGER PRIMARY KEY,
                     name TEXT NOT NULL,
                     is_admin INTEGER NOT NULL DEFAULT 0,
                     is_active INTEGER NOT NULL DEFAULT 1,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS face_records (
                     enroll_id INTEGER PRIMARY KEY REFERENCES users(enroll_id),
                     backup_num INTEGER NOT NULL,
                     image BLOB NOT NULL,
                     embedding BLOB,
                     updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS attendance (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     enroll_id INTEGER NOT NULL,
                     device_serial TEXT NOT NULL,
                     ts TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_enroll_id ON attendance(enroll_id);
                 CREATE TABLE IF NOT EXISTS counters (
                     name TEXT PRIMARY KEY,
                     value INTEGER NOT NULL
                 );
                 INSERT OR IGNORE INTO counters (name, value) VALUES ('enroll_id', 999);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn has_face_data(&self, enroll_id: i64) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM face_records WHERE enroll_id = ?1)",
                    [enroll_id],
                    |row| row.get(0),
                )?;
                Ok(exists)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn upsert_user(
        &self,
        enroll_id: i64,
        name: &str,
        backup_num: i64,
        is_admin: bool,
        image: &[u8],
    ) -> Result<(), StoreError> {
        let name = name.to_string();
        let image = image.to_vec();
        let created_at = chrono::Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO users (enroll_id, name, is_admin, is_active, created_at)
                     VALUES (?1, ?2, ?3, 1, ?4)
                     ON CONFLICT(enroll_id) DO UPDATE SET name = excluded.name",
                    rusqlite::params![enroll_id, name, is_admin as i64, created_at],
                )?;
                tx.execute(
                    "INSERT INTO face_records (enroll_id, backup_num, image, embedding, updated_at)
                     VALUES (?1, ?2, ?3, NULL, ?4)
                     ON CONFLICT(enroll_id) DO UPDATE SET
                        backup_num = excluded.backup_num,
                        image = excluded.image,
                        embedding = NULL,
                        updated_at = excluded.updated_at",
                    rusqlite::params![enroll_id, backup_num, image, created_at],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    async fn delete_user(&self, enroll_id: i64) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM face_records WHERE enroll_id = ?1", [enroll_id])?;
                tx.execute("DELETE FROM attendance WHERE enroll_id = ?1", [enroll_id])?;
                tx.execute("DELETE FROM users WHERE enroll_id = ?1", [enroll_id])?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    async fn set_user_active(&self, enroll_id: i64, active: bool) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE users SET is_active = ?1 WHERE enroll_id = ?2",
                    rusqlite::params![active as i64, enroll_id],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    async fn log_attendance(
        &self,
        enroll_id: i64,
        device_serial: &str,
        debounce_secs: i64,
    ) -> Result<bool, StoreError> {
        let device_serial = device_serial.to_string();
        let now = chrono::Utc::now();
        let now_str = now.to_rfc3339();
        let cutoff = (now - chrono::Duration::seconds(debounce_secs)).to_rfc3339();

        self.conn
            .call(move |conn| {
                let recent: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM attendance WHERE enroll_id = ?1 AND ts > ?2)",
                    rusqlite::params![enroll_id, cutoff],
                    |row| row.get(0),
                )?;
                if recent {
                    return Ok(false);
                }
                conn.execute(
                    "INSERT INTO attendance (enroll_id, device_serial, ts) VALUES (?1, ?2, ?3)",
                    rusqlite::params![enroll_id, device_serial, now_str],
                )?;
                Ok(true)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn search_users_by_name(&self, fragment: &str) -> Result<Vec<UserSummary>, StoreError> {
        let pattern = format!("%{}%", fragment.replace('%', "\\%").replace('_', "\\_"));
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT enroll_id, name, is_active FROM users
                     WHERE name LIKE ?1 ESCAPE '\\' COLLATE NOCASE
                     ORDER BY enroll_id",
                )?;
                let rows = stmt.query_map([&pattern], |row| {
                    Ok(UserSummary {
                        enroll_id: row.get(0)?,
                        name: row.get(1)?,
                        is_active: row.get::<_, i64>(2)? != 0,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn next_enroll_id(&self) -> Result<i64, StoreError> {
        self.conn
            .call(|conn| {
                let tx = conn.transaction_with_behavior(
                    rusqlite::TransactionBehavior::Immediate,
                )?;
                let current: i64 =
                    tx.query_row("SELECT value FROM counters WHERE name = 'enroll_id'", [], |row| {
                        row.get(0)
                    })?;
                let next = (current + 1).max(1000);
                tx.execute(
                    "UPDATE counters SET value = ?1 WHERE name = 'enroll_id'",
                    [next],
                )?;
                tx.commit()?;
                Ok(next)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn snapshot_active_face_users(&self) -> Result<Vec<ActiveFaceUser>, StoreError> {
        self.conn
            .call(|conn| {
                // `face_records.enroll_id` is the primary key, so a user has at
                // most one row regardless of what `backup_num` it was written
                // with — no need to filter on it here.
                let mut stmt = conn.prepare(
                    "SELECT u.enroll_id, u.is_active
                     FROM users u
                     JOIN face_records f ON f.enroll_id = u.enroll_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(ActiveFaceUser {
                        enroll_id: row.get(0)?,
                        is_active: row.get::<_, i64>(1)? != 0,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn fetch_face_row(&self, enroll_id: i64) -> Result<Option<FaceRow>, StoreError> {
        self.conn
            .call(move |conn| {
                let row = conn.query_row(
                    "SELECT u.name, f.image, u.is_active
                     FROM users u
                     JOIN face_records f ON f.enroll_id = u.enroll_id
                     WHERE u.enroll_id = ?1",
                    [enroll_id],
                    |row| {
                        Ok(FaceRow {
                            name: row.get(0)?,
                            image: row.get(1)?,
                            is_active: row.get::<_, i64>(2)? != 0,
                        })
                    },
                );
                match row {
                    Ok(row) => Ok(Some(row)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_memory() -> SqliteRepository {
        SqliteRepository::open(Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn next_enroll_id_starts_at_1000_and_increments() {
        let store = open_memory().await;
        assert_eq!(store.next_enroll_id().await.unwrap(), 1000);
        assert_eq!(store.next_enroll_id().await.unwrap(), 1001);
    }

    #[tokio::test]
    async fn upsert_then_delete_removes_face_data() {
        let store = open_memory().await;
        store
            .upsert_user(1000, "Ada", 50, false, b"jpeg-bytes")
            .await
            .unwrap();
        assert!(store.has_face_data(1000).await.unwrap());

        store.delete_user(1000).await.unwrap();
        assert!(!store.has_face_data(1000).await.unwrap());
    }

    #[tokio::test]
    async fn set_user_active_mutates_flag() {
        let store = open_memory().await;
        store.upsert_user(1000, "Ada", 50, false, b"x").await.unwrap();
        store.set_user_active(1000, false).await.unwrap();
        let snapshot = store.snapshot_active_face_users().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].is_active);
    }

    #[tokio::test]
    async fn attendance_debounce_suppresses_second_write_within_window() {
        let store = open_memory().await;
        store.upsert_user(1000, "Ada", 50, false, b"x").await.unwrap();
        assert!(store.log_attendance(1000, "SN1", 20).await.unwrap());
        assert!(!store.log_attendance(1000, "SN1", 20).await.unwrap());
    }

    #[tokio::test]
    async fn search_users_by_name_is_case_insensitive_substring() {
        let store = open_memory().await;
        store.upsert_user(1000, "Ada Lovelace", 50, false, b"x").await.unwrap();
        store.upsert_user(1001, "Bob", 50, false, b"x").await.unwrap();

        let results = store.search_users_by_name("ada").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].enroll_id, 1000);
    }

    #[tokio::test]
    async fn fetch_face_row_returns_none_for_unknown_id() {
        let store = open_memory().await;
        assert!(store.fetch_face_row(4242).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_excludes_users_without_face_data() {
        let store = open_memory().await;
        store.upsert_user(1000, "Ada", 50, false, b"x").await.unwrap();
        let snapshot = store.snapshot_active_face_users().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].enroll_id, 1000);
    }
}
