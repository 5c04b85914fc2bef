//! SQLite cache backend with migrations
//!
//! Entries live in one table keyed by the namespaced storage key. Expiry is
//! stored as a unix timestamp and filtered on every read.

use super::backend::CacheBackend;
use super::CacheError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;
use std::time::Duration;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite-backed vector cache store
pub struct SqliteBackend {
    pool: DbPool,
}

impl SqliteBackend {
    /// Open (or create) the cache database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::Unavailable(format!(
                    "Failed to create cache directory {:?}: {}",
                    parent, e
                ))
            })?;
        }

        Self::with_manager(SqliteConnectionManager::file(db_path), 8)
    }

    /// In-memory database shared by a single-connection pool
    pub fn in_memory() -> Result<Self, CacheError> {
        Self::with_manager(SqliteConnectionManager::memory(), 1)
    }

    fn with_manager(manager: SqliteConnectionManager, max_size: u32) -> Result<Self, CacheError> {
        let manager = manager.with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )
        });

        let pool = Pool::builder()
            .max_size(max_size)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)
            .map_err(|e| {
                CacheError::Unavailable(format!("Failed to create connection pool: {}", e))
            })?;

        let backend = Self { pool };
        backend.migrate()?;
        Ok(backend)
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, CacheError> {
        self.pool
            .get()
            .map_err(|e| CacheError::Unavailable(format!("Failed to get connection: {}", e)))
    }

    /// Run database migrations
    fn migrate(&self) -> Result<(), CacheError> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM _migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;

            if version > current_version {
                tracing::info!("Applying cache migration {}", version);

                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

impl CacheBackend for SqliteBackend {
    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT value FROM vector_cache WHERE key = ?1 AND expires_at > ?2")?;
        let now = now_unix();

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<Vec<u8>> = match stmt.query_row(params![key, now], |row| row.get(0)) {
                Ok(v) => Some(v),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };
            values.push(value);
        }

        Ok(values)
    }

    fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.get_conn()?;
        let expires_at = now_unix() + ttl.as_secs() as i64;

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO vector_cache (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            )?;
            for (key, value) in entries {
                stmt.execute(params![key, value, expires_at])?;
            }
        }
        tx.commit()?;

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let conn = self.get_conn()?;
        let removed = conn.execute("DELETE FROM vector_cache WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    fn purge_expired(&self) -> Result<usize, CacheError> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM vector_cache WHERE expires_at <= ?1",
            params![now_unix()],
        )?;
        Ok(removed)
    }

    fn len(&self) -> Result<usize, CacheError> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vector_cache WHERE expires_at > ?1",
            params![now_unix()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// Database migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: vector cache table
    r#"
    CREATE TABLE vector_cache (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL,
        expires_at INTEGER NOT NULL
    );

    CREATE INDEX idx_vector_cache_expires_at ON vector_cache(expires_at);
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("cache.sqlite");

        let _backend = SqliteBackend::open(&db_path).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_migrations_recorded() {
        let backend = SqliteBackend::in_memory().unwrap();
        let conn = backend.get_conn().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM _migrations", [], |row| row.get(0))
            .unwrap();

        assert_eq!(version, MIGRATIONS.len() as i32);
    }

    #[test]
    fn test_reopen_keeps_entries() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("cache.sqlite");

        {
            let backend = SqliteBackend::open(&db_path).unwrap();
            backend
                .set_many(&[("k".to_string(), vec![9, 9])], Duration::from_secs(3600))
                .unwrap();
        }

        let backend = SqliteBackend::open(&db_path).unwrap();
        assert_eq!(
            backend.get_many(&["k".to_string()]).unwrap(),
            vec![Some(vec![9, 9])]
        );
    }

    #[test]
    fn test_upsert_and_delete() {
        let backend = SqliteBackend::in_memory().unwrap();
        let ttl = Duration::from_secs(3600);

        backend.set_many(&[("k".to_string(), vec![1])], ttl).unwrap();
        backend.set_many(&[("k".to_string(), vec![2])], ttl).unwrap();

        assert_eq!(backend.len().unwrap(), 1);
        assert_eq!(
            backend.get_many(&["k".to_string()]).unwrap(),
            vec![Some(vec![2])]
        );

        assert!(backend.delete("k").unwrap());
        assert_eq!(backend.get_many(&["k".to_string()]).unwrap(), vec![None]);
    }

    #[test]
    fn test_expired_entries_hidden_and_purged() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend
            .set_many(&[("old".to_string(), vec![1])], Duration::ZERO)
            .unwrap();

        assert_eq!(backend.get_many(&["old".to_string()]).unwrap(), vec![None]);
        assert_eq!(backend.purge_expired().unwrap(), 1);
    }
}
