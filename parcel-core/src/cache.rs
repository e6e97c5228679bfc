//! Local SQLite mirror of remote records
//!
//! Each table keeps the JSON body of a record next to a `dirty` flag and the
//! local write time in milliseconds. A record is dirty while a local write has
//! not been confirmed by the remote store. The cache is never authoritative:
//! a fresh remote copy replaces a clean entry, while a dirty entry is kept
//! until it has been pushed.

use crate::model::{Package, User, collections};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache connection lock poisoned")]
    Poisoned,
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// A record type that can be mirrored in the cache
pub trait Cacheable: Serialize + DeserializeOwned + Clone {
    /// Table holding records of this type, named after its remote collection
    const TABLE: &'static str;

    /// Primary key
    fn cache_id(&self) -> &str;

    /// Secondary unique key used for lookups (tracking number, email)
    fn lookup_key(&self) -> &str;
}

impl Cacheable for Package {
    const TABLE: &'static str = collections::PACKAGES;

    fn cache_id(&self) -> &str {
        &self.id
    }

    fn lookup_key(&self) -> &str {
        &self.tracking_number
    }
}

impl Cacheable for User {
    const TABLE: &'static str = collections::USERS;

    fn cache_id(&self) -> &str {
        &self.id
    }

    fn lookup_key(&self) -> &str {
        &self.email
    }
}

/// A cached record with its synchronization metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub record: T,
    /// Written locally and not yet confirmed by the remote store
    pub dirty: bool,
    /// Local write time, strictly increasing per record
    pub updated_at_millis: i64,
}

/// Entry counts per table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub packages: u64,
    pub dirty_packages: u64,
    pub users: u64,
    pub dirty_users: u64,
}

/// SQLite-backed record cache
pub struct LocalCache {
    conn: Mutex<Connection>,
}

fn init_schema(conn: &Connection) -> CacheResult<()> {
    for table in [Package::TABLE, User::TABLE] {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                lookup_key TEXT NOT NULL,
                body TEXT NOT NULL,
                dirty INTEGER NOT NULL DEFAULT 0,
                updated_at_millis INTEGER NOT NULL
            ) WITHOUT ROWID;
            CREATE INDEX IF NOT EXISTS idx_{table}_lookup ON {table}(lookup_key);
            CREATE INDEX IF NOT EXISTS idx_{table}_dirty ON {table}(dirty);"
        ))?;
    }
    Ok(())
}

fn row_to_cached<T: Cacheable>(body: String, dirty: i64, updated_at_millis: i64) -> CacheResult<Cached<T>> {
    Ok(Cached {
        record: serde_json::from_str(&body)?,
        dirty: dirty != 0,
        updated_at_millis,
    })
}

impl LocalCache {
    /// Open or create the cache database at `path` (WAL mode).
    pub fn open(path: &Path) -> CacheResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        init_schema(&conn)?;
        tracing::debug!("Opened local cache at {:?}", path);
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Cache that lives only as long as this value.
    pub fn in_memory() -> CacheResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> CacheResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CacheError::Poisoned)
    }

    /// Insert or replace a record and return the stored entry.
    ///
    /// The write time is bumped past the previous one so that
    /// [`mark_clean`](Self::mark_clean) can tell whether a record changed
    /// while its push was in flight.
    pub fn put<T: Cacheable>(&self, record: &T, dirty: bool) -> CacheResult<Cached<T>> {
        let conn = self.conn()?;
        let previous: Option<i64> = conn
            .query_row(
                &format!("SELECT updated_at_millis FROM {} WHERE id=?1", T::TABLE),
                params![record.cache_id()],
                |r| r.get(0),
            )
            .optional()?;
        let now = chrono::Utc::now().timestamp_millis();
        let updated_at_millis = match previous {
            Some(prev) if prev >= now => prev + 1,
            _ => now,
        };

        conn.execute(
            &format!(
                "INSERT INTO {} (id,lookup_key,body,dirty,updated_at_millis) VALUES (?1,?2,?3,?4,?5) \
                 ON CONFLICT(id) DO UPDATE SET lookup_key=excluded.lookup_key,body=excluded.body,\
                 dirty=excluded.dirty,updated_at_millis=excluded.updated_at_millis",
                T::TABLE
            ),
            params![
                record.cache_id(),
                record.lookup_key(),
                serde_json::to_string(record)?,
                dirty as i64,
                updated_at_millis
            ],
        )?;

        Ok(Cached {
            record: record.clone(),
            dirty,
            updated_at_millis,
        })
    }

    pub fn get<T: Cacheable>(&self, id: &str) -> CacheResult<Option<Cached<T>>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT body,dirty,updated_at_millis FROM {} WHERE id=?1", T::TABLE),
                params![id],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?)),
            )
            .optional()?;
        row.map(|(body, dirty, ts)| row_to_cached(body, dirty, ts)).transpose()
    }

    /// Look a record up by its secondary key.
    pub fn find<T: Cacheable>(&self, lookup_key: &str) -> CacheResult<Option<Cached<T>>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT body,dirty,updated_at_millis FROM {} WHERE lookup_key=?1 \
                     ORDER BY updated_at_millis DESC LIMIT 1",
                    T::TABLE
                ),
                params![lookup_key],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?)),
            )
            .optional()?;
        row.map(|(body, dirty, ts)| row_to_cached(body, dirty, ts)).transpose()
    }

    /// Every cached record, ordered by id.
    pub fn all<T: Cacheable>(&self) -> CacheResult<Vec<Cached<T>>> {
        self.select(
            &format!("SELECT body,dirty,updated_at_millis FROM {} ORDER BY id ASC", T::TABLE),
            None,
        )
    }

    /// Dirty records, oldest write first.
    pub fn dirty<T: Cacheable>(&self, limit: usize) -> CacheResult<Vec<Cached<T>>> {
        self.select(
            &format!(
                "SELECT body,dirty,updated_at_millis FROM {} WHERE dirty=1 \
                 ORDER BY updated_at_millis ASC, id ASC LIMIT ?1",
                T::TABLE
            ),
            Some(limit as i64),
        )
    }

    fn select<T: Cacheable>(&self, sql: &str, limit: Option<i64>) -> CacheResult<Vec<Cached<T>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = match limit {
            Some(limit) => stmt.query(params![limit])?,
            None => stmt.query([])?,
        };
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_cached(row.get(0)?, row.get(1)?, row.get(2)?)?);
        }
        Ok(out)
    }

    /// Clear the dirty flag if the record was not rewritten since `written_at`.
    ///
    /// Returns `false` when a newer local write exists; that write stays dirty.
    pub fn mark_clean<T: Cacheable>(&self, id: &str, written_at: i64) -> CacheResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!("UPDATE {} SET dirty=0 WHERE id=?1 AND updated_at_millis=?2", T::TABLE),
            params![id, written_at],
        )?;
        Ok(changed > 0)
    }

    pub fn remove<T: Cacheable>(&self, id: &str) -> CacheResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(&format!("DELETE FROM {} WHERE id=?1", T::TABLE), params![id])?;
        Ok(changed > 0)
    }

    /// Fold a freshly fetched remote record into the cache.
    ///
    /// Remote wins over a clean entry. A dirty entry is kept and returned
    /// instead, since it holds a local write the remote has not seen yet.
    pub fn merge_remote<T: Cacheable>(&self, remote: T) -> CacheResult<T> {
        if let Some(local) = self.get::<T>(remote.cache_id())? {
            if local.dirty {
                return Ok(local.record);
            }
        }
        self.put(&remote, false)?;
        Ok(remote)
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        let conn = self.conn()?;
        let count = |table: &str, dirty_only: bool| -> CacheResult<u64> {
            let sql = if dirty_only {
                format!("SELECT COUNT(*) FROM {} WHERE dirty=1", table)
            } else {
                format!("SELECT COUNT(*) FROM {}", table)
            };
            let n: i64 = conn.query_row(&sql, [], |r| r.get(0))?;
            Ok(n as u64)
        };
        Ok(CacheStats {
            packages: count(Package::TABLE, false)?,
            dirty_packages: count(Package::TABLE, true)?,
            users: count(User::TABLE, false)?,
            dirty_users: count(User::TABLE, true)?,
        })
    }
}
