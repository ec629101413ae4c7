//! # Offwave Store
//!
//! SQLite-backed generational cache store. Maps a canonicalized request
//! identity to a response payload plus a headers subset, grouped into
//! immutable generations. One generation is "current" at a time; the
//! marker is persisted so a restarted worker resumes where it left off.
//!
//! Promotion (marker swap + purge of every other generation) runs in a
//! single transaction, so readers never observe a half-purged state.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use url::Url;

use offwave_core::{OffwaveError, OffwaveResult};

/// Identifier naming one immutable snapshot of cached assets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationId(String);

impl GenerationId {
    /// Create a generation identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GenerationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonicalized request identity: upper-cased method plus the URL with
/// its fragment stripped. Query strings are preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey(String);

impl EntryKey {
    /// Canonicalize a method/URL pair into a key.
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("{} {}", method.to_ascii_uppercase(), url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached response. Immutable once written; updates land under a new
/// generation rather than mutating in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Response status.
    pub status: u16,

    /// Subset of response headers worth replaying (content-type etc.).
    pub headers: Vec<(String, String)>,

    /// Response payload.
    pub body: Vec<u8>,

    /// Unix timestamp (seconds) the entry was stored.
    pub stored_at: i64,
}

impl StoredEntry {
    /// Create an entry stamped with the current time.
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            stored_at: unix_now(),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Persistent generational cache store.
pub struct CacheStore {
    conn: Connection,
    max_bytes: Option<u64>,
}

impl CacheStore {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(db_path: P, max_bytes: Option<u64>) -> OffwaveResult<Self> {
        info!("Opening cache store at {:?}", db_path.as_ref());
        let conn = Connection::open(db_path)
            .map_err(|e| OffwaveError::storage(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn, max_bytes)
    }

    /// Open an in-memory store. Nothing survives drop; test use only.
    pub fn open_in_memory(max_bytes: Option<u64>) -> OffwaveResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| OffwaveError::storage(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn, max_bytes)
    }

    fn with_connection(conn: Connection, max_bytes: Option<u64>) -> OffwaveResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS generations (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| db_err("create generations table", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS entries (
                generation TEXT NOT NULL REFERENCES generations(id),
                key TEXT NOT NULL,
                status INTEGER NOT NULL,
                headers TEXT NOT NULL,
                body BLOB NOT NULL,
                stored_at INTEGER NOT NULL,
                PRIMARY KEY (generation, key)
            )",
            [],
        )
        .map_err(|e| db_err("create entries table", e))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(key)",
            [],
        )
        .map_err(|e| db_err("create key index", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS store_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                current_generation TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| db_err("create meta table", e))?;

        Ok(Self { conn, max_bytes })
    }

    /// Register a generation so it is listed even before entries land.
    pub fn ensure_generation(&mut self, generation: &GenerationId) -> OffwaveResult<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO generations (id, created_at) VALUES (?1, ?2)",
                params![generation.as_str(), unix_now()],
            )
            .map_err(|e| db_err("register generation", e))?;
        Ok(())
    }

    /// Store an entry. Overwrites only the same key within the same
    /// generation. The whole entry lands in one statement, so a reader
    /// sees either all of it or none of it.
    pub fn put(
        &mut self,
        generation: &GenerationId,
        key: &EntryKey,
        entry: &StoredEntry,
    ) -> OffwaveResult<()> {
        self.check_budget(generation, key, entry.body.len() as u64)?;
        self.ensure_generation(generation)?;

        let headers = serde_json::to_string(&entry.headers)
            .map_err(|e| OffwaveError::storage(format!("Failed to encode headers: {}", e)))?;

        self.conn
            .execute(
                "INSERT OR REPLACE INTO entries
                    (generation, key, status, headers, body, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    generation.as_str(),
                    key.as_str(),
                    entry.status,
                    headers,
                    entry.body,
                    entry.stored_at,
                ],
            )
            .map_err(|e| db_err("store entry", e))?;

        debug!(generation = %generation, key = %key, bytes = entry.body.len(), "Stored entry");
        Ok(())
    }

    /// Look up an entry within one generation. Miss is `None`.
    pub fn get(
        &self,
        generation: &GenerationId,
        key: &EntryKey,
    ) -> OffwaveResult<Option<StoredEntry>> {
        self.conn
            .query_row(
                "SELECT status, headers, body, stored_at FROM entries
                 WHERE generation = ?1 AND key = ?2",
                params![generation.as_str(), key.as_str()],
                row_to_entry,
            )
            .optional()
            .map_err(|e| db_err("read entry", e))?
            .transpose()
    }

    /// Fallback lookup: the current generation first (when there is one),
    /// else the most recently created prior generation holding the key.
    pub fn get_any(
        &self,
        key: &EntryKey,
        current: Option<&GenerationId>,
    ) -> OffwaveResult<Option<(GenerationId, StoredEntry)>> {
        if let Some(current) = current {
            if let Some(entry) = self.get(current, key)? {
                return Ok(Some((current.clone(), entry)));
            }
        }

        // An empty exclusion string never matches a real generation id.
        let excluded = current.map(|g| g.as_str()).unwrap_or_default();
        self.conn
            .query_row(
                "SELECT e.generation, e.status, e.headers, e.body, e.stored_at
                 FROM entries e JOIN generations g ON g.id = e.generation
                 WHERE e.key = ?1 AND e.generation != ?2
                 ORDER BY g.created_at DESC, e.rowid DESC LIMIT 1",
                params![key.as_str(), excluded],
                |row| {
                    let generation: String = row.get(0)?;
                    let status: u16 = row.get(1)?;
                    let headers: String = row.get(2)?;
                    let body: Vec<u8> = row.get(3)?;
                    let stored_at: i64 = row.get(4)?;
                    Ok((generation, status, headers, body, stored_at))
                },
            )
            .optional()
            .map_err(|e| db_err("read fallback entry", e))?
            .map(|(generation, status, headers, body, stored_at)| {
                let headers = decode_headers(&headers)?;
                Ok((
                    GenerationId::new(generation),
                    StoredEntry {
                        status,
                        headers,
                        body,
                        stored_at,
                    },
                ))
            })
            .transpose()
    }

    /// Atomically remove a generation and all of its entries.
    pub fn delete_generation(&mut self, generation: &GenerationId) -> OffwaveResult<()> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| db_err("begin delete", e))?;

        tx.execute(
            "DELETE FROM entries WHERE generation = ?1",
            params![generation.as_str()],
        )
        .map_err(|e| db_err("delete entries", e))?;
        tx.execute(
            "DELETE FROM generations WHERE id = ?1",
            params![generation.as_str()],
        )
        .map_err(|e| db_err("delete generation", e))?;

        tx.commit().map_err(|e| db_err("commit delete", e))?;
        info!(generation = %generation, "Deleted generation");
        Ok(())
    }

    /// All known generation identifiers, oldest first.
    pub fn list_generations(&self) -> OffwaveResult<Vec<GenerationId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM generations ORDER BY created_at ASC, id ASC")
            .map_err(|e| db_err("list generations", e))?;

        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| db_err("list generations", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| db_err("list generations", e))?;

        Ok(ids.into_iter().map(GenerationId::new).collect())
    }

    /// The persisted current-generation marker, if one was ever promoted.
    pub fn current_generation(&self) -> OffwaveResult<Option<GenerationId>> {
        self.conn
            .query_row(
                "SELECT current_generation FROM store_meta WHERE id = 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| db_err("read marker", e))
            .map(|id| id.map(GenerationId::new))
    }

    /// Swap the current-generation marker to `generation` and purge every
    /// other generation, as one transaction. No reader observes the old
    /// marker with a missing generation or a half-deleted one.
    pub fn promote(&mut self, generation: &GenerationId) -> OffwaveResult<()> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| db_err("begin promote", e))?;

        tx.execute(
            "INSERT OR IGNORE INTO generations (id, created_at) VALUES (?1, ?2)",
            params![generation.as_str(), unix_now()],
        )
        .map_err(|e| db_err("register generation", e))?;

        tx.execute(
            "INSERT INTO store_meta (id, current_generation, updated_at)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                current_generation = excluded.current_generation,
                updated_at = excluded.updated_at",
            params![generation.as_str(), unix_now()],
        )
        .map_err(|e| db_err("swap marker", e))?;

        tx.execute(
            "DELETE FROM entries WHERE generation != ?1",
            params![generation.as_str()],
        )
        .map_err(|e| db_err("purge entries", e))?;
        tx.execute(
            "DELETE FROM generations WHERE id != ?1",
            params![generation.as_str()],
        )
        .map_err(|e| db_err("purge generations", e))?;

        tx.commit().map_err(|e| db_err("commit promote", e))?;
        info!(generation = %generation, "Promoted generation");
        Ok(())
    }

    /// Delete the oldest generation other than `keep`. Returns the id of
    /// the evicted generation, or `None` if there was nothing to evict.
    pub fn evict_oldest_prior(
        &mut self,
        keep: &GenerationId,
    ) -> OffwaveResult<Option<GenerationId>> {
        let victim = self
            .conn
            .query_row(
                "SELECT id FROM generations WHERE id != ?1
                 ORDER BY created_at ASC, id ASC LIMIT 1",
                params![keep.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| db_err("find eviction victim", e))?;

        match victim {
            Some(id) => {
                let id = GenerationId::new(id);
                warn!(generation = %id, "Evicting generation to reclaim space");
                self.delete_generation(&id)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Total stored payload bytes across all generations.
    pub fn total_bytes(&self) -> OffwaveResult<u64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(LENGTH(body)), 0) FROM entries",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(|e| db_err("sum bytes", e))
    }

    /// Number of entries in one generation.
    pub fn count(&self, generation: &GenerationId) -> OffwaveResult<usize> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM entries WHERE generation = ?1",
                params![generation.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(|e| db_err("count entries", e))
    }

    /// Reject a put up front when it would blow the byte budget. An
    /// overwrite reclaims the old body, so that size is credited back.
    fn check_budget(
        &self,
        generation: &GenerationId,
        key: &EntryKey,
        incoming: u64,
    ) -> OffwaveResult<()> {
        let Some(max_bytes) = self.max_bytes else {
            return Ok(());
        };

        let existing: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(LENGTH(body), 0) FROM entries
                 WHERE generation = ?1 AND key = ?2",
                params![generation.as_str(), key.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("read entry size", e))?
            .unwrap_or(0);

        let projected = self.total_bytes()? - existing as u64 + incoming;
        if projected > max_bytes {
            return Err(OffwaveError::quota(format!(
                "{} bytes would exceed budget of {} bytes",
                projected, max_bytes
            )));
        }
        Ok(())
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OffwaveResult<StoredEntry>> {
    let status: u16 = row.get(0)?;
    let headers: String = row.get(1)?;
    let body: Vec<u8> = row.get(2)?;
    let stored_at: i64 = row.get(3)?;
    Ok(decode_headers(&headers).map(|headers| StoredEntry {
        status,
        headers,
        body,
        stored_at,
    }))
}

fn decode_headers(json: &str) -> OffwaveResult<Vec<(String, String)>> {
    serde_json::from_str(json)
        .map_err(|e| OffwaveError::storage(format!("Corrupt headers column: {}", e)))
}

/// Map rusqlite failures to the store's error kinds. SQLITE_FULL is the
/// platform quota signal and must surface distinctly.
fn db_err(context: &str, e: rusqlite::Error) -> OffwaveError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::DiskFull {
            return OffwaveError::quota(format!("Failed to {}: {}", context, e));
        }
    }
    OffwaveError::storage(format!("Failed to {}: {}", context, e))
}
