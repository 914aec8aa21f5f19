//! SQLite-backed metadata repository.
//!
//! One connection guarded by a mutex; WAL journaling so readers of the
//! database file from other processes are not blocked by a running scan.
//! Paths are stored as lossy UTF-8 text.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use super::{DuplicateSet, FileRecord, MetadataRepository, StoreError};
use crate::hasher::{hash_to_hex, hex_to_hash, Hash};
use crate::scanner::FileId;

/// Metadata repository stored in a SQLite database.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRepository").finish_non_exhaustive()
    }
}

/// Row of `file_record` before paths are attached.
struct RecordRow {
    ino: i64,
    size: i64,
    nlink: i64,
    atime: DateTime<Utc>,
    mtime: DateTime<Utc>,
    ctime: DateTime<Utc>,
    hash: Option<String>,
}

// Inode numbers and sizes are stored bit-for-bit in SQLite's signed integers.
#[allow(clippy::cast_possible_wrap)]
fn to_sql(value: u64) -> i64 {
    value as i64
}

#[allow(clippy::cast_sign_loss)]
fn from_sql(value: i64) -> u64 {
    value as u64
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl SqliteRepository {
    /// Open (creating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory cannot be created or the
    /// database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        log::debug!("Opened metadata database at {}", path.display());
        Self::init(conn)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(include_str!("schema.sql"))?;
        log::trace!("Metadata schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load(conn: &Connection, ino: i64) -> Result<Option<FileRecord>, StoreError> {
        let row = conn
            .query_row(
                "SELECT ino, size, nlink, atime, mtime, ctime, hash
                 FROM file_record WHERE ino = ?1",
                params![ino],
                |row| {
                    Ok(RecordRow {
                        ino: row.get(0)?,
                        size: row.get(1)?,
                        nlink: row.get(2)?,
                        atime: row.get(3)?,
                        mtime: row.get(4)?,
                        ctime: row.get(5)?,
                        hash: row.get(6)?,
                    })
                },
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };

        let id = FileId(from_sql(row.ino));
        let hash = match row.hash {
            Some(hex) => Some(hex_to_hash(&hex).ok_or_else(|| StoreError::Corrupt {
                id,
                reason: format!("invalid hash '{hex}'"),
            })?),
            None => None,
        };

        let mut stmt = conn.prepare_cached(
            "SELECT path, share FROM file_path WHERE ino = ?1 ORDER BY position",
        )?;
        let (paths, shares): (Vec<PathBuf>, Vec<Option<String>>) = stmt
            .query_map(params![ino], |r| {
                Ok((PathBuf::from(r.get::<_, String>(0)?), r.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .unzip();

        if paths.is_empty() {
            return Err(StoreError::Corrupt {
                id,
                reason: "record has no paths".to_string(),
            });
        }

        Ok(Some(FileRecord::from_parts(
            id,
            paths,
            shares,
            from_sql(row.size),
            from_sql(row.nlink),
            [row.atime, row.mtime, row.ctime],
            hash,
        )))
    }

    fn load_ids(conn: &Connection, inos: Vec<i64>) -> Result<Vec<FileRecord>, StoreError> {
        let mut records = Vec::with_capacity(inos.len());
        for ino in inos {
            if let Some(record) = Self::load(conn, ino)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn query_ids<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<i64>, StoreError> {
        let mut stmt = conn.prepare_cached(sql)?;
        let ids = stmt
            .query_map(params, |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    fn save_in(tx: &Transaction<'_>, record: &FileRecord) -> Result<(), StoreError> {
        if record.paths.is_empty() {
            return Err(StoreError::EmptyRecord(record.id));
        }
        let ino = to_sql(record.id.0);

        tx.execute(
            "INSERT INTO file_record (ino, size, nlink, atime, mtime, ctime, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(ino) DO UPDATE SET
                size = excluded.size, nlink = excluded.nlink,
                atime = excluded.atime, mtime = excluded.mtime,
                ctime = excluded.ctime, hash = excluded.hash",
            params![
                ino,
                to_sql(record.size),
                to_sql(record.nlink),
                record.atime,
                record.mtime,
                record.ctime,
                record.hash.as_ref().map(hash_to_hex),
            ],
        )?;

        // Paths owned by other records move here.
        let mut displaced = Vec::new();
        for path in &record.paths {
            let owner: Option<i64> = tx
                .query_row(
                    "SELECT ino FROM file_path WHERE path = ?1 AND ino != ?2",
                    params![path_text(path), ino],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(owner) = owner {
                log::debug!(
                    "Path {} moves from ino {} to {}",
                    path.display(),
                    owner,
                    record.id
                );
                displaced.push(owner);
            }
        }

        tx.execute("DELETE FROM file_path WHERE ino = ?1", params![ino])?;
        for (position, (path, share)) in record.paths.iter().zip(record.shares()).enumerate() {
            let text = path_text(path);
            tx.execute("DELETE FROM file_path WHERE path = ?1", params![text])?;
            tx.execute(
                "INSERT INTO file_path (path, ino, position, share) VALUES (?1, ?2, ?3, ?4)",
                params![text, ino, position as i64, share],
            )?;
        }

        for owner in displaced {
            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM file_path WHERE ino = ?1",
                params![owner],
                |row| row.get(0),
            )?;
            if remaining == 0 {
                tx.execute("DELETE FROM file_record WHERE ino = ?1", params![owner])?;
                log::debug!("Deleted ino {} after its last path moved away", owner);
            }
        }

        Ok(())
    }
}

impl MetadataRepository for SqliteRepository {
    fn get(&self, id: FileId) -> Result<Option<FileRecord>, StoreError> {
        let conn = self.conn.lock();
        Self::load(&conn, to_sql(id.0))
    }

    fn find_by_size(&self, size: u64) -> Result<Vec<FileRecord>, StoreError> {
        let conn = self.conn.lock();
        let ids = Self::query_ids(
            &conn,
            "SELECT ino FROM file_record WHERE size = ?1 ORDER BY ino",
            params![to_sql(size)],
        )?;
        Self::load_ids(&conn, ids)
    }

    fn find_by_path(&self, path: &Path) -> Result<Option<FileRecord>, StoreError> {
        let conn = self.conn.lock();
        let ino: Option<i64> = conn
            .query_row(
                "SELECT ino FROM file_path WHERE path = ?1",
                params![path_text(path)],
                |row| row.get(0),
            )
            .optional()?;
        match ino {
            Some(ino) => Self::load(&conn, ino),
            None => Ok(None),
        }
    }

    fn save(&self, record: &FileRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::save_in(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn save_all(&self, records: &[FileRecord]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for record in records {
            Self::save_in(&tx, record)?;
        }
        tx.commit()?;
        log::trace!("Saved {} records", records.len());
        Ok(())
    }

    fn delete(&self, id: FileId) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM file_record WHERE ino = ?1",
            params![to_sql(id.0)],
        )?;
        Ok(changed > 0)
    }

    fn find_with_multiple_paths(&self) -> Result<Vec<FileRecord>, StoreError> {
        let conn = self.conn.lock();
        let ids = Self::query_ids(
            &conn,
            "SELECT ino FROM file_path GROUP BY ino HAVING COUNT(*) > 1 ORDER BY ino",
            [],
        )?;
        Self::load_ids(&conn, ids)
    }

    fn find_duplicate_sets(&self) -> Result<Vec<DuplicateSet>, StoreError> {
        let conn = self.conn.lock();
        let hashes: Vec<String> = {
            let mut stmt = conn.prepare_cached(
                "SELECT hash FROM file_record WHERE hash IS NOT NULL
                 GROUP BY hash HAVING COUNT(*) > 1 ORDER BY hash",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut sets = Vec::with_capacity(hashes.len());
        for hex in hashes {
            let ids = Self::query_ids(
                &conn,
                "SELECT ino FROM file_record WHERE hash = ?1 ORDER BY ino",
                params![hex],
            )?;
            let records = Self::load_ids(&conn, ids)?;
            let Some(first) = records.first() else {
                continue;
            };
            let (Some(hash), size) = (first.hash, first.size) else {
                continue;
            };
            let keep: Option<i64> = conn
                .query_row(
                    "SELECT ino FROM keep_designation WHERE hash = ?1",
                    params![hex],
                    |row| row.get(0),
                )
                .optional()?;
            let keep = keep
                .map(|ino| FileId(from_sql(ino)))
                .filter(|id| records.iter().any(|r| r.id == *id));
            sets.push(DuplicateSet {
                hash,
                size,
                records,
                keep,
            });
        }
        Ok(sets)
    }

    fn designate_keep(&self, hash: &Hash, id: FileId) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO keep_designation (hash, ino) VALUES (?1, ?2)
             ON CONFLICT(hash) DO UPDATE SET ino = excluded.ino",
            params![hash_to_hex(hash), to_sql(id.0)],
        )?;
        Ok(())
    }

    fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM file_record", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
