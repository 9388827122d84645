//! The local FS cache: an embedded SQLite database mapping a filesystem
//! object's `(dev, ino)`-equivalent key to its last-seen identity
//! timestamps, uploaded chunk sequence, and subtree size.
//!
//! Writes are grouped into transactions that auto-commit every
//! `TXN_GROUP_PERIOD` to amortize fsync cost; a crash loses at most that
//! window of cache updates, never uploaded data (chunks are always
//! acknowledged by the server before the cache row is written).

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::backup::codec::ChunkSeq;
use crate::backup::fsobjid::FsObjId;
use crate::hash::Sha256Digest;

pub const TXN_GROUP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("cache row corrupt: hash blob length {0} is not a multiple of 32")]
    Corrupt(usize),
}

/// A cache row's in-memory representation. `cache_row_id` is `None` exactly
/// when the object has never been inserted.
#[derive(Clone, Debug, PartialEq)]
pub struct CObject {
    pub cache_row_id: Option<i64>,
    pub fs_obj_id: FsObjId,
    pub chunk_seq: ChunkSeq,
    pub subtree_size_bytes: u64,
}

struct Inner {
    conn: Connection,
    txn_open: bool,
    txn_started_at: Instant,
}

pub struct FsCache {
    inner: Mutex<Inner>,
}

impl FsCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS objs (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                dev          INTEGER NOT NULL,
                ino          INTEGER NOT NULL,
                ctime_s      INTEGER NOT NULL,
                ctime_ns     INTEGER NOT NULL,
                mtime_s      INTEGER NOT NULL,
                mtime_ns     INTEGER NOT NULL,
                hash_blob    BLOB,
                subtree_size INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS objs_di_ndx ON objs(dev, ino);",
        )?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                txn_open: false,
                txn_started_at: Instant::now(),
            }),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::open(":memory:")
    }

    /// Returns `None` unless a row with a matching key exists with every
    /// identity timestamp equal to `id`'s. If a row exists for the key but
    /// timestamps differ (inode reuse), `None` is still returned, but the
    /// caller can find the existing row id via `find_row_id` to decide
    /// `update` instead of `insert`.
    pub fn read(&self, id: &FsObjId) -> Result<Option<CObject>, CacheError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_txn()?;
        let (key0, key1) = id.cache_key();

        let row = inner
            .conn
            .query_row(
                "SELECT id, ctime_s, ctime_ns, mtime_s, mtime_ns, hash_blob, subtree_size
                 FROM objs WHERE dev = ?1 AND ino = ?2",
                params![key0 as i64, key1 as i64],
                |row| {
                    let id: i64 = row.get(0)?;
                    let ctime_s: i64 = row.get(1)?;
                    let ctime_ns: i64 = row.get(2)?;
                    let mtime_s: i64 = row.get(3)?;
                    let mtime_ns: i64 = row.get(4)?;
                    let hash_blob: Vec<u8> = row.get(5)?;
                    let subtree_size: i64 = row.get(6)?;
                    Ok((id, ctime_s, ctime_ns, mtime_s, mtime_ns, hash_blob, subtree_size))
                },
            )
            .optional()?;

        let (row_id, ctime_s, ctime_ns, mtime_s, mtime_ns, hash_blob, subtree_size) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        if hash_blob.len() % 32 != 0 {
            return Err(CacheError::Corrupt(hash_blob.len()));
        }

        let stored = reconstruct_fs_obj_id(id, ctime_s, ctime_ns, mtime_s, mtime_ns);
        if !id.timestamps_match(&stored) {
            return Ok(None);
        }

        let chunk_seq = hash_blob
            .chunks(32)
            .map(|c| Sha256Digest::parse_raw(c).expect("chunked into 32-byte groups"))
            .collect();

        Ok(Some(CObject {
            cache_row_id: Some(row_id),
            fs_obj_id: *id,
            chunk_seq,
            subtree_size_bytes: subtree_size as u64,
        }))
    }

    /// Looks up the row id for a key regardless of whether the identity
    /// timestamps still match, so a caller that got `None` from `read` can
    /// tell an `insert` (brand new key) from an `update` (stale row).
    pub fn find_row_id(&self, id: &FsObjId) -> Result<Option<i64>, CacheError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_txn()?;
        let (key0, key1) = id.cache_key();
        let row_id = inner
            .conn
            .query_row(
                "SELECT id FROM objs WHERE dev = ?1 AND ino = ?2",
                params![key0 as i64, key1 as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row_id)
    }

    /// `INSERT OR IGNORE` on the `(dev, ino)` key: concurrent discovery of
    /// the same newly-created inode by two workers must never abort either
    /// one. Whichever wins, the row is correct or will be corrected on the
    /// next run.
    pub fn insert(&self, cobj: &CObject) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_txn()?;
        let (key0, key1) = cobj.fs_obj_id.cache_key();
        let (ctime_s, ctime_ns, mtime_s, mtime_ns) = timestamp_fields(&cobj.fs_obj_id);
        let hash_blob = serialize_chunk_seq(&cobj.chunk_seq);

        inner.conn.execute(
            "INSERT OR IGNORE INTO objs
                (dev, ino, ctime_s, ctime_ns, mtime_s, mtime_ns, hash_blob, subtree_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                key0 as i64,
                key1 as i64,
                ctime_s,
                ctime_ns,
                mtime_s,
                mtime_ns,
                hash_blob,
                cobj.subtree_size_bytes as i64
            ],
        )?;
        inner.record_write()
    }

    /// Replaces timestamps, hash blob and subtree size for an existing row
    /// by id. The `(dev, ino)` pair is assumed invariant for a given row id.
    pub fn update(&self, row_id: i64, cobj: &CObject) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_txn()?;
        let (ctime_s, ctime_ns, mtime_s, mtime_ns) = timestamp_fields(&cobj.fs_obj_id);
        let hash_blob = serialize_chunk_seq(&cobj.chunk_seq);

        inner.conn.execute(
            "UPDATE objs SET ctime_s = ?1, ctime_ns = ?2, mtime_s = ?3, mtime_ns = ?4,
                hash_blob = ?5, subtree_size = ?6 WHERE id = ?7",
            params![ctime_s, ctime_ns, mtime_s, mtime_ns, hash_blob, cobj.subtree_size_bytes as i64, row_id],
        )?;
        inner.record_write()
    }

    /// Commits any open transaction and closes out the grouped-commit
    /// window. The next read/insert/update transparently reopens one.
    pub fn quiesce(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().unwrap();
        inner.commit_if_open()
    }
}

impl Inner {
    fn ensure_txn(&mut self) -> Result<(), CacheError> {
        if !self.txn_open {
            self.conn.execute_batch("BEGIN")?;
            self.txn_open = true;
            self.txn_started_at = Instant::now();
        }
        Ok(())
    }

    fn record_write(&mut self) -> Result<(), CacheError> {
        if self.txn_started_at.elapsed() >= TXN_GROUP_PERIOD {
            self.commit_if_open()?;
        }
        Ok(())
    }

    fn commit_if_open(&mut self) -> Result<(), CacheError> {
        if self.txn_open {
            self.conn.execute_batch("COMMIT")?;
            self.txn_open = false;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn timestamp_fields(id: &FsObjId) -> (i64, i64, i64, i64) {
    (id.ctime_sec, id.ctime_nsec, id.mtime_sec, id.mtime_nsec)
}

#[cfg(windows)]
fn timestamp_fields(id: &FsObjId) -> (i64, i64, i64, i64) {
    (id.creation_time as i64, 0, id.last_write_time as i64, 0)
}

#[cfg(unix)]
fn reconstruct_fs_obj_id(template: &FsObjId, ctime_s: i64, ctime_ns: i64, mtime_s: i64, mtime_ns: i64) -> FsObjId {
    FsObjId {
        device: template.device,
        inode: template.inode,
        ctime_sec: ctime_s,
        ctime_nsec: ctime_ns,
        mtime_sec: mtime_s,
        mtime_nsec: mtime_ns,
    }
}

#[cfg(windows)]
fn reconstruct_fs_obj_id(template: &FsObjId, ctime_s: i64, _ctime_ns: i64, mtime_s: i64, _mtime_ns: i64) -> FsObjId {
    FsObjId {
        volume_serial: template.volume_serial,
        file_index: template.file_index,
        creation_time: ctime_s as u64,
        last_write_time: mtime_s as u64,
    }
}

fn serialize_chunk_seq(seq: &ChunkSeq) -> Vec<u8> {
    let mut out = Vec::with_capacity(seq.len() * 32);
    for digest in seq {
        out.extend_from_slice(digest.as_bytes());
    }
    out
}

#[cfg(all(test, unix))]
mod test {
    use super::*;

    fn obj_id(dev: u64, ino: u64, ctime: i64, mtime: i64) -> FsObjId {
        FsObjId {
            device: dev,
            inode: ino,
            ctime_sec: ctime,
            ctime_nsec: 0,
            mtime_sec: mtime,
            mtime_nsec: 0,
        }
    }

    #[test]
    fn miss_on_unknown_key() {
        let cache = FsCache::open_in_memory().unwrap();
        let id = obj_id(1, 2, 100, 100);
        assert!(cache.read(&id).unwrap().is_none());
    }

    #[test]
    fn insert_then_read_hits() {
        let cache = FsCache::open_in_memory().unwrap();
        let id = obj_id(1, 2, 100, 100);
        let cobj = CObject {
            cache_row_id: None,
            fs_obj_id: id,
            chunk_seq: vec![Sha256Digest::hash(b"x")],
            subtree_size_bytes: 42,
        };
        cache.insert(&cobj).unwrap();
        let found = cache.read(&id).unwrap().unwrap();
        assert_eq!(found.chunk_seq, cobj.chunk_seq);
        assert_eq!(found.subtree_size_bytes, 42);
        assert!(found.cache_row_id.is_some());
    }

    #[test]
    fn stale_timestamps_miss_but_row_id_found() {
        let cache = FsCache::open_in_memory().unwrap();
        let id_v1 = obj_id(1, 2, 100, 100);
        let cobj = CObject {
            cache_row_id: None,
            fs_obj_id: id_v1,
            chunk_seq: vec![Sha256Digest::hash(b"x")],
            subtree_size_bytes: 42,
        };
        cache.insert(&cobj).unwrap();

        let id_v2 = obj_id(1, 2, 200, 200);
        assert!(cache.read(&id_v2).unwrap().is_none());
        let row_id = cache.find_row_id(&id_v2).unwrap().expect("row still exists by key");

        let replaced = CObject {
            cache_row_id: Some(row_id),
            fs_obj_id: id_v2,
            chunk_seq: vec![Sha256Digest::hash(b"y")],
            subtree_size_bytes: 99,
        };
        cache.update(row_id, &replaced).unwrap();

        let found = cache.read(&id_v2).unwrap().unwrap();
        assert_eq!(found.subtree_size_bytes, 99);
    }

    #[test]
    fn concurrent_insert_of_same_key_does_not_error() {
        let cache = FsCache::open_in_memory().unwrap();
        let id = obj_id(1, 2, 100, 100);
        let first = CObject {
            cache_row_id: None,
            fs_obj_id: id,
            chunk_seq: vec![Sha256Digest::hash(b"first")],
            subtree_size_bytes: 1,
        };
        let second = CObject {
            cache_row_id: None,
            fs_obj_id: id,
            chunk_seq: vec![Sha256Digest::hash(b"second")],
            subtree_size_bytes: 2,
        };
        cache.insert(&first).unwrap();
        cache.insert(&second).unwrap();
        // whichever won, there is exactly one row and it's still readable.
        assert!(cache.read(&id).unwrap().is_some());
    }
}
