//! Platform-tagged filesystem object identity, used as the cache key.
//!
//! `ctime` (POSIX) and creation-time (Windows) are outside user control and
//! act as inode-reuse guards: if either changes along with `(dev, ino)`
//! staying the same, the entity at that path is a different file than the
//! one the cache remembers.

use std::fs::Metadata;

/// Uniquely names a live filesystem entity for cache lookups.
#[cfg(unix)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FsObjId {
    pub device: u64,
    pub inode: u64,
    pub ctime_sec: i64,
    pub ctime_nsec: i64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

#[cfg(windows)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FsObjId {
    pub volume_serial: u64,
    pub file_index: u64,
    pub creation_time: u64,
    pub last_write_time: u64,
}

impl FsObjId {
    #[cfg(unix)]
    pub fn from_metadata(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            device: meta.dev(),
            inode: meta.ino(),
            ctime_sec: meta.ctime(),
            ctime_nsec: meta.ctime_nsec(),
            mtime_sec: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        }
    }

    #[cfg(windows)]
    pub fn from_metadata(meta: &Metadata) -> Self {
        use std::os::windows::fs::MetadataExt;
        Self {
            volume_serial: meta.volume_serial_number().unwrap_or(0) as u64,
            file_index: meta.file_index().unwrap_or(0),
            creation_time: meta.creation_time(),
            last_write_time: meta.last_write_time(),
        }
    }

    /// The `(device, inode)`-equivalent key that identifies the cache row,
    /// independent of the identity timestamps.
    #[cfg(unix)]
    pub fn cache_key(&self) -> (u64, u64) {
        (self.device, self.inode)
    }

    #[cfg(windows)]
    pub fn cache_key(&self) -> (u64, u64) {
        (self.volume_serial, self.file_index)
    }

    /// Whether the identity timestamps still match a previously cached
    /// value for the same `cache_key()`. If this is false for a matching
    /// key, the inode has been reused and the cached chunk sequence is
    /// stale.
    #[cfg(unix)]
    pub fn timestamps_match(&self, other: &FsObjId) -> bool {
        self.ctime_sec == other.ctime_sec
            && self.ctime_nsec == other.ctime_nsec
            && self.mtime_sec == other.mtime_sec
            && self.mtime_nsec == other.mtime_nsec
    }

    #[cfg(windows)]
    pub fn timestamps_match(&self, other: &FsObjId) -> bool {
        self.creation_time == other.creation_time && self.last_write_time == other.last_write_time
    }
}

#[cfg(all(test, unix))]
mod test {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn same_file_has_stable_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();
        let meta1 = fs::metadata(&path).unwrap();
        let meta2 = fs::metadata(&path).unwrap();
        let id1 = FsObjId::from_metadata(&meta1);
        let id2 = FsObjId::from_metadata(&meta2);
        assert_eq!(id1.cache_key(), id2.cache_key());
        assert!(id1.timestamps_match(&id2));
    }

    #[test]
    fn different_files_have_different_identity() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"hello").unwrap();
        fs::write(&b, b"hello").unwrap();
        let id_a = FsObjId::from_metadata(&fs::metadata(&a).unwrap());
        let id_b = FsObjId::from_metadata(&fs::metadata(&b).unwrap());
        assert_ne!(id_a.cache_key(), id_b.cache_key());
    }
}
