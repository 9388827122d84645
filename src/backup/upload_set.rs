//! Coordinates one [`Upload`] engine per configured backup root: fans out
//! change events to the engine that owns the affected root, and on every
//! root snapshot composes the per-root digests into a meta-root chunk so the
//! device has a single snapshot record spanning all its backed-up volumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;

use crate::backup::cache::FsCache;
use crate::backup::codec::{self, ChildEntry, FileAttrFlags, Owner};
use crate::backup::upload::{BackupKind, ThreadStatus, Upload};
use crate::backup::watch::DirectoryMonitor;
use crate::client::{ObjectStoreClient, Presence};

type Filter = dyn Fn(&Path) -> bool + Send + Sync;

/// Owns every [`Upload`] engine for one device and serializes the meta-root
/// commit that follows each of their snapshots.
///
/// Configuration methods (`set_workers`/`set_filter`/`set_monitor`) must be
/// called before `add_upload_root`, the same way `Upload`'s own builder
/// methods must run before it is wrapped in an `Arc` — each new root's
/// engine is built with whatever configuration is current at the time it's
/// added.
pub struct UploadSetManager {
    self_ref: Weak<UploadSetManager>,
    cache: Arc<FsCache>,
    store: ObjectStoreClient,
    device_name: String,

    filter: Mutex<Option<Arc<Filter>>>,
    nworkers: AtomicUsize,
    monitor: Mutex<Option<Arc<dyn DirectoryMonitor>>>,

    roots: Mutex<Vec<Arc<Upload>>>,
    by_path: Mutex<HashMap<PathBuf, Arc<Upload>>>,

    snapshot_lock: Mutex<()>,
    progress_notify: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    snapshot_notify: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl UploadSetManager {
    pub fn new(cache: Arc<FsCache>, store: ObjectStoreClient, device_name: String) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            cache,
            store,
            device_name,
            filter: Mutex::new(None),
            nworkers: AtomicUsize::new(2),
            monitor: Mutex::new(None),
            roots: Mutex::new(Vec::new()),
            by_path: Mutex::new(HashMap::new()),
            snapshot_lock: Mutex::new(()),
            progress_notify: Mutex::new(Vec::new()),
            snapshot_notify: Mutex::new(Vec::new()),
        })
    }

    pub fn set_workers(&self, n: usize) -> &Self {
        self.nworkers.store(n.max(1), Ordering::SeqCst);
        self
    }

    pub fn set_filter<F>(&self, filter: F) -> &Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        *self.filter.lock().unwrap() = Some(Arc::new(filter));
        self
    }

    /// Registers the shared directory monitor and wires its change
    /// notifications back to `dispatch_monitor_events`. Roots added after
    /// this call get the monitor automatically; roots added before it do
    /// not watch anything.
    pub fn set_monitor(&self, monitor: Arc<dyn DirectoryMonitor>) -> &Self {
        let weak = self.self_ref.clone();
        monitor.set_change_notification(Box::new(move || {
            if let Some(manager) = weak.upgrade() {
                manager.dispatch_monitor_events();
            }
        }));
        *self.monitor.lock().unwrap() = Some(monitor);
        self
    }

    pub fn on_progress<F>(&self, cb: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.progress_notify.lock().unwrap().push(Box::new(cb));
        self
    }

    pub fn on_meta_snapshot<F>(&self, cb: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.snapshot_notify.lock().unwrap().push(Box::new(cb));
        self
    }

    /// Creates and registers an `Upload` engine for `path`. `path` should
    /// include a trailing separator the way the original `addUploadRoot`
    /// required, though this implementation does not depend on it.
    pub fn add_upload_root(&self, path: PathBuf) -> Result<Arc<Upload>> {
        let mut upload = Upload::new(self.cache.clone(), self.store.clone(), self.device_name.clone(), path.clone());
        upload.set_workers(self.nworkers.load(Ordering::SeqCst));
        if let Some(filter) = self.filter.lock().unwrap().clone() {
            upload.set_filter(move |p| filter(p));
        }
        if let Some(monitor) = self.monitor.lock().unwrap().clone() {
            upload.set_monitor(monitor);
        }
        let progress_weak = self.self_ref.clone();
        upload.on_progress(move |_engine| {
            if let Some(manager) = progress_weak.upgrade() {
                manager.fire_progress();
            }
        });
        let snapshot_weak = self.self_ref.clone();
        upload.on_snapshot(move |_engine| {
            if let Some(manager) = snapshot_weak.upgrade() {
                manager.handle_snapshot();
            }
        });

        let upload = Arc::new(upload);
        upload.start_watching()?;
        self.roots.lock().unwrap().push(upload.clone());
        self.by_path.lock().unwrap().insert(path, upload.clone());
        Ok(upload)
    }

    /// Starts a full backup on every configured root.
    pub async fn start_upload_all_roots(self: &Arc<Self>) -> Result<()> {
        let roots = self.roots.lock().unwrap().clone();
        for root in roots {
            root.start_upload(false).await?;
        }
        Ok(())
    }

    /// Starts a partial backup on every root that has pending changes.
    /// Returns `false` if any such root was already mid-backup (the caller,
    /// typically the CDP scheduler, should reschedule and retry); `true` if
    /// every touched root was either started or had nothing pending.
    pub async fn start_upload_touched_roots(self: &Arc<Self>) -> bool {
        let roots = self.roots.lock().unwrap().clone();
        let mut all_started = true;
        for root in roots {
            if !root.has_pending_changes() {
                continue;
            }
            match root.clone().start_upload(true).await {
                Ok(true) => {}
                Ok(false) => all_started = false,
                Err(err) => {
                    log::warn!("partial backup of {} failed to start: {:#}", root.backup_root().display(), err);
                    all_started = false;
                }
            }
        }
        all_started
    }

    pub fn is_working(&self) -> bool {
        self.roots.lock().unwrap().iter().any(|r| r.is_working())
    }

    /// Aggregated worker status across every root, in root-registration
    /// order.
    pub fn get_progress(&self) -> Vec<ThreadStatus> {
        self.roots
            .lock()
            .unwrap()
            .iter()
            .flat_map(|r| r.get_progress())
            .collect()
    }

    fn fire_progress(&self) {
        for cb in self.progress_notify.lock().unwrap().iter() {
            cb();
        }
    }

    /// Drains whatever events are waiting on the shared monitor and routes
    /// each one to the `Upload` that owns its root.
    fn dispatch_monitor_events(&self) {
        let monitor = match self.monitor.lock().unwrap().clone() {
            Some(monitor) => monitor,
            None => return,
        };
        while let Some(event) = monitor.pop_event() {
            let upload = self.by_path.lock().unwrap().get(&event.root).cloned();
            match upload {
                Some(upload) => {
                    upload.touch_path(&event.relative_path);
                }
                None => log::warn!("change event for untracked root {}", event.root.display()),
            }
        }
    }

    /// Composes and uploads the meta-root chunk combining every root's
    /// latest snapshot, then posts the meta-snapshot record. Serialized by
    /// `snapshot_lock` so concurrent root completions don't race each other
    /// onto the server out of order.
    fn handle_snapshot(&self) {
        let _guard = self.snapshot_lock.lock().unwrap();
        let roots = self.roots.lock().unwrap().clone();

        let mut children = Vec::new();
        let mut total_size = 0u64;
        let mut any_partial = false;
        for root in &roots {
            let info = root.latest_snapshot_info();
            let kind = match info.kind {
                Some(kind) => kind,
                None => continue, // this root hasn't produced a snapshot yet
            };
            if kind == BackupKind::Partial {
                any_partial = true;
            }
            let name = root
                .backup_root()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| root.backup_root().to_string_lossy().into_owned());
            children.push(ChildEntry {
                name,
                mode: 0o755,
                owner: Owner::Posix {
                    user: info.owner_name,
                    group: info.group_name,
                },
                attrs: FileAttrFlags::DIRECTORY,
                chunk_seq: info.hash_seq,
            });
            total_size += info.subtree_size;
        }
        if children.is_empty() {
            return;
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));

        let store = self.store.clone();
        let device_name = self.device_name.clone();
        let self_ref = self.self_ref.clone();
        tokio::spawn(async move {
            let manager = match self_ref.upgrade() {
                Some(manager) => manager,
                None => return,
            };
            let chunks = codec::encode_directory(&children, total_size);
            let hash_seq = match upload_meta_chunks(&store, &chunks).await {
                Ok(seq) => seq,
                Err(err) => {
                    log::warn!("meta-root upload failed: {:#}", err);
                    return;
                }
            };
            let kind = if any_partial { "partial" } else { "complete" };
            if let Err(err) = store.post_snapshot(&device_name, kind, total_size, &hash_seq).await {
                log::warn!("meta-snapshot commit failed: {:#}", err);
                return;
            }
            for cb in manager.snapshot_notify.lock().unwrap().iter() {
                cb();
            }
        });
    }
}

async fn upload_meta_chunks(store: &ObjectStoreClient, chunks: &[codec::EncodedChunk]) -> Result<codec::ChunkSeq> {
    let mut seq = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if matches!(store.head_object(&chunk.digest).await?, Presence::Absent) {
            store.post_object(&chunk.digest, chunk.bytes.clone()).await?;
        }
        seq.push(chunk.digest);
    }
    Ok(seq)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backup::cache::FsCache;
    use tempfile::tempdir;

    fn manager() -> (Arc<UploadSetManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let cache = Arc::new(FsCache::open(dir.path().join("cache.db")).unwrap());
        let store = ObjectStoreClient::new("https://store.example".to_string());
        let manager = UploadSetManager::new(cache, store, "device-1".to_string());
        (manager, dir)
    }

    #[test]
    fn add_upload_root_registers_by_path() {
        let (manager, dir) = manager();
        let root = dir.path().join("vol");
        std::fs::create_dir_all(&root).unwrap();
        let upload = manager.add_upload_root(root.clone()).unwrap();
        assert_eq!(upload.backup_root(), root);
        assert!(manager.by_path.lock().unwrap().contains_key(&root));
    }

    #[test]
    fn get_progress_aggregates_across_roots() {
        let (manager, dir) = manager();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        manager.set_workers(2);
        manager.add_upload_root(a).unwrap();
        manager.add_upload_root(b).unwrap();
        // each engine starts with an empty status vector until start_upload runs
        assert_eq!(manager.get_progress().len(), 0);
    }
}
