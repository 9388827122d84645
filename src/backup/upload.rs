//! The upload engine: walks a single backup root, consults the FS cache,
//! encodes directories only after their children have uploaded, and drives
//! a root-snapshot commit at the end.
//!
//! Workers are `tokio` tasks rather than dedicated OS threads, since every
//! suspension point in this engine (file I/O via `spawn_blocking`, object
//! store HTTP, the cache mutex) already has an async-friendly equivalent in
//! the ambient stack; the depth-aware priority queue, per-directory state
//! machine and cancellation semantics are otherwise unchanged from the
//! original thread-pool design.

use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::spawn_blocking;

use crate::backup::cache::{CObject, FsCache};
use crate::backup::codec::{self, ChildEntry, FileAttrFlags, Owner};
use crate::backup::fsobjid::FsObjId;
use crate::backup::watch::{DirectoryMonitor, WatchTree};
use crate::client::{ObjectStoreClient, Presence};
use crate::hash::Sha256Digest;

/// Priority sentinel for partial-backup runs: higher than any real
/// directory depth, so touched-root work always jumps the queue.
const PARTIAL_PRIORITY: usize = usize::MAX;

#[derive(Error, Debug)]
#[error("upload cancelled")]
struct Cancelled;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Idle,
    Scanning,
    Uploading,
    Finishing,
}

#[derive(Clone, Debug)]
pub struct ThreadStatus {
    pub state: ThreadState,
    pub object: Option<String>,
    pub object_progress: Option<f64>,
}

impl Default for ThreadStatus {
    fn default() -> Self {
        Self {
            state: ThreadState::Idle,
            object: None,
            object_progress: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupKind {
    Complete,
    Partial,
}

#[derive(Clone, Debug, Default)]
pub struct LatestSnapshotInfo {
    pub timestamp: Option<SystemTime>,
    pub kind: Option<BackupKind>,
    pub hash_seq: codec::ChunkSeq,
    pub subtree_size: u64,
    pub owner_name: String,
    pub group_name: String,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum DirLifecycle {
    Scanning,
    AwaitingChildren,
    Uploading,
    Complete,
}

/// One directory's state for the duration of a single backup run. Rebuilt
/// from scratch every `start_upload`; this is distinct from `WatchTree`,
/// which persists across runs.
struct DirState {
    relative_path: PathBuf,
    absolute_path: PathBuf,
    depth: usize,
    parent: Option<Arc<DirState>>,
    fs_obj_id: FsObjId,
    name: String,
    mode: u32,
    owner: Owner,
    mut_state: Mutex<DirStateMut>,
}

struct DirStateMut {
    lifecycle: DirLifecycle,
    pending_children: usize,
    /// Completed children (files scanned directly, or subdirectories once
    /// their own upload finishes), paired with each child's own subtree
    /// size so the parent can sum them for its own `subtree_size`.
    children: Vec<(ChildEntry, u64)>,
}

enum WorkKind {
    Scan(Arc<DirState>),
    UploadDir(Arc<DirState>),
}

struct WorkItem {
    priority: usize,
    seq: u64,
    kind: WorkKind,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for WorkItem {}
impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: higher priority pops first; for equal
        // priority, the earlier-enqueued item (smaller seq) pops first.
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

type Filter = dyn Fn(&Path) -> bool + Send + Sync;
type ProgressCb = dyn Fn(&Upload) + Send + Sync;
type SnapshotCb = dyn Fn(&Upload) + Send + Sync;
type CompletionCb = dyn Fn(&Upload) + Send + Sync;

/// Performs a full or partial backup of one directory hierarchy.
pub struct Upload {
    cache: Arc<FsCache>,
    store: ObjectStoreClient,
    device_name: String,
    backup_root: PathBuf,
    filter: Arc<Filter>,
    nworkers: AtomicUsize,
    monitor: Option<Arc<dyn DirectoryMonitor>>,
    watch_tree: Mutex<WatchTree>,

    queue: Mutex<BinaryHeap<WorkItem>>,
    queue_seq: AtomicU64,
    notify: Notify,
    queue_closed: AtomicBool,

    cancelled: Arc<AtomicBool>,
    working: AtomicBool,
    partial_run: AtomicBool,
    active_workers: AtomicUsize,

    statuses: Mutex<Vec<ThreadStatus>>,
    estimated_total_bytes: AtomicU64,
    bytes_processed: AtomicU64,

    latest_snapshot: Mutex<LatestSnapshotInfo>,

    progress_cbs: Mutex<Vec<Box<ProgressCb>>>,
    snapshot_cbs: Mutex<Vec<Box<SnapshotCb>>>,
    completion_cbs: Mutex<Vec<Box<CompletionCb>>>,
}

impl Upload {
    pub fn new(cache: Arc<FsCache>, store: ObjectStoreClient, device_name: String, backup_root: PathBuf) -> Self {
        Self {
            cache,
            store,
            device_name,
            backup_root,
            filter: Arc::new(|_| true),
            nworkers: AtomicUsize::new(2),
            monitor: None,
            watch_tree: Mutex::new(WatchTree::new()),
            queue: Mutex::new(BinaryHeap::new()),
            queue_seq: AtomicU64::new(0),
            notify: Notify::new(),
            queue_closed: AtomicBool::new(true),
            cancelled: Arc::new(AtomicBool::new(false)),
            working: AtomicBool::new(false),
            partial_run: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            statuses: Mutex::new(Vec::new()),
            estimated_total_bytes: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            latest_snapshot: Mutex::new(LatestSnapshotInfo::default()),
            progress_cbs: Mutex::new(Vec::new()),
            snapshot_cbs: Mutex::new(Vec::new()),
            completion_cbs: Mutex::new(Vec::new()),
        }
    }

    pub fn set_workers(&mut self, n: usize) -> &mut Self {
        self.nworkers.store(n.max(1), Ordering::SeqCst);
        self
    }

    pub fn set_filter<F>(&mut self, filter: F) -> &mut Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.filter = Arc::new(filter);
        self
    }

    pub fn set_monitor(&mut self, monitor: Arc<dyn DirectoryMonitor>) -> &mut Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn on_progress<F>(&mut self, cb: F) -> &mut Self
    where
        F: Fn(&Upload) + Send + Sync + 'static,
    {
        self.progress_cbs.lock().unwrap().push(Box::new(cb));
        self
    }

    pub fn on_snapshot<F>(&mut self, cb: F) -> &mut Self
    where
        F: Fn(&Upload) + Send + Sync + 'static,
    {
        self.snapshot_cbs.lock().unwrap().push(Box::new(cb));
        self
    }

    pub fn on_completion<F>(&mut self, cb: F) -> &mut Self
    where
        F: Fn(&Upload) + Send + Sync + 'static,
    {
        self.completion_cbs.lock().unwrap().push(Box::new(cb));
        self
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    pub fn get_progress(&self) -> Vec<ThreadStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn latest_snapshot_info(&self) -> LatestSnapshotInfo {
        self.latest_snapshot.lock().unwrap().clone()
    }

    /// Marks `WNode(rel)` and all ancestors touched; the CDP scheduler calls
    /// this on every change event.
    pub fn touch_path(&self, relative: &Path) -> bool {
        self.watch_tree.lock().unwrap().touch_path(relative)
    }

    pub fn has_queued_changes(&self) -> bool {
        !self.watch_tree.lock().unwrap().queued_roots().is_empty()
    }

    /// True if any path under this root has been touched since the last
    /// `snapshot_queued()`. `mark_touched` propagates up to the root, so a
    /// single flag check there is enough.
    pub fn has_pending_changes(&self) -> bool {
        let tree = self.watch_tree.lock().unwrap();
        tree.node(tree.root()).touched
    }

    /// Begins watching this engine's root for change events, if a monitor
    /// was configured.
    pub fn start_watching(&self) -> Result<()> {
        if let Some(monitor) = &self.monitor {
            monitor.add_root(&self.backup_root)?;
            self.watch_tree.lock().unwrap().get_or_insert(Path::new(""));
        }
        Ok(())
    }

    /// Spawns workers and starts backing up. `partial` selects whether the
    /// scan walks only `WNode`s whose `queued` flag is set. Returns `true`
    /// if a new backup started, `false` if one was already running.
    pub async fn start_upload(self: Arc<Self>, partial: bool) -> Result<bool> {
        if self.working.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.cancelled.store(false, Ordering::SeqCst);
        self.queue_closed.store(false, Ordering::SeqCst);
        self.partial_run.store(partial, Ordering::SeqCst);
        self.bytes_processed.store(0, Ordering::SeqCst);

        let nworkers = self.nworkers.load(Ordering::SeqCst);
        *self.statuses.lock().unwrap() = vec![ThreadStatus::default(); nworkers];

        self.watch_tree.lock().unwrap().snapshot_queued();

        // Advisory only: runs alongside the scan/upload workers rather than
        // gating them, so `estimated_total_bytes` starts at 0 and fills in
        // once the stat-only walk finishes.
        let estimator = self.clone();
        tokio::spawn(async move {
            let total = estimate_size(estimator.backup_root.clone()).await;
            estimator.estimated_total_bytes.store(total, Ordering::SeqCst);
        });

        let root_path = self.backup_root.clone();
        let meta = spawn_blocking(move || std::fs::metadata(&root_path))
            .await
            .context("join stat task")?
            .context("stat backup root")?;

        let root = Arc::new(DirState {
            relative_path: PathBuf::new(),
            absolute_path: self.backup_root.clone(),
            depth: 0,
            parent: None,
            fs_obj_id: FsObjId::from_metadata(&meta),
            name: self
                .backup_root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string()),
            mode: build_mode(&meta),
            owner: build_owner(&meta),
            mut_state: Mutex::new(DirStateMut {
                lifecycle: DirLifecycle::Scanning,
                pending_children: 0,
                children: Vec::new(),
            }),
        });

        self.enqueue(0, WorkKind::Scan(root));

        self.active_workers.store(nworkers, Ordering::SeqCst);
        for idx in 0..nworkers {
            let engine = self.clone();
            tokio::spawn(async move {
                run_worker(engine.clone(), idx).await;
                // Last worker out flips `working` and fires the completion
                // callbacks, so a caller never observes `is_working() ==
                // false` while a stale worker from this run is still
                // mid-flight (e.g. between its last `check_cancelled()` and
                // actually returning).
                if engine.active_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
                    engine.worker_pool_drained();
                }
            });
        }
        Ok(true)
    }

    /// Requests cancellation. `is_working()` keeps reporting `true` until
    /// every spawned worker has drained its current item and exited; the
    /// completion callback still fires exactly once, from
    /// `worker_pool_drained`.
    pub fn cancel_upload(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.queue_closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(Cancelled.into())
        } else {
            Ok(())
        }
    }

    fn is_queued(&self, relative: &Path) -> bool {
        let tree = self.watch_tree.lock().unwrap();
        match tree.find(relative) {
            Some(id) => tree.node(id).queued,
            // Unknown to the watch tree: conservatively scan it.
            None => true,
        }
    }

    fn enqueue(&self, priority_depth: usize, kind: WorkKind) {
        let priority = if self.partial_run.load(Ordering::SeqCst) {
            PARTIAL_PRIORITY
        } else {
            priority_depth
        };
        let seq = self.queue_seq.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().unwrap().push(WorkItem { priority, seq, kind });
        self.notify.notify_one();
    }

    fn dequeue(&self) -> Option<WorkKind> {
        self.queue.lock().unwrap().pop().map(|item| item.kind)
    }

    fn set_status(&self, idx: usize, state: ThreadState, object: Option<String>, progress: Option<f64>) {
        if let Some(slot) = self.statuses.lock().unwrap().get_mut(idx) {
            *slot = ThreadStatus {
                state,
                object,
                object_progress: progress,
            };
        }
        for cb in self.progress_cbs.lock().unwrap().iter() {
            cb(self);
        }
    }

    fn progress_fraction(&self) -> Option<f64> {
        let total = self.estimated_total_bytes.load(Ordering::SeqCst);
        if total == 0 {
            return None;
        }
        let done = self.bytes_processed.load(Ordering::SeqCst);
        Some((done as f64 / total as f64).min(1.0))
    }

    fn record_bytes(&self, n: u64) {
        self.bytes_processed.fetch_add(n, Ordering::SeqCst);
    }

    fn on_child_complete(&self, parent: &Arc<DirState>, entry: ChildEntry, subtree_size: u64) {
        let ready = {
            let mut state = parent.mut_state.lock().unwrap();
            state.children.push((entry, subtree_size));
            state.pending_children -= 1;
            if state.pending_children == 0 {
                state.lifecycle = DirLifecycle::Uploading;
                true
            } else {
                false
            }
        };
        if ready {
            self.enqueue(parent.depth, WorkKind::UploadDir(parent.clone()));
        }
    }

    /// Records the snapshot and fires the snapshot callbacks. Only reached
    /// when the root directory's work item finishes normally: a cancelled
    /// run always fails `check_cancelled()` before getting here, so this
    /// never runs for a cancelled run and the cancellation check that used
    /// to guard the snapshot callbacks below is unnecessary.
    fn complete(&self, hash_seq: codec::ChunkSeq, subtree_size: u64, kind: BackupKind, owner: String, group: String) {
        {
            let mut info = self.latest_snapshot.lock().unwrap();
            *info = LatestSnapshotInfo {
                timestamp: Some(SystemTime::now()),
                kind: Some(kind),
                hash_seq,
                subtree_size,
                owner_name: owner,
                group_name: group,
            };
        }
        self.queue_closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();

        let cbs = self.snapshot_cbs.lock().unwrap();
        for cb in cbs.iter() {
            cb(self);
        }
    }

    /// Runs once per `start_upload` call, when the last spawned worker for
    /// that run returns. This is the only place `working` goes back to
    /// `false` and the only place `completion_cbs` fire, so the callback
    /// contract ("exactly once, whether the run succeeded or was
    /// cancelled") holds regardless of which way the run ended, and a
    /// restarted run never races against stale workers from the previous
    /// one.
    fn worker_pool_drained(&self) {
        self.working.store(false, Ordering::SeqCst);
        let cbs = self.completion_cbs.lock().unwrap();
        for cb in cbs.iter() {
            cb(self);
        }
    }
}

async fn estimate_size(root: PathBuf) -> u64 {
    spawn_blocking(move || {
        walkdir::WalkDir::new(&root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    })
    .await
    .unwrap_or(0)
}

async fn run_worker(engine: Arc<Upload>, idx: usize) {
    loop {
        let item = engine.dequeue();
        let item = match item {
            Some(item) => item,
            None => {
                if engine.queue_closed.load(Ordering::SeqCst) {
                    engine.set_status(idx, ThreadState::Idle, None, None);
                    return;
                }
                engine.notify.notified().await;
                continue;
            }
        };

        let result = match item {
            WorkKind::Scan(dir) => scan_dir(&engine, idx, dir).await,
            WorkKind::UploadDir(dir) => upload_dir(&engine, idx, dir).await,
        };
        if let Err(err) = result {
            if err.downcast_ref::<Cancelled>().is_none() {
                log::warn!("upload worker {}: {:#}", idx, err);
            }
        }
    }
}

async fn scan_dir(engine: &Upload, worker: usize, dir: Arc<DirState>) -> Result<()> {
    engine.check_cancelled()?;
    engine.set_status(
        worker,
        ThreadState::Scanning,
        Some(dir.relative_path.display().to_string()),
        engine.progress_fraction(),
    );

    let partial = engine.partial_run.load(Ordering::SeqCst);
    if partial && dir.depth > 0 && !engine.is_queued(&dir.relative_path) {
        if let Some(cobj) = engine.cache.read(&dir.fs_obj_id)? {
            finish_directory_from_cache(engine, &dir, cobj)?;
            return Ok(());
        }
        // Cache miss despite not being queued: CDP may have missed an
        // event (e.g. a dropped inotify watch); fall through to a full
        // scan of this directory as a self-healing default.
    }

    let absolute = dir.absolute_path.clone();
    let mut entries = spawn_blocking(move || -> std::io::Result<Vec<std::fs::DirEntry>> {
        std::fs::read_dir(&absolute)?.collect()
    })
    .await
    .context("join readdir task")?
    .with_context(|| format!("reading directory {}", dir.absolute_path.display()))?;

    entries.sort_by(|a, b| sort_key(&a.file_name()).cmp(&sort_key(&b.file_name())));

    let mut subdir_count = 0usize;
    for entry in entries {
        engine.check_cancelled()?;
        let name = entry.file_name();
        let relative = dir.relative_path.join(&name);
        if !(engine.filter)(&relative) {
            continue;
        }
        let absolute = entry.path();

        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(err) => {
                log::info!("skipping {}: {}", absolute.display(), err);
                continue;
            }
        };

        if file_type.is_dir() {
            let meta = match std::fs::metadata(&absolute) {
                Ok(meta) => meta,
                Err(err) => {
                    log::info!("skipping {}: {}", absolute.display(), err);
                    continue;
                }
            };
            if let Some(monitor) = &engine.monitor {
                if let Err(err) = monitor.add_watch(&engine.backup_root, &relative, &absolute) {
                    log::warn!("failed to watch {}: {:#}", absolute.display(), err);
                }
            }
            engine.watch_tree.lock().unwrap().get_or_insert(&relative);

            let child = Arc::new(DirState {
                relative_path: relative.clone(),
                absolute_path: absolute,
                depth: dir.depth + 1,
                parent: Some(dir.clone()),
                fs_obj_id: FsObjId::from_metadata(&meta),
                name: name.to_string_lossy().into_owned(),
                mode: build_mode(&meta),
                owner: build_owner(&meta),
                mut_state: Mutex::new(DirStateMut {
                    lifecycle: DirLifecycle::Scanning,
                    pending_children: 0,
                    children: Vec::new(),
                }),
            });
            subdir_count += 1;
            engine.enqueue(child.depth, WorkKind::Scan(child));
        } else {
            match process_file(engine, &absolute, &relative, &name.to_string_lossy()).await {
                Ok(Some((child_entry, subtree_size))) => {
                    dir.mut_state.lock().unwrap().children.push((child_entry, subtree_size));
                }
                Ok(None) => {}
                Err(err) if err.downcast_ref::<Cancelled>().is_some() => return Err(err),
                Err(err) => log::info!("skipping {}: {:#}", absolute.display(), err),
            }
        }
    }

    let ready = {
        let mut state = dir.mut_state.lock().unwrap();
        state.pending_children = subdir_count;
        if subdir_count == 0 {
            state.lifecycle = DirLifecycle::Uploading;
            true
        } else {
            state.lifecycle = DirLifecycle::AwaitingChildren;
            false
        }
    };
    if ready {
        engine.enqueue(dir.depth, WorkKind::UploadDir(dir));
    }
    Ok(())
}

fn finish_directory_from_cache(engine: &Upload, dir: &Arc<DirState>, cobj: CObject) -> Result<()> {
    let entry = ChildEntry {
        name: dir.name.clone(),
        mode: dir.mode,
        owner: dir.owner.clone(),
        attrs: FileAttrFlags::DIRECTORY,
        chunk_seq: cobj.chunk_seq.clone(),
    };
    finish_dir_common(engine, dir, entry, cobj.chunk_seq, cobj.subtree_size_bytes)
}

async fn upload_dir(engine: &Upload, worker: usize, dir: Arc<DirState>) -> Result<()> {
    engine.check_cancelled()?;
    engine.set_status(
        worker,
        ThreadState::Uploading,
        Some(dir.relative_path.display().to_string()),
        engine.progress_fraction(),
    );

    let (mut children, sum): (Vec<ChildEntry>, u64) = {
        let state = dir.mut_state.lock().unwrap();
        let sum = state.children.iter().map(|(_, size)| *size).sum();
        (state.children.iter().map(|(entry, _)| entry.clone()).collect(), sum)
    };
    children.sort_by(|a, b| sort_key(std::ffi::OsStr::new(&a.name)).cmp(&sort_key(std::ffi::OsStr::new(&b.name))));

    let chunks = codec::encode_directory(&children, sum);
    let hash_seq = probe_and_upload(engine, &chunks).await?;
    let subtree_size = chunks[0].subtree_size;

    let row_id = engine.cache.find_row_id(&dir.fs_obj_id)?;
    let cobj = CObject {
        cache_row_id: row_id,
        fs_obj_id: dir.fs_obj_id,
        chunk_seq: hash_seq.clone(),
        subtree_size_bytes: subtree_size,
    };
    match row_id {
        Some(id) => engine.cache.update(id, &cobj)?,
        None => engine.cache.insert(&cobj)?,
    }

    let entry = ChildEntry {
        name: dir.name.clone(),
        mode: dir.mode,
        owner: dir.owner.clone(),
        attrs: FileAttrFlags::DIRECTORY,
        chunk_seq: hash_seq.clone(),
    };
    finish_dir_common(engine, &dir, entry, hash_seq, subtree_size)
}

fn finish_dir_common(
    engine: &Upload,
    dir: &Arc<DirState>,
    entry: ChildEntry,
    hash_seq: codec::ChunkSeq,
    subtree_size: u64,
) -> Result<()> {
    dir.mut_state.lock().unwrap().lifecycle = DirLifecycle::Complete;
    match &dir.parent {
        Some(parent) => engine.on_child_complete(parent, entry, subtree_size),
        None => {
            let kind = if engine.partial_run.load(Ordering::SeqCst) {
                BackupKind::Partial
            } else {
                BackupKind::Complete
            };
            let (owner_name, group_name) = match &entry.owner {
                Owner::Posix { user, group } => (user.clone(), group.clone()),
                Owner::Windows { sddl } => (sddl.clone(), String::new()),
            };
            engine.complete(hash_seq, subtree_size, kind, owner_name, group_name);
        }
    }
    Ok(())
}

async fn process_file(
    engine: &Upload,
    absolute: &Path,
    relative: &Path,
    name: &str,
) -> Result<Option<(ChildEntry, u64)>> {
    engine.check_cancelled()?;
    let path = absolute.to_path_buf();
    let meta = match spawn_blocking(move || std::fs::symlink_metadata(&path)).await? {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let fs_obj_id = FsObjId::from_metadata(&meta);
    let cached = engine.cache.read(&fs_obj_id)?;

    // A cache hit only reuses the stored chunk sequence if every digest in
    // it still resolves on the server; a digest the server has lost (e.g.
    // garbage-collected) needs the same re-upload path as a genuinely
    // changed file, or the cache would keep pointing at unrecoverable
    // content forever.
    let mut reusable = cached.is_some();
    if let Some(cobj) = &cached {
        for digest in &cobj.chunk_seq {
            engine.check_cancelled()?;
            if matches!(engine.store.head_object(digest).await?, Presence::Absent) {
                log::warn!("cached chunk {} for {} missing on server, re-uploading", digest, absolute.display());
                reusable = false;
                break;
            }
        }
    }

    let (chunk_seq, subtree_size) = if let Some(cobj) = cached.filter(|_| reusable) {
        (cobj.chunk_seq, cobj.subtree_size_bytes)
    } else if meta.file_type().is_symlink() {
        let link_path = absolute.to_path_buf();
        let target = spawn_blocking(move || std::fs::read_link(&link_path)).await??;
        let chunks = codec::encode_data(target.to_string_lossy().as_bytes());
        let seq = probe_and_upload(engine, &chunks).await?;
        (seq, chunks[0].subtree_size)
    } else {
        let read_path = absolute.to_path_buf();
        let data = spawn_blocking(move || std::fs::read(&read_path)).await??;
        let chunks = codec::encode_data(&data);
        let seq = probe_and_upload(engine, &chunks).await?;
        let subtree_size = chunks[0].subtree_size;

        let row_id = engine.cache.find_row_id(&fs_obj_id)?;
        let cobj = CObject {
            cache_row_id: row_id,
            fs_obj_id,
            chunk_seq: seq.clone(),
            subtree_size_bytes: subtree_size,
        };
        match row_id {
            Some(id) => engine.cache.update(id, &cobj)?,
            None => engine.cache.insert(&cobj)?,
        }
        (seq, subtree_size)
    };

    let owner = build_owner(&meta);
    let mode = build_mode(&meta);
    let attrs = build_attrs(&meta, name);
    Ok(Some((
        ChildEntry {
            name: name.to_string(),
            mode,
            owner,
            attrs,
            chunk_seq,
        },
        subtree_size,
    )))
}

/// `HEAD`-probes every chunk in order and `POST`s whichever ones are
/// missing, returning the resulting digest sequence in order.
async fn probe_and_upload(engine: &Upload, chunks: &[codec::EncodedChunk]) -> Result<codec::ChunkSeq> {
    let mut seq = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        engine.check_cancelled()?;
        match engine.store.head_object(&chunk.digest).await? {
            Presence::Absent => {
                engine.store.post_object(&chunk.digest, chunk.bytes.clone()).await?;
            }
            Presence::Present => {}
        }
        engine.record_bytes(chunk.bytes.len() as u64);
        seq.push(chunk.digest);
    }
    Ok(seq)
}

#[cfg(unix)]
fn sort_key(name: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn sort_key(name: &std::ffi::OsStr) -> Vec<u8> {
    name.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn build_owner(meta: &std::fs::Metadata) -> Owner {
    use std::os::unix::fs::MetadataExt;
    let uid = meta.uid();
    let gid = meta.gid();
    let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string());
    let group = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| gid.to_string());
    Owner::Posix { user, group }
}

#[cfg(windows)]
fn build_owner(_meta: &std::fs::Metadata) -> Owner {
    // Full SDDL extraction needs the Windows security APIs, out of reach of
    // std; a placeholder keeps the wire format correct while leaving real
    // ACL translation as unimplemented on this platform.
    Owner::Windows { sddl: String::new() }
}

#[cfg(unix)]
fn build_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(windows)]
fn build_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}

fn build_attrs(meta: &std::fs::Metadata, name: &str) -> FileAttrFlags {
    let mut flags = FileAttrFlags::empty();
    if meta.permissions().readonly() {
        flags |= FileAttrFlags::READONLY;
    }
    if meta.file_type().is_symlink() {
        flags |= FileAttrFlags::SYMLINK;
    }
    if name.starts_with('.') {
        flags |= FileAttrFlags::HIDDEN;
    }
    flags
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn work_item_orders_by_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(WorkItem {
            priority: 1,
            seq: 0,
            kind: WorkKind::Scan(dummy_dirstate()),
        });
        heap.push(WorkItem {
            priority: 3,
            seq: 1,
            kind: WorkKind::Scan(dummy_dirstate()),
        });
        heap.push(WorkItem {
            priority: 3,
            seq: 2,
            kind: WorkKind::Scan(dummy_dirstate()),
        });
        let first = heap.pop().unwrap();
        assert_eq!(first.priority, 3);
        assert_eq!(first.seq, 1); // FIFO among equal priority
        let second = heap.pop().unwrap();
        assert_eq!(second.priority, 3);
        assert_eq!(second.seq, 2);
        let third = heap.pop().unwrap();
        assert_eq!(third.priority, 1);
    }

    fn dummy_dirstate() -> Arc<DirState> {
        Arc::new(DirState {
            relative_path: PathBuf::new(),
            absolute_path: PathBuf::new(),
            depth: 0,
            parent: None,
            fs_obj_id: FsObjId::from_metadata(&std::fs::metadata(".").unwrap()),
            name: String::new(),
            mode: 0,
            owner: Owner::Posix {
                user: String::new(),
                group: String::new(),
            },
            mut_state: Mutex::new(DirStateMut {
                lifecycle: DirLifecycle::Scanning,
                pending_children: 0,
                children: Vec::new(),
            }),
        })
    }

    #[test]
    fn build_attrs_flags_hidden_and_symlink_dotfile() {
        let meta = std::fs::metadata(".").unwrap();
        let attrs = build_attrs(&meta, ".hidden");
        assert!(attrs.contains(FileAttrFlags::HIDDEN));
    }
}
