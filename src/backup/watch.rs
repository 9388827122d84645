//! The in-memory watch tree (`WNode`) and the platform directory-change
//! monitor.
//!
//! `WNode`s are stored in an arena indexed by stable integer ids rather than
//! owned via parent/child `Rc`s, so mark-propagation up to the root is a
//! plain loop instead of a graph walk through shared ownership.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;

pub type NodeId = usize;

pub struct WNode {
    pub parent: Option<NodeId>,
    pub relative_path: PathBuf,
    pub touched: bool,
    pub queued: bool,
    children: Vec<NodeId>,
}

/// An arena of `WNode`s mirroring one watched root's directory layout. One
/// `WatchTree` exists per backup root and persists across backup runs
/// within the process; it is only destroyed at process shutdown.
pub struct WatchTree {
    nodes: Vec<WNode>,
    by_path: HashMap<PathBuf, NodeId>,
}

impl WatchTree {
    pub fn new() -> Self {
        let root = WNode {
            parent: None,
            relative_path: PathBuf::new(),
            touched: false,
            queued: false,
            children: Vec::new(),
        };
        let mut by_path = HashMap::new();
        by_path.insert(PathBuf::new(), 0);
        Self {
            nodes: vec![root],
            by_path,
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node(&self, id: NodeId) -> &WNode {
        &self.nodes[id]
    }

    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut cur = id;
        while let Some(parent) = self.nodes[cur].parent {
            depth += 1;
            cur = parent;
        }
        depth
    }

    /// Finds or creates the node for `relative_path`, creating any missing
    /// ancestors along the way.
    pub fn get_or_insert(&mut self, relative_path: &Path) -> NodeId {
        if let Some(id) = self.by_path.get(relative_path) {
            return *id;
        }
        let parent_id = match relative_path.parent() {
            Some(parent) => self.get_or_insert(parent),
            None => self.root(),
        };
        let id = self.nodes.len();
        self.nodes.push(WNode {
            parent: Some(parent_id),
            relative_path: relative_path.to_path_buf(),
            touched: false,
            queued: false,
            children: Vec::new(),
        });
        self.nodes[parent_id].children.push(id);
        self.by_path.insert(relative_path.to_path_buf(), id);
        id
    }

    pub fn find(&self, relative_path: &Path) -> Option<NodeId> {
        self.by_path.get(relative_path).copied()
    }

    /// Marks `id` and every ancestor as touched, maintaining the invariant
    /// that a touched node's ancestors are all touched too.
    pub fn mark_touched(&mut self, id: NodeId) {
        let mut cur = Some(id);
        while let Some(node_id) = cur {
            let node = &mut self.nodes[node_id];
            if node.touched {
                break;
            }
            node.touched = true;
            cur = node.parent;
        }
    }

    /// `touch_path(rel)`: marks `WNode(rel)` and all ancestors touched;
    /// returns false if no such node exists yet.
    pub fn touch_path(&mut self, relative_path: &Path) -> bool {
        match self.find(relative_path) {
            Some(id) => {
                self.mark_touched(id);
                true
            }
            None => false,
        }
    }

    /// Snapshots every node's `touched` flag into `queued` and clears
    /// `touched`, so that change events arriving during the resulting
    /// partial backup are captured for the *next* cycle, not lost.
    pub fn snapshot_queued(&mut self) {
        for node in &mut self.nodes {
            node.queued = node.touched;
            node.touched = false;
        }
    }

    pub fn queued_roots(&self) -> Vec<NodeId> {
        (0..self.nodes.len()).filter(|id| self.nodes[*id].queued).collect()
    }
}

impl Default for WatchTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_or_insert_creates_missing_ancestors() {
        let mut tree = WatchTree::new();
        let id = tree.get_or_insert(Path::new("a/b/c"));
        assert_eq!(tree.depth(id), 3);
        assert!(tree.find(Path::new("a")).is_some());
        assert!(tree.find(Path::new("a/b")).is_some());
        assert_eq!(tree.find(Path::new("a/b/c")), Some(id));
    }

    #[test]
    fn get_or_insert_is_idempotent() {
        let mut tree = WatchTree::new();
        let first = tree.get_or_insert(Path::new("x/y"));
        let second = tree.get_or_insert(Path::new("x/y"));
        assert_eq!(first, second);
    }

    #[test]
    fn mark_touched_propagates_to_root_and_stops_early() {
        let mut tree = WatchTree::new();
        let leaf = tree.get_or_insert(Path::new("a/b/c"));
        let mid = tree.find(Path::new("a/b")).unwrap();
        tree.mark_touched(mid);
        assert!(tree.node(mid).touched);
        assert!(tree.node(tree.root()).touched);
        assert!(!tree.node(leaf).touched);

        tree.mark_touched(leaf);
        assert!(tree.node(leaf).touched);
    }

    #[test]
    fn touch_path_returns_false_for_unknown_path() {
        let mut tree = WatchTree::new();
        assert!(!tree.touch_path(Path::new("nope")));
    }

    #[test]
    fn snapshot_queued_moves_touched_into_queued_and_clears_touched() {
        let mut tree = WatchTree::new();
        let id = tree.get_or_insert(Path::new("a/b"));
        tree.mark_touched(id);
        tree.snapshot_queued();

        assert!(!tree.node(id).touched);
        assert!(tree.node(id).queued);
        assert!(tree.queued_roots().contains(&id));

        // A change arriving after the snapshot is captured for next cycle,
        // not lost: touched resets independently of queued.
        tree.mark_touched(id);
        assert!(tree.node(id).touched);
        assert!(tree.node(id).queued);
    }

    #[test]
    fn event_queue_invokes_notify_callback_on_push() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let queue = EventQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        queue.set_notify(Box::new(move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        }));
        queue.push(Event {
            root: PathBuf::from("/root"),
            relative_path: PathBuf::from("a"),
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            queue.pop(),
            Some(Event {
                root: PathBuf::from("/root"),
                relative_path: PathBuf::from("a"),
            })
        );
        assert_eq!(queue.pop(), None);
    }
}

/// A change observed by the monitor, already resolved to a root and a path
/// relative to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub root: PathBuf,
    pub relative_path: PathBuf,
}

/// Shared interface over the platform-specific watch backends.
pub trait DirectoryMonitor: Send + Sync {
    /// Begins watching `root`. On Linux this recursively registers a watch
    /// descriptor for every directory that exists under `root` right now;
    /// directories discovered later are added via `add_watch`.
    fn add_root(&self, root: &Path) -> Result<()>;

    /// Linux only: registers a newly discovered subdirectory, invoked by
    /// the upload engine during scan. A no-op on platforms with native
    /// recursive watching.
    fn add_watch(&self, _root: &Path, _relative_path: &Path, _absolute_path: &Path) -> Result<()> {
        Ok(())
    }

    fn pop_event(&self) -> Option<Event>;

    fn set_change_notification(&self, cb: Box<dyn Fn() + Send + Sync>);

    /// Stops the monitor; the event stream is finite from this point on and
    /// cannot be restarted.
    fn shutdown(&self);
}

struct EventQueue {
    events: Mutex<VecDeque<Event>>,
    notify_cb: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            notify_cb: Mutex::new(None),
        }
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push_back(event);
        if let Some(cb) = self.notify_cb.lock().unwrap().as_ref() {
            cb();
        }
    }

    fn pop(&self) -> Option<Event> {
        self.events.lock().unwrap().pop_front()
    }

    fn set_notify(&self, cb: Box<dyn Fn() + Send + Sync>) {
        *self.notify_cb.lock().unwrap() = Some(cb);
    }
}

#[cfg(target_os = "linux")]
pub use linux::InotifyMonitor as PlatformMonitor;

#[cfg(not(target_os = "linux"))]
pub use native::NativeMonitor as PlatformMonitor;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;

    use inotify::{Inotify, WatchDescriptor, WatchMask};
    use nix::poll::{poll, PollFd, PollFlags};

    /// True if `err` indicates the OS inotify watch quota
    /// (`/proc/sys/fs/inotify/max_user_watches`) was exhausted.
    pub fn is_quota_exceeded(err: &anyhow::Error) -> bool {
        err.downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::raw_os_error)
            == Some(28) // ENOSPC
    }

    struct WatchEntry {
        root: PathBuf,
        relative_dir: PathBuf,
    }

    /// One inotify watch descriptor per directory, per the platform adapter
    /// contract; a `wd -> (root, relative directory)` map translates raw
    /// `(wd, name)` events back into `(root, relative path)`.
    pub struct InotifyMonitor {
        inotify: Arc<Mutex<Inotify>>,
        watches: Arc<Mutex<HashMap<WatchDescriptor, WatchEntry>>>,
        queue: Arc<EventQueue>,
        shutdown: Arc<AtomicBool>,
        reader: Mutex<Option<JoinHandle<()>>>,
    }

    impl InotifyMonitor {
        pub fn new() -> Result<Self> {
            let inotify = Arc::new(Mutex::new(Inotify::init()?));
            let watches = Arc::new(Mutex::new(HashMap::new()));
            let queue = Arc::new(EventQueue::new());
            let shutdown = Arc::new(AtomicBool::new(false));

            let reader = spawn_reader(inotify.clone(), watches.clone(), queue.clone(), shutdown.clone());

            Ok(Self {
                inotify,
                watches,
                queue,
                shutdown,
                reader: Mutex::new(Some(reader)),
            })
        }

        fn register(&self, root: &Path, relative_dir: &Path, absolute_dir: &Path) -> Result<()> {
            let wd = {
                let mut inotify = self.inotify.lock().unwrap();
                inotify.add_watch(
                    absolute_dir,
                    WatchMask::CREATE | WatchMask::DELETE | WatchMask::MODIFY | WatchMask::MOVE | WatchMask::ATTRIB,
                )?
            };
            self.watches.lock().unwrap().insert(
                wd,
                WatchEntry {
                    root: root.to_path_buf(),
                    relative_dir: relative_dir.to_path_buf(),
                },
            );
            Ok(())
        }
    }

    /// Polls the inotify fd with a bounded timeout rather than blocking
    /// indefinitely, so the shutdown flag is re-checked regularly and the
    /// inotify mutex is never held across an unbounded wait (which would
    /// otherwise starve `add_watch` calls made from the scan thread). This
    /// plays the role the original implementation filled with a dedicated
    /// wake-pipe alongside the inotify fd.
    fn spawn_reader(
        inotify: Arc<Mutex<Inotify>>,
        watches: Arc<Mutex<HashMap<WatchDescriptor, WatchEntry>>>,
        queue: Arc<EventQueue>,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("inotify-reader".into())
            .spawn(move || {
                let mut buffer = [0u8; 4096];
                while !shutdown.load(Ordering::SeqCst) {
                    let ready = {
                        let guard = inotify.lock().unwrap();
                        let fd = guard.as_raw_fd();
                        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
                        matches!(poll(&mut fds, 250), Ok(n) if n > 0)
                    };
                    if !ready {
                        continue;
                    }
                    let events: Vec<_> = {
                        let mut guard = inotify.lock().unwrap();
                        match guard.read_events(&mut buffer) {
                            Ok(events) => events.collect(),
                            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                            Err(_) => return,
                        }
                    };
                    let watches = watches.lock().unwrap();
                    for event in events {
                        if let (Some(entry), Some(name)) = (watches.get(&event.wd), event.name) {
                            queue.push(Event {
                                root: entry.root.clone(),
                                relative_path: entry.relative_dir.join(name),
                            });
                        }
                    }
                }
            })
            .expect("spawn inotify reader thread")
    }

    impl DirectoryMonitor for InotifyMonitor {
        fn add_root(&self, root: &Path) -> Result<()> {
            self.register(root, Path::new(""), root)?;
            for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_dir() && entry.path() != root {
                    let relative = entry.path().strip_prefix(root).unwrap_or_else(|_| entry.path());
                    if let Err(err) = self.register(root, relative, entry.path()) {
                        if is_quota_exceeded(&err) {
                            return Err(err);
                        }
                        log::info!("inotify: skipping {}: {}", entry.path().display(), err);
                    }
                }
            }
            Ok(())
        }

        fn add_watch(&self, root: &Path, relative_path: &Path, absolute_path: &Path) -> Result<()> {
            self.register(root, relative_path, absolute_path)
        }

        fn pop_event(&self) -> Option<Event> {
            self.queue.pop()
        }

        fn set_change_notification(&self, cb: Box<dyn Fn() + Send + Sync>) {
            self.queue.set_notify(cb);
        }

        fn shutdown(&self) {
            self.shutdown.store(true, Ordering::SeqCst);
            if let Some(handle) = self.reader.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod native {
    use super::*;
    use std::sync::Arc;

    use notify::{RecommendedWatcher, RecursiveMode, Watcher};

    pub struct NativeMonitor {
        watcher: Mutex<RecommendedWatcher>,
        roots: Arc<Mutex<Vec<PathBuf>>>,
        queue: Arc<EventQueue>,
    }

    impl NativeMonitor {
        pub fn new() -> Result<Self> {
            let queue = Arc::new(EventQueue::new());
            let roots: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));

            let queue_for_cb = queue.clone();
            let roots_for_cb = roots.clone();
            let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(_) => return,
                };
                let roots = roots_for_cb.lock().unwrap();
                for path in event.paths {
                    if let Some(root) = roots.iter().find(|r| path.starts_with(r.as_path())) {
                        let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                        queue_for_cb.push(Event {
                            root: root.clone(),
                            relative_path: relative,
                        });
                    }
                }
            })?;

            Ok(Self {
                watcher: Mutex::new(watcher),
                roots,
                queue,
            })
        }
    }

    impl DirectoryMonitor for NativeMonitor {
        fn add_root(&self, root: &Path) -> Result<()> {
            self.watcher.lock().unwrap().watch(root, RecursiveMode::Recursive)?;
            self.roots.lock().unwrap().push(root.to_path_buf());
            Ok(())
        }

        fn pop_event(&self) -> Option<Event> {
            self.queue.pop()
        }

        fn set_change_notification(&self, cb: Box<dyn Fn() + Send + Sync>) {
            self.queue.set_notify(cb);
        }

        fn shutdown(&self) {
            let roots = self.roots.lock().unwrap();
            let mut watcher = self.watcher.lock().unwrap();
            for root in roots.iter() {
                let _ = watcher.unwatch(root);
            }
        }
    }
}
