//! Continuous-data-protection scheduler: absorbs a burst of change events
//! into a single debounce window, then kicks off a partial backup of
//! whatever roots ended up touched.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backup::upload_set::UploadSetManager;

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);

enum RunMode {
    Normal,
    Quit,
}

struct Inner {
    timeout: Option<Instant>,
    run_mode: RunMode,
}

/// One debounce timer shared across every watched root; driven by a single
/// `tokio` task in place of the original's dedicated OS thread plus
/// semaphore, for the same reason `upload.rs`'s worker pool moved to tasks:
/// every suspension point here (`sleep_until`, the notify wait) already has
/// an async form.
pub struct CdpScheduler {
    upload_set: Arc<UploadSetManager>,
    debounce: Duration,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl CdpScheduler {
    /// Spawns the scheduler loop and returns a handle. Dropping the handle
    /// does not stop the loop; call `shutdown` explicitly.
    pub fn spawn(upload_set: Arc<UploadSetManager>, debounce: Duration) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            upload_set,
            debounce,
            inner: Mutex::new(Inner {
                timeout: None,
                run_mode: RunMode::Normal,
            }),
            notify: Notify::new(),
        });
        let handle = scheduler.clone();
        tokio::spawn(async move { handle.run().await });
        scheduler
    }

    pub fn spawn_default(upload_set: Arc<UploadSetManager>) -> Arc<Self> {
        Self::spawn(upload_set, DEFAULT_DEBOUNCE)
    }

    /// Schedules a backup attempt `debounce` from now, unless one is already
    /// pending. Events arriving inside an already-open window are absorbed
    /// here; the watcher's own event queue still records every individual
    /// change for the upload engines to pick up.
    pub fn notify_change(&self, path: &Path) {
        let mut inner = self.inner.lock().unwrap();
        if inner.timeout.is_none() {
            log::debug!("cdp: scheduling backup in {:?} after change at {}", self.debounce, path.display());
            inner.timeout = Some(Instant::now() + self.debounce);
            self.notify.notify_one();
        }
    }

    /// Stops the scheduler loop. The thread exits at its next wakeup, which
    /// happens immediately rather than waiting out the current window.
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().run_mode = RunMode::Quit;
        self.notify.notify_one();
    }

    async fn run(self: Arc<Self>) {
        loop {
            let deadline = {
                let inner = self.inner.lock().unwrap();
                if matches!(inner.run_mode, RunMode::Quit) {
                    return;
                }
                inner.timeout
            };

            match deadline {
                None => self.notify.notified().await,
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.notify.notified() => continue,
                    }
                    if matches!(self.inner.lock().unwrap().run_mode, RunMode::Quit) {
                        return;
                    }
                    if Instant::now() < deadline {
                        continue;
                    }
                    let started = self.upload_set.start_upload_touched_roots().await;
                    let mut inner = self.inner.lock().unwrap();
                    inner.timeout = if started {
                        None
                    } else {
                        log::info!("cdp: backup already in progress, rescheduling");
                        Some(Instant::now() + self.debounce)
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backup::cache::FsCache;
    use crate::client::ObjectStoreClient;
    use std::time::Duration as StdDuration;

    fn upload_set() -> Arc<UploadSetManager> {
        let cache = Arc::new(FsCache::open_in_memory().unwrap());
        let store = ObjectStoreClient::new("https://store.example".to_string());
        UploadSetManager::new(cache, store, "device-1".to_string())
    }

    #[tokio::test]
    async fn notify_change_is_absorbed_within_window() {
        let scheduler = CdpScheduler::spawn(upload_set(), Duration::from_millis(50));
        scheduler.notify_change(Path::new("a"));
        // second call inside the window must not reset the deadline
        let first_deadline = scheduler.inner.lock().unwrap().timeout;
        scheduler.notify_change(Path::new("b"));
        let second_deadline = scheduler.inner.lock().unwrap().timeout;
        assert_eq!(first_deadline, second_deadline);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_without_a_pending_change() {
        let scheduler = CdpScheduler::spawn(upload_set(), Duration::from_secs(5));
        scheduler.shutdown();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(matches!(scheduler.inner.lock().unwrap().run_mode, RunMode::Quit));
    }
}
