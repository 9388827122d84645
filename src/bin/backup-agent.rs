//! Thin binary entry point: reads the config file, wires the cache, object
//! store client, upload-set manager and CDP scheduler together, and runs
//! until interrupted. All actual logic lives in the library.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use backup_agent::backup::{CdpScheduler, FsCache, PlatformMonitor, UploadSetManager};
use backup_agent::client::ObjectStoreClient;
use backup_agent::config::{ClientConfig, DeviceContext};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/backup-agent/config.toml"));
    let config = ClientConfig::load(&config_path)?;
    let device = DeviceContext::from(config);

    let cache = Arc::new(FsCache::open(&device.cache_path).with_context(|| format!("opening cache at {}", device.cache_path.display()))?);
    let store = ObjectStoreClient::new(device.server_url.clone());
    let upload_set = UploadSetManager::new(cache, store, device.device_id.clone());
    upload_set.set_workers(device.workers);

    let monitor = Arc::new(PlatformMonitor::new().context("initializing directory monitor")?);
    upload_set.set_monitor(monitor);

    for root in &device.backup_roots {
        upload_set.add_upload_root(root.clone()).with_context(|| format!("adding backup root {}", root.display()))?;
    }

    let scheduler = CdpScheduler::spawn(upload_set.clone(), device.debounce);
    log::info!("backup agent started for device {}", device.device_id);

    upload_set.start_upload_all_roots().await?;

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    log::info!("shutting down");
    scheduler.shutdown();

    Ok(())
}
