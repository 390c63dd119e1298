use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use tokio::sync::watch;
use tracing::{info, warn};

use reverie_config::AppConfig;
use reverie_runtime::{JobContext, Scheduler, default_jobs};

use crate::{build_generator, build_model_embedder, durable_store};

const PID_FILE: &str = "reverie.pid";

/// Exclusive hold on `<data_dir>/reverie.pid`; released when dropped.
pub(crate) struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub(crate) fn acquire(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(PID_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        file.try_lock_exclusive()
            .map_err(|_| anyhow!("another scheduler already runs on {}", data_dir.display()))?;
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        Ok(Self { file, path })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
        let _ = FileExt::unlock(&self.file);
    }
}

pub(crate) async fn run(config: AppConfig) -> Result<()> {
    let data_dir = config.storage.data_path();
    let _instance = InstanceLock::acquire(&data_dir)?;

    let ctx = JobContext::open(&config, build_model_embedder(&config)?, build_generator(&config)?).await?;
    let scheduler = Scheduler::new(Arc::new(ctx), default_jobs(), &data_dir, durable_store(&config));

    let (tx, rx) = watch::channel(false);
    let driver = tokio::spawn(scheduler.run(rx));
    info!(pid = std::process::id(), data_dir = %data_dir.display(), "reverie running; ctrl-c to stop");

    shutdown_signal().await?;
    info!("shutdown requested");
    if tx.send(true).is_err() {
        warn!("scheduler already stopped");
    }
    driver.await??;
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            result = tokio::signal::ctrl_c() => result?,
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}
