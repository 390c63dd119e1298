//! Advisory, file-scoped mutual exclusion with staleness recovery.
//!
//! A lock on `thoughts.json` is the marker file `thoughts.json.lock`, created
//! with create-new semantics so exactly one contender wins.  The marker
//! records who holds it and since when; a marker older than the staleness
//! threshold is presumed abandoned (its holder crashed) and reclaimed.
//! Reclaim itself is serialized by an OS lock on `thoughts.json.lock.reclaim`.
//!
//! [`FileLock`] is a guard: dropping it releases the marker, so every exit
//! path (error, early return, task cancellation) gives the lock back.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use reverie_config::StorageConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{IoContext, StoreError, StoreResult};
use crate::sidecar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(300),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl From<&StorageConfig> for LockOptions {
    fn from(storage: &StorageConfig) -> Self {
        Self {
            timeout: storage.lock_timeout(),
            stale_after: storage.lock_stale_after(),
            poll_interval: storage.lock_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockMarker {
    pid: u32,
    host: String,
    token: String,
    acquired_at: DateTime<Utc>,
}

pub fn lock_path_for(resource: &Path) -> PathBuf {
    sidecar(resource, "lock")
}

#[derive(Debug)]
pub struct FileLock {
    marker: PathBuf,
    token: String,
    released: bool,
}

impl FileLock {
    /// Single non-blocking attempt.  `Ok(None)` means someone else holds a
    /// fresh marker.
    pub fn try_acquire(resource: &Path, options: &LockOptions) -> StoreResult<Option<Self>> {
        let marker = lock_path_for(resource);
        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }

        match create_marker(&marker) {
            Ok(token) => Ok(Some(Self::held(marker, token))),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if !reclaim_if_stale(&marker, options.stale_after)? {
                    return Ok(None);
                }
                match create_marker(&marker) {
                    Ok(token) => Ok(Some(Self::held(marker, token))),
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
                    Err(err) => Err(StoreError::io(marker, err)),
                }
            }
            Err(err) => Err(StoreError::io(marker, err)),
        }
    }

    /// Poll until the lock is ours or `options.timeout` elapses.
    pub async fn acquire(resource: &Path, options: &LockOptions) -> StoreResult<Self> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(resource, options)? {
                return Ok(lock);
            }
            let waited = started.elapsed();
            if waited >= options.timeout {
                return Err(StoreError::LockTimeout {
                    path: resource.to_path_buf(),
                    waited,
                });
            }
            let remaining = options.timeout - waited;
            tokio::time::sleep(options.poll_interval.min(remaining)).await;
        }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    /// Remove the marker if it is still ours.  Calling this on an already
    /// released lock, or after the marker vanished, is a no-op.
    pub fn release(mut self) -> StoreResult<()> {
        self.release_inner()
    }

    fn held(marker: PathBuf, token: String) -> Self {
        debug!(marker = %marker.display(), "lock acquired");
        Self {
            marker,
            token,
            released: false,
        }
    }

    fn release_inner(&mut self) -> StoreResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        match read_marker(&self.marker) {
            Ok(Some(marker)) if marker.token == self.token => remove_if_present(&self.marker),
            Ok(Some(marker)) => {
                warn!(
                    marker = %self.marker.display(),
                    holder_pid = marker.pid,
                    "lock was reclaimed by another holder; leaving its marker in place"
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(StoreError::Corruption { .. }) => {
                // A competitor is mid-way through writing a fresh marker.
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(marker = %self.marker.display(), error = %err, "failed to release lock");
        }
    }
}

fn create_marker(path: &Path) -> std::io::Result<String> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let marker = LockMarker {
        pid: std::process::id(),
        host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        token: Uuid::new_v4().to_string(),
        acquired_at: Utc::now(),
    };

    let written = serde_json::to_vec(&marker)
        .map_err(std::io::Error::other)
        .and_then(|bytes| file.write_all(&bytes))
        .and_then(|_| file.sync_all());
    if let Err(err) = written {
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(marker.token)
}

fn read_marker(path: &Path) -> StoreResult<Option<LockMarker>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| StoreError::corruption(path, err)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

/// Age of a marker whose raw content is `bytes`.  An unreadable stamp falls
/// back to the file's modification time.
fn marker_age(path: &Path, bytes: &[u8]) -> StoreResult<Option<Duration>> {
    if let Ok(marker) = serde_json::from_slice::<LockMarker>(bytes) {
        let age = Utc::now().signed_duration_since(marker.acquired_at);
        return Ok(Some(age.to_std().unwrap_or(Duration::ZERO)));
    }
    match fs::metadata(path) {
        Ok(meta) => {
            let modified = meta.modified().at(path)?;
            Ok(Some(
                SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO),
            ))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

fn read_raw(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

/// Returns `true` when the caller should retry creation: the marker was
/// stale and has been removed, or it disappeared on its own.
///
/// Reclaimers serialize on an OS lock over `<marker>.reclaim`, so only one
/// contender at a time judges and removes a marker.  The marker is re-read
/// under that lock and removed only when its content is still the stale
/// content that was judged.
fn reclaim_if_stale(marker: &Path, stale_after: Duration) -> StoreResult<bool> {
    let Some(seen) = read_raw(marker)? else {
        return Ok(true);
    };
    match marker_age(marker, &seen)? {
        None => return Ok(true),
        Some(age) if age < stale_after => return Ok(false),
        Some(_) => {}
    }

    let gate_path = sidecar(marker, "reclaim");
    let gate = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&gate_path)
        .at(&gate_path)?;
    if gate.try_lock_exclusive().is_err() {
        debug!(marker = %marker.display(), "another contender is reclaiming");
        return Ok(false);
    }

    let outcome = reclaim_under_gate(marker, stale_after);
    if let Err(err) = FileExt::unlock(&gate) {
        warn!(gate = %gate_path.display(), error = %err, "could not unlock reclaim gate");
    }
    outcome
}

fn reclaim_under_gate(marker: &Path, stale_after: Duration) -> StoreResult<bool> {
    let Some(judged) = read_raw(marker)? else {
        return Ok(true);
    };
    let age = match marker_age(marker, &judged)? {
        None => return Ok(true),
        Some(age) if age < stale_after => return Ok(false),
        Some(age) => age,
    };

    match read_raw(marker)? {
        Some(current) if current == judged => {}
        Some(_) => return Ok(false),
        None => return Ok(true),
    }
    remove_if_present(marker)?;
    warn!(
        marker = %marker.display(),
        age_secs = age.as_secs(),
        "reclaimed stale lock marker"
    );
    Ok(true)
}

fn remove_if_present(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::io(path, err)),
    }
}
