//! Crash-safe JSON persistence.
//!
//! Crash-safety guarantee: new content is written to a uniquely named `.tmp`
//! sibling, `fsync`'d, re-parsed, and only then renamed over the target.  A
//! crash before the rename leaves the previous file untouched; a crash after
//! it leaves the new one.  The previous version is copied to `.bak` first, so
//! a target that is later damaged out-of-band can still be recovered.
//!
//! Readers may skip the lock: they see either the old or the new file, never
//! a partial one.  Writers go through [`DurableStore::update`], which holds
//! the resource's [`FileLock`] for the whole load → mutate → save cycle.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{IoContext, StoreError, StoreResult};
use crate::lock::{FileLock, LockOptions};
use crate::sidecar;

/// Where a loaded value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    /// The primary was missing or corrupt; the `.bak` sidecar was used.
    Backup,
    /// Neither file was usable (or neither existed).
    Default,
}

#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub value: T,
    pub source: LoadSource,
}

pub fn backup_path(path: &Path) -> PathBuf {
    sidecar(path, "bak")
}

#[derive(Debug, Clone, Default)]
pub struct DurableStore {
    lock: LockOptions,
}

impl DurableStore {
    pub fn new(lock: LockOptions) -> Self {
        Self { lock }
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock
    }

    /// Serialize `value` and atomically replace `path` with it.
    ///
    /// The caller is expected to hold the resource lock; see [`Self::update`].
    pub fn save<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|err| StoreError::Encode {
            what: "json document",
            reason: err.to_string(),
        })?;
        backup_if_valid(path, validate_json)?;
        write_atomic(path, &bytes, validate_json)
    }

    /// Load `path`, falling back to `.bak` and then to `default`.
    ///
    /// Only unrecoverable I/O failures are errors; corruption is logged and
    /// recovered.
    pub fn load<T: DeserializeOwned>(&self, path: &Path, default: T) -> StoreResult<T> {
        Ok(self.load_traced(path, || default)?.value)
    }

    pub fn load_traced<T, D>(&self, path: &Path, default: D) -> StoreResult<Loaded<T>>
    where
        T: DeserializeOwned,
        D: FnOnce() -> T,
    {
        let primary_problem = match read_json::<T>(path) {
            Ok(Some(value)) => {
                return Ok(Loaded {
                    value,
                    source: LoadSource::Primary,
                });
            }
            Ok(None) => None,
            Err(StoreError::Corruption { reason, .. }) => Some(reason),
            Err(err) => return Err(err),
        };

        let backup = backup_path(path);
        match read_bytes(&backup)? {
            Some(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    warn!(
                        path = %path.display(),
                        problem = primary_problem.as_deref().unwrap_or("missing"),
                        "recovered resource from backup"
                    );
                    self.repair_primary(path, &bytes);
                    return Ok(Loaded {
                        value,
                        source: LoadSource::Backup,
                    });
                }
                Err(err) => {
                    if primary_problem.is_some() {
                        warn!(
                            path = %path.display(),
                            backup_error = %err,
                            "primary and backup both corrupt; falling back to default"
                        );
                    }
                }
            },
            None => {
                if let Some(problem) = &primary_problem {
                    warn!(
                        path = %path.display(),
                        problem = %problem,
                        "corrupt resource with no backup; falling back to default"
                    );
                }
            }
        }

        Ok(Loaded {
            value: default(),
            source: LoadSource::Default,
        })
    }

    /// Lock `path`, load it (or `default`), apply `mutate`, save, unlock.
    ///
    /// Nothing is written when `mutate` fails.
    pub async fn update<T, R, D, F>(&self, path: &Path, default: D, mutate: F) -> StoreResult<R>
    where
        T: Serialize + DeserializeOwned,
        D: FnOnce() -> T,
        F: FnOnce(&mut T) -> StoreResult<R>,
    {
        let _guard = FileLock::acquire(path, &self.lock).await?;
        let mut value = self.load_traced(path, default)?.value;
        let out = mutate(&mut value)?;
        self.save(path, &value)?;
        Ok(out)
    }

    /// Run `body` while holding the lock for `path`.
    pub async fn locked<R>(&self, path: &Path, body: impl FnOnce() -> StoreResult<R>) -> StoreResult<R> {
        let _guard = FileLock::acquire(path, &self.lock).await?;
        body()
    }

    fn repair_primary(&self, path: &Path, bytes: &[u8]) {
        // Repair opportunistically: if a writer holds the lock, its save will
        // replace the damaged primary anyway.
        let guard = match FileLock::try_acquire(path, &self.lock) {
            Ok(Some(guard)) => guard,
            Ok(None) => return,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not lock resource for repair");
                return;
            }
        };
        match write_atomic(path, bytes, validate_json) {
            Ok(()) => info!(path = %path.display(), "primary repaired from backup"),
            Err(err) => warn!(path = %path.display(), error = %err, "primary repair failed"),
        }
        drop(guard);
    }
}

/// Strict read: `Ok(None)` when missing, `Corruption` when unparsable.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match read_bytes(path)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| StoreError::corruption(path, err)),
        None => Ok(None),
    }
}

pub(crate) fn read_bytes(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

pub(crate) fn validate_json(bytes: &[u8]) -> Result<(), String> {
    serde_json::from_slice::<serde::de::IgnoredAny>(bytes)
        .map(|_| ())
        .map_err(|err| err.to_string())
}

/// Write `bytes` to a fresh temporary sibling and fsync it.
pub(crate) fn stage(path: &Path, bytes: &[u8]) -> StoreResult<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "resource".to_string());
    let tmp = path.with_file_name(format!("{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let written = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.flush()?;
            file.sync_all()
        });
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(&tmp, err));
    }
    Ok(tmp)
}

/// Stage, validate by re-reading, then rename over `path`.
pub(crate) fn write_atomic(
    path: &Path,
    bytes: &[u8],
    validate: impl Fn(&[u8]) -> Result<(), String>,
) -> StoreResult<()> {
    let tmp = stage(path, bytes)?;
    let committed = fs::read(&tmp)
        .map_err(|err| StoreError::io(&tmp, err))
        .and_then(|staged| validate(&staged).map_err(|reason| StoreError::corruption(&tmp, reason)))
        .and_then(|()| fs::rename(&tmp, path).map_err(|err| StoreError::io(path, err)));
    if committed.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    committed
}

/// Copy the current `path` to its `.bak` sidecar, but only when it still
/// passes `validate`: a damaged primary must never clobber a good backup.
pub(crate) fn backup_if_valid(
    path: &Path,
    validate: impl Fn(&[u8]) -> Result<(), String>,
) -> StoreResult<bool> {
    let Some(current) = read_bytes(path)? else {
        return Ok(false);
    };
    if let Err(reason) = validate(&current) {
        warn!(path = %path.display(), reason = %reason, "not backing up corrupt primary");
        return Ok(false);
    }
    write_atomic(&backup_path(path), &current, |_| Ok(()))?;
    Ok(true)
}
