//! Periodic validation and repair of everything persisted in the data
//! directory.
//!
//! Each `*.json` / `*.bin` resource is parsed.  A broken resource is restored
//! from its `.bak` sidecar when that parses; otherwise critical resources are
//! reset to a registered default and derived ones (the vector index pair) are
//! left for the next index open to rebuild.  Leftover `.tmp` files from
//! interrupted saves are swept once they are older than the lock staleness
//! threshold.  Any issue triggers a snapshot of the whole directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::concepts::{CLUSTERS_FILE, ConceptMap};
use crate::durable::{DurableStore, backup_path, read_bytes, validate_json, write_atomic};
use crate::error::{IoContext, StoreError, StoreResult};
use crate::graph::{ASSOCIATIONS_FILE, AssociationFile};
use crate::lock::FileLock;
use crate::manager::THOUGHTS_FILE;
use crate::vector_index::{INDEX_FILE, MIRROR_FILE, validate_index};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Ok,
    RestoredFromBackup,
    InitializedDefault,
    /// Derived data; the owning component rebuilds it on next open.
    RebuildRequired,
    Unrepaired { reason: String },
}

impl FileOutcome {
    fn is_issue(&self) -> bool {
        !matches!(self, Self::Ok)
    }

    fn is_repair(&self) -> bool {
        matches!(self, Self::RestoredFromBackup | Self::InitializedDefault)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileAudit {
    pub file: String,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub started_at: DateTime<Utc>,
    pub files_checked: usize,
    pub issues_found: usize,
    pub repairs_made: usize,
    pub temp_files_removed: usize,
    pub snapshot: Option<PathBuf>,
    pub files: Vec<FileAudit>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.issues_found == 0
    }
}

enum Class {
    Critical(serde_json::Value),
    Derived,
    Other,
}

pub struct IntegrityAuditor {
    data_dir: PathBuf,
    snapshot_root: PathBuf,
    durable: DurableStore,
    critical: BTreeMap<String, serde_json::Value>,
}

impl IntegrityAuditor {
    /// An auditor that already knows the memory layer's critical files.
    /// Other components register theirs with [`Self::with_critical`].
    pub fn new(data_dir: impl Into<PathBuf>, snapshot_root: impl Into<PathBuf>, durable: DurableStore) -> Self {
        let mut critical = BTreeMap::new();
        critical.insert(THOUGHTS_FILE.to_string(), serde_json::json!([]));
        critical.insert(
            ASSOCIATIONS_FILE.to_string(),
            serde_json::to_value(AssociationFile::default()).unwrap_or_else(|_| serde_json::json!({})),
        );
        critical.insert(
            CLUSTERS_FILE.to_string(),
            serde_json::to_value(ConceptMap::default()).unwrap_or_else(|_| serde_json::json!({})),
        );
        Self {
            data_dir: data_dir.into(),
            snapshot_root: snapshot_root.into(),
            durable,
            critical,
        }
    }

    /// Register `file` (a name inside the data directory) as critical, reset
    /// to `default` when neither it nor its backup parses.
    pub fn with_critical(mut self, file: impl Into<String>, default: serde_json::Value) -> Self {
        self.critical.insert(file.into(), default);
        self
    }

    pub async fn audit(&self) -> StoreResult<AuditReport> {
        let started_at = Utc::now();
        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir).at(&self.data_dir)?;
        }

        let temp_files_removed = self.sweep_temp_files();
        let mut files = Vec::new();
        for path in self.resources() {
            let name = file_name(&path);
            let outcome = self.check(&path, &name).await;
            match &outcome {
                FileOutcome::Ok => debug!(file = %name, "resource ok"),
                FileOutcome::Unrepaired { reason } => warn!(file = %name, reason = %reason, "resource left unrepaired"),
                other => warn!(file = %name, outcome = ?other, "resource repaired"),
            }
            files.push(FileAudit { file: name, outcome });
        }

        // A critical file that does not exist at all is not an issue: the
        // owning component creates it on first write.
        let issues_found = files.iter().filter(|f| f.outcome.is_issue()).count();
        let repairs_made = files.iter().filter(|f| f.outcome.is_repair()).count();

        let snapshot = if issues_found > 0 {
            match self.snapshot(started_at) {
                Ok(dir) => Some(dir),
                Err(err) => {
                    warn!(error = %err, "integrity snapshot failed");
                    None
                }
            }
        } else {
            None
        };

        let report = AuditReport {
            started_at,
            files_checked: files.len(),
            issues_found,
            repairs_made,
            temp_files_removed,
            snapshot,
            files,
        };
        info!(
            files_checked = report.files_checked,
            issues_found = report.issues_found,
            repairs_made = report.repairs_made,
            temp_files_removed = report.temp_files_removed,
            "integrity audit complete"
        );
        Ok(report)
    }

    fn resources(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = WalkDir::new(&self.data_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| matches!(extension(path).as_deref(), Some("json" | "bin")))
            .collect();
        out.sort();
        out
    }

    fn classify(&self, name: &str) -> Class {
        if let Some(default) = self.critical.get(name) {
            Class::Critical(default.clone())
        } else if name == INDEX_FILE || name == MIRROR_FILE {
            Class::Derived
        } else {
            Class::Other
        }
    }

    async fn check(&self, path: &Path, name: &str) -> FileOutcome {
        let validate = validator_for(path);
        let problem = match read_bytes(path) {
            Ok(Some(bytes)) => match validate(&bytes) {
                Ok(()) => return FileOutcome::Ok,
                Err(reason) => reason,
            },
            Ok(None) => return FileOutcome::Ok,
            Err(err) => return FileOutcome::Unrepaired { reason: err.to_string() },
        };
        debug!(file = %name, problem = %problem, "resource failed to parse");

        match self.restore(path, validate).await {
            Ok(true) => return FileOutcome::RestoredFromBackup,
            Ok(false) => {}
            Err(err) => return FileOutcome::Unrepaired { reason: err.to_string() },
        }

        match self.classify(name) {
            Class::Critical(default) => match self.reset(path, &default).await {
                Ok(()) => FileOutcome::InitializedDefault,
                Err(err) => FileOutcome::Unrepaired { reason: err.to_string() },
            },
            Class::Derived => FileOutcome::RebuildRequired,
            Class::Other => FileOutcome::Unrepaired { reason: problem },
        }
    }

    /// Copy a parsable `.bak` over `path` under the resource lock.
    async fn restore(&self, path: &Path, validate: fn(&[u8]) -> Result<(), String>) -> StoreResult<bool> {
        let Some(backup) = read_bytes(&backup_path(path))? else {
            return Ok(false);
        };
        if validate(&backup).is_err() {
            return Ok(false);
        }
        let _guard = FileLock::acquire(path, self.durable.lock_options()).await?;
        write_atomic(path, &backup, validate)?;
        Ok(true)
    }

    async fn reset(&self, path: &Path, default: &serde_json::Value) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(default).map_err(|err| StoreError::Encode {
            what: "default resource",
            reason: err.to_string(),
        })?;
        let _guard = FileLock::acquire(path, self.durable.lock_options()).await?;
        write_atomic(path, &bytes, validate_json)
    }

    /// Remove `*.tmp` leftovers older than the lock staleness threshold.
    /// Younger ones may belong to a save in progress.
    fn sweep_temp_files(&self) -> usize {
        let stale_after = self.durable.lock_options().stale_after;
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in WalkDir::new(&self.data_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if !entry.file_type().is_file() || extension(path).as_deref() != Some("tmp") {
                continue;
            }
            let age = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age >= stale_after) {
                match fs::remove_file(path) {
                    Ok(()) => {
                        removed += 1;
                        info!(path = %path.display(), "removed orphaned temporary file");
                    }
                    Err(err) => warn!(path = %path.display(), error = %err, "could not remove temporary file"),
                }
            }
        }
        removed
    }

    /// Copy every regular file of the data directory (except lock markers
    /// and temporaries) to a fresh `integrity_<timestamp>` directory.
    fn snapshot(&self, at: DateTime<Utc>) -> StoreResult<PathBuf> {
        let stem = format!("integrity_{}", at.format("%Y%m%d_%H%M%S"));
        let mut dir = self.snapshot_root.join(&stem);
        let mut n = 1;
        while dir.exists() {
            dir = self.snapshot_root.join(format!("{stem}_{n}"));
            n += 1;
        }
        fs::create_dir_all(&dir).at(&dir)?;

        let mut copied = 0usize;
        for entry in WalkDir::new(&self.data_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
        {
            let path = entry.path();
            if matches!(extension(path).as_deref(), Some("lock" | "tmp" | "reclaim")) {
                continue;
            }
            let target = dir.join(entry.file_name());
            fs::copy(path, &target).at(path)?;
            copied += 1;
        }
        info!(snapshot = %dir.display(), files = copied, "integrity snapshot written");
        Ok(dir)
    }
}

/// Audit `data_dir` with only the memory layer's critical files registered.
pub async fn run_integrity_audit(
    data_dir: impl Into<PathBuf>,
    snapshot_root: impl Into<PathBuf>,
    durable: DurableStore,
) -> StoreResult<AuditReport> {
    IntegrityAuditor::new(data_dir, snapshot_root, durable).audit().await
}

fn validator_for(path: &Path) -> fn(&[u8]) -> Result<(), String> {
    if extension(path).as_deref() == Some("bin") {
        validate_index
    } else {
        validate_json
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension().map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::stage;
    use crate::lock::LockOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    fn auditor(dir: &TempDir) -> IntegrityAuditor {
        IntegrityAuditor::new(dir.path().join("data"), dir.path().join("snapshots"), DurableStore::default())
            .with_critical("scheduler_state.json", serde_json::json!({}))
    }

    fn outcome<'a>(report: &'a AuditReport, file: &str) -> &'a FileOutcome {
        &report.files.iter().find(|f| f.file == file).unwrap().outcome
    }

    #[tokio::test]
    async fn clean_directory_reports_nothing_and_takes_no_snapshot() {
        let dir = TempDir::new().unwrap();
        let auditor = auditor(&dir);
        let durable = DurableStore::default();
        durable
            .save(&dir.path().join("data/thoughts.json"), &serde_json::json!([]))
            .unwrap();

        let report = auditor.audit().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.files_checked, 1);
        assert_eq!(report.snapshot, None);
        assert!(!dir.path().join("snapshots").exists());
    }

    #[tokio::test]
    async fn restores_from_backup_and_snapshots() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        let durable = DurableStore::default();
        let state = data.join("scheduler_state.json");
        durable.save(&state, &serde_json::json!({"last_dream": "2024-01-01T00:00:00Z"})).unwrap();
        durable.save(&state, &serde_json::json!({"last_dream": "2024-01-02T00:00:00Z"})).unwrap();
        fs::write(&state, b"{\"last_dream\": ").unwrap();

        let report = auditor(&dir).audit().await.unwrap();
        assert_eq!(outcome(&report, "scheduler_state.json"), &FileOutcome::RestoredFromBackup);
        assert_eq!(report.issues_found, 1);
        assert_eq!(report.repairs_made, 1);

        let restored: serde_json::Value = serde_json::from_slice(&fs::read(&state).unwrap()).unwrap();
        assert_eq!(restored["last_dream"], "2024-01-01T00:00:00Z");

        let snapshot = report.snapshot.unwrap();
        assert!(snapshot.file_name().unwrap().to_string_lossy().starts_with("integrity_"));
        assert!(snapshot.join("scheduler_state.json").exists());
        assert!(snapshot.join("scheduler_state.json.bak").exists());
    }

    #[tokio::test]
    async fn critical_file_without_backup_gets_default() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("thoughts.json"), b"[{\"id\":").unwrap();

        let report = auditor(&dir).audit().await.unwrap();
        assert_eq!(outcome(&report, "thoughts.json"), &FileOutcome::InitializedDefault);
        assert_eq!(fs::read_to_string(data.join("thoughts.json")).unwrap().trim(), "[]");
    }

    #[tokio::test]
    async fn torn_concept_clusters_reset_to_empty_map() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join(CLUSTERS_FILE), b"{\"clusters\": [").unwrap();

        let report = auditor(&dir).audit().await.unwrap();
        assert_eq!(outcome(&report, CLUSTERS_FILE), &FileOutcome::InitializedDefault);
        let map: ConceptMap = serde_json::from_slice(&fs::read(data.join(CLUSTERS_FILE)).unwrap()).unwrap();
        assert!(map.clusters.is_empty());
    }

    #[tokio::test]
    async fn derived_and_unknown_files_are_reported() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join(INDEX_FILE), b"garbage").unwrap();
        fs::write(data.join("notes.json"), b"{{").unwrap();

        let report = auditor(&dir).audit().await.unwrap();
        assert_eq!(outcome(&report, INDEX_FILE), &FileOutcome::RebuildRequired);
        assert!(matches!(outcome(&report, "notes.json"), FileOutcome::Unrepaired { .. }));
        assert_eq!(report.issues_found, 2);
        assert_eq!(report.repairs_made, 0);
        assert!(report.snapshot.is_some());
    }

    #[tokio::test]
    async fn sweeps_only_stale_temp_files() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        let target = data.join("thoughts.json");
        let fresh = stage(&target, b"[]").unwrap();

        let patient = IntegrityAuditor::new(&data, dir.path().join("snapshots"), DurableStore::default());
        assert_eq!(patient.audit().await.unwrap().temp_files_removed, 0);
        assert!(fresh.exists());

        let eager = IntegrityAuditor::new(
            &data,
            dir.path().join("snapshots"),
            DurableStore::new(LockOptions {
                stale_after: Duration::ZERO,
                ..LockOptions::default()
            }),
        );
        let report = eager.audit().await.unwrap();
        assert_eq!(report.temp_files_removed, 1);
        assert!(!fresh.exists());
        assert!(!target.exists());
    }
}
