pub mod concepts;
pub mod durable;
pub mod error;
pub mod graph;
pub mod integrity;
pub mod lock;
pub mod manager;
pub mod schema;
pub mod store;
pub mod vector_index;

use std::path::{Path, PathBuf};

pub use concepts::{CLUSTERS_FILE, ConceptCluster, ConceptMap, ConceptStore};
pub use durable::{DurableStore, LoadSource, Loaded};
pub use error::{StoreError, StoreResult};
pub use graph::{AssociationGraph, Neighbor};
pub use integrity::{AuditReport, FileAudit, FileOutcome, IntegrityAuditor, run_integrity_audit};
pub use lock::{FileLock, LockOptions};
pub use manager::{GraphParams, MemoryGraph, MemoryStats, THOUGHTS_FILE};
pub use schema::{Connection, Origin, ThoughtRecord, origin_metadata};
pub use store::{DecayPolicy, DecayReport, ThoughtStore};
pub use vector_index::{INDEX_FILE, MIRROR_FILE, OpenOutcome, VectorIndex};

/// `path` with `.suffix` appended to its file name: `a/b.json` → `a/b.json.bak`.
pub fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
