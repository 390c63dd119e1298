//! Flat L2 similarity index over embedded record text.
//!
//! The record store remains the **canonical source of truth**.  The index is
//! a derived pair of files that must agree with each other:
//!
//! | File                 | Content                                             |
//! |----------------------|-----------------------------------------------------|
//! | `vector_index.bin`   | bincode [`PersistedIndex`]: magic, dims, digest, vectors |
//! | `vector_mirror.json` | [`MirrorEntry`] per vector, same order              |
//!
//! If either file is unreadable, or the pair disagrees with itself or with the
//! store, the index is rebuilt from the store by re-embedding every record.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use reverie_llm::Embedder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::durable::{
    DurableStore, LoadSource, backup_if_valid, backup_path, read_bytes, validate_json, write_atomic,
};
use crate::error::{StoreError, StoreResult};
use crate::lock::FileLock;
use crate::schema::ThoughtRecord;
use crate::store::ThoughtStore;

pub const INDEX_FILE: &str = "vector_index.bin";
pub const MIRROR_FILE: &str = "vector_mirror.json";

const INDEX_MAGIC: u32 = 0x5256_4958;
const MAX_INDEX_BYTES: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorEntry {
    pub id: String,
    pub origin: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&ThoughtRecord> for MirrorEntry {
    fn from(record: &ThoughtRecord) -> Self {
        Self {
            id: record.id.clone(),
            origin: record.origin().to_string(),
            timestamp: record.timestamp,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedIndex {
    magic: u32,
    dimensions: u32,
    digest: [u8; 32],
    vectors: Vec<Vec<f32>>,
}

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_INDEX_BYTES>()
}

fn vectors_digest(vectors: &[Vec<f32>]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for vector in vectors {
        hasher.update((vector.len() as u64).to_le_bytes());
        for value in vector {
            hasher.update(value.to_le_bytes());
        }
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

pub fn encode_index(dimensions: usize, vectors: &[Vec<f32>]) -> StoreResult<Vec<u8>> {
    let persisted = PersistedIndex {
        magic: INDEX_MAGIC,
        dimensions: dimensions as u32,
        digest: vectors_digest(vectors),
        vectors: vectors.to_vec(),
    };
    bincode::serde::encode_to_vec(&persisted, bincode_config()).map_err(|err| StoreError::Encode {
        what: "vector index",
        reason: err.to_string(),
    })
}

/// Decode and verify an index file, returning `(dimensions, vectors)`.
pub fn decode_index(bytes: &[u8]) -> Result<(usize, Vec<Vec<f32>>), String> {
    let (persisted, read): (PersistedIndex, usize) =
        bincode::serde::decode_from_slice(bytes, bincode_config()).map_err(|err| err.to_string())?;
    if read != bytes.len() {
        return Err(format!("{} trailing bytes", bytes.len() - read));
    }
    if persisted.magic != INDEX_MAGIC {
        return Err("bad magic number".to_string());
    }
    let dimensions = persisted.dimensions as usize;
    if persisted.vectors.iter().any(|v| v.len() != dimensions) {
        return Err("vector length does not match header".to_string());
    }
    if vectors_digest(&persisted.vectors) != persisted.digest {
        return Err("digest mismatch".to_string());
    }
    Ok((dimensions, persisted.vectors))
}

pub(crate) fn validate_index(bytes: &[u8]) -> Result<(), String> {
    decode_index(bytes).map(|_| ())
}

fn file_stamp(path: &Path) -> Option<(u64, SystemTime)> {
    let meta = fs::metadata(path).ok()?;
    Some((meta.len(), meta.modified().ok()?))
}

/// Embed `text`, substituting a zero vector when the embedder fails or
/// returns the wrong number of dimensions.
pub async fn embed_or_zero(embedder: &dyn Embedder, dimensions: usize, text: &str) -> Vec<f32> {
    match embedder.embed(text).await {
        Ok(vector) if vector.len() == dimensions => vector,
        Ok(vector) => {
            warn!(
                expected = dimensions,
                actual = vector.len(),
                "embedding has wrong dimensions; using zero vector"
            );
            vec![0.0; dimensions]
        }
        Err(err) => {
            warn!(error = %err, "embedding failed; using zero vector");
            vec![0.0; dimensions]
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub entry: MirrorEntry,
    pub position: usize,
    /// Squared L2 distance to the query.
    pub distance: f32,
    /// `1 − d²/2` clamped to `[0, 1]`: cosine similarity for unit vectors.
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Loaded,
    Rebuilt { reason: String },
}

pub struct VectorIndex {
    index_path: PathBuf,
    mirror_path: PathBuf,
    dimensions: usize,
    vectors: Vec<Vec<f32>>,
    mirror: Vec<MirrorEntry>,
    embedder: Arc<dyn Embedder>,
    durable: DurableStore,
    stamp: Option<(u64, SystemTime)>,
}

impl VectorIndex {
    /// Load the persisted pair from `dir`, rebuilding from `store` when it is
    /// missing, corrupt, or inconsistent.
    pub async fn open(
        dir: &Path,
        embedder: Arc<dyn Embedder>,
        durable: DurableStore,
        store: &ThoughtStore,
    ) -> StoreResult<(Self, OpenOutcome)> {
        let mut index = Self {
            index_path: dir.join(INDEX_FILE),
            mirror_path: dir.join(MIRROR_FILE),
            dimensions: embedder.dimensions(),
            vectors: Vec::new(),
            mirror: Vec::new(),
            embedder,
            durable,
            stamp: None,
        };

        let problem = match index.read_persisted() {
            Ok((vectors, mirror)) => {
                index.vectors = vectors;
                index.mirror = mirror;
                index.stamp = file_stamp(&index.index_path);
                match index.check_consistent() {
                    Ok(()) => index.diff_against_store(store)?,
                    Err(err) => Some(err.to_string()),
                }
            }
            Err(reason) => Some(reason),
        };

        match problem {
            None => {
                info!(entries = index.len(), path = %index.index_path.display(), "vector index loaded");
                Ok((index, OpenOutcome::Loaded))
            }
            Some(reason) => {
                warn!(reason = %reason, "vector index unusable; rebuilding from record store");
                index.rebuild_from_store(store).await?;
                Ok((index, OpenOutcome::Rebuilt { reason }))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn mirror_len(&self) -> usize {
        self.mirror.len()
    }

    pub fn mirror(&self) -> &[MirrorEntry] {
        &self.mirror
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub async fn embed(&self, text: &str) -> Vec<f32> {
        embed_or_zero(self.embedder.as_ref(), self.dimensions, text).await
    }

    pub fn check_consistent(&self) -> StoreResult<()> {
        if self.vectors.len() != self.mirror.len() {
            return Err(StoreError::IndexInconsistency {
                index_len: self.vectors.len(),
                mirror_len: self.mirror.len(),
            });
        }
        Ok(())
    }

    /// Append one vector and its mirror entry, then persist both.
    pub async fn add(&mut self, entry: MirrorEntry, vector: Vec<f32>) -> StoreResult<()> {
        if vector.len() != self.dimensions {
            return Err(StoreError::Dimension {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }

        let _guard = FileLock::acquire(&self.index_path, self.durable.lock_options()).await?;
        self.reload_if_changed();

        self.vectors.push(vector);
        self.mirror.push(entry);
        if let Err(err) = self.persist() {
            self.vectors.pop();
            self.mirror.pop();
            return Err(err);
        }
        Ok(())
    }

    /// The stored vector for each mirrored id.
    pub(crate) fn vectors_by_id(&self) -> HashMap<&str, &[f32]> {
        self.mirror
            .iter()
            .zip(&self.vectors)
            .map(|(entry, vector)| (entry.id.as_str(), vector.as_slice()))
            .collect()
    }

    /// The `k` nearest entries to `query`, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<IndexHit> {
        if query.len() != self.dimensions {
            warn!(
                expected = self.dimensions,
                actual = query.len(),
                "query vector has wrong dimensions"
            );
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(position, vector)| (position, squared_l2(query, vector)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));

        scored
            .into_iter()
            .take(k)
            .filter_map(|(position, distance)| {
                let entry = self.mirror.get(position)?.clone();
                Some(IndexHit {
                    entry,
                    position,
                    distance,
                    similarity: (1.0 - f64::from(distance) / 2.0).clamp(0.0, 1.0),
                })
            })
            .collect()
    }

    /// Re-embed every stored record and replace the persisted pair.
    pub async fn rebuild_from_store(&mut self, store: &ThoughtStore) -> StoreResult<usize> {
        let _guard = FileLock::acquire(&self.index_path, self.durable.lock_options()).await?;
        let records = store.load_all()?;

        let mut vectors = Vec::with_capacity(records.len());
        let mut mirror = Vec::with_capacity(records.len());
        for record in &records {
            vectors.push(self.embed(&record.text).await);
            mirror.push(MirrorEntry::from(record));
        }

        let previous = (
            std::mem::replace(&mut self.vectors, vectors),
            std::mem::replace(&mut self.mirror, mirror),
        );
        if let Err(err) = self.persist() {
            (self.vectors, self.mirror) = previous;
            return Err(err);
        }

        info!(entries = records.len(), path = %self.index_path.display(), "vector index rebuilt");
        Ok(records.len())
    }

    fn read_persisted(&self) -> Result<(Vec<Vec<f32>>, Vec<MirrorEntry>), String> {
        let index_bytes = read_bytes(&self.index_path).map_err(|err| err.to_string())?;
        let vectors = match index_bytes {
            Some(bytes) => {
                let (dimensions, vectors) = decode_index(&bytes)?;
                if dimensions != self.dimensions {
                    return Err(format!(
                        "index built with {dimensions} dimensions, embedder has {}",
                        self.dimensions
                    ));
                }
                vectors
            }
            None => Vec::new(),
        };

        let mirror_existed = self.mirror_path.exists() || backup_path(&self.mirror_path).exists();
        let mirror = self
            .durable
            .load_traced(&self.mirror_path, Vec::new)
            .map_err(|err| err.to_string())?;
        if mirror.source == LoadSource::Default && mirror_existed {
            return Err("vector mirror unreadable".to_string());
        }
        Ok((vectors, mirror.value))
    }

    /// `Some(reason)` when the mirror does not describe exactly the records
    /// in the store.
    fn diff_against_store(&self, store: &ThoughtStore) -> StoreResult<Option<String>> {
        let stored = store.ids()?;
        if stored.len() != self.mirror.len() {
            return Ok(Some(format!(
                "mirror holds {} entries, store holds {}",
                self.mirror.len(),
                stored.len()
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &self.mirror {
            if !stored.contains(&entry.id) || !seen.insert(entry.id.as_str()) {
                return Ok(Some(format!("mirror entry {} does not match the store", entry.id)));
            }
        }
        Ok(None)
    }

    /// Pick up appends made by another process since we last read or wrote
    /// the index.  Both files are replaced by rename, so a reader without
    /// the lock sees either the old pair or the new one; a torn pair is
    /// rejected by the length check.
    pub(crate) fn reload_if_changed(&mut self) {
        let current = file_stamp(&self.index_path);
        if current.is_none() || current == self.stamp {
            return;
        }
        match self.read_persisted() {
            Ok((vectors, mirror)) if vectors.len() == mirror.len() => {
                self.vectors = vectors;
                self.mirror = mirror;
                self.stamp = current;
            }
            Ok(_) | Err(_) => {
                warn!(path = %self.index_path.display(), "persisted index changed but is unusable; keeping in-memory copy");
            }
        }
    }

    /// Back up and write the index, then the mirror.  If either step fails
    /// the backups are restored, and a file this save created from nothing
    /// is removed, so the pair never disagrees on disk.
    fn persist(&mut self) -> StoreResult<()> {
        let index_bytes = encode_index(self.dimensions, &self.vectors)?;
        let mirror_bytes = serde_json::to_vec_pretty(&self.mirror).map_err(|err| StoreError::Encode {
            what: "vector mirror",
            reason: err.to_string(),
        })?;

        let index_existed = self.index_path.exists();
        let index_backed_up = backup_if_valid(&self.index_path, validate_index)?;

        // (existed, backed up) for the mirror, once the index write is done.
        let mut mirror_state = None;
        let written = write_atomic(&self.index_path, &index_bytes, validate_index).and_then(|()| {
            let existed = self.mirror_path.exists();
            let backed_up = backup_if_valid(&self.mirror_path, validate_json)?;
            mirror_state = Some((existed, backed_up));
            write_atomic(&self.mirror_path, &mirror_bytes, validate_json)
        });

        if let Err(err) = written {
            warn!(error = %err, "vector index save failed; restoring previous pair");
            if index_backed_up {
                restore_from_backup(&self.index_path, validate_index);
            } else if !index_existed {
                remove_orphan(&self.index_path);
            }
            match mirror_state {
                Some((_, true)) => restore_from_backup(&self.mirror_path, validate_json),
                Some((false, false)) => remove_orphan(&self.mirror_path),
                _ => {}
            }
            return Err(err);
        }

        self.stamp = file_stamp(&self.index_path);
        Ok(())
    }
}

fn restore_from_backup(path: &Path, validate: fn(&[u8]) -> Result<(), String>) {
    let restored = read_bytes(&backup_path(path)).and_then(|bytes| match bytes {
        Some(bytes) => write_atomic(path, &bytes, validate),
        None => Ok(()),
    });
    if let Err(err) = restored {
        warn!(path = %path.display(), error = %err, "could not restore backup");
    }
}

/// Remove a file this save created before failing, so no half of a new
/// pair is left without its partner.
fn remove_orphan(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "could not remove orphaned file"),
    }
}

pub(crate) fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
