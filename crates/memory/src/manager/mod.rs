use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reverie_llm::Embedder;
use tracing::{debug, info, warn};

use crate::concepts::ConceptStore;
use crate::durable::DurableStore;
use crate::error::StoreResult;
use crate::graph::{AssociationGraph, Edge};
use crate::lock::LockOptions;
use crate::schema::ThoughtRecord;
use crate::store::ThoughtStore;
use crate::vector_index::{MirrorEntry, OpenOutcome, VectorIndex};

mod concepts;
mod linking;
mod maintenance;
mod retrieval;

pub use linking::{GraphParams, StrengthBreakdown};

pub const THOUGHTS_FILE: &str = "thoughts.json";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStats {
    pub records: usize,
    pub index_size: usize,
    pub mirror_len: usize,
    pub edges: usize,
    pub linked_records: usize,
    pub mean_activation: f64,
    pub newest: Option<DateTime<Utc>>,
}

/// Facade over the record store, the vector index and the association
/// graph.  Collaborators only ever talk to this type.
pub struct MemoryGraph {
    data_dir: PathBuf,
    store: ThoughtStore,
    index: VectorIndex,
    graph: AssociationGraph,
    concepts: ConceptStore,
    params: GraphParams,
    index_outcome: OpenOutcome,
}

impl MemoryGraph {
    /// Open (or create) the memory under `data_dir`.  The embedder is used
    /// for every insertion and query, and for index rebuilds.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        embedder: Arc<dyn Embedder>,
        params: GraphParams,
        lock: LockOptions,
    ) -> StoreResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let durable = DurableStore::new(lock);
        let store = ThoughtStore::new(data_dir.join(THOUGHTS_FILE), durable.clone());

        let (index, index_outcome) =
            VectorIndex::open(&data_dir, embedder, durable.clone(), &store).await?;
        let records = store.load_all()?;
        let graph = AssociationGraph::open(&data_dir, durable.clone(), &records).await?;
        let concepts = ConceptStore::new(&data_dir, durable);

        info!(
            dir = %data_dir.display(),
            records = records.len(),
            vectors = index.len(),
            edges = graph.edge_count(),
            "memory graph opened"
        );
        Ok(Self {
            data_dir,
            store,
            index,
            graph,
            concepts,
            params,
            index_outcome,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn params(&self) -> &GraphParams {
        &self.params
    }

    /// Whether the vector index was loaded as-is or rebuilt on open.
    pub fn index_outcome(&self) -> &OpenOutcome {
        &self.index_outcome
    }

    /// Persist a new record, link it to its nearest neighbours and return it
    /// with its connections populated.
    pub async fn save_record(
        &mut self,
        text: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> StoreResult<ThoughtRecord> {
        self.save_record_at(text, metadata, Utc::now()).await
    }

    /// [`Self::save_record`] with an explicit creation instant.
    pub async fn save_record_at(
        &mut self,
        text: &str,
        metadata: BTreeMap<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<ThoughtRecord> {
        let mut record = ThoughtRecord::new(text, metadata, timestamp);
        let vector = self.index.embed(&record.text).await;

        // Searching before the add keeps the record out of its own candidates.
        // Hits the store no longer knows (a stale index) are never linked.
        self.index.reload_if_changed();
        let known = self.store.ids()?;
        let now = Utc::now();
        record.connections = self
            .index
            .search(&vector, self.params.candidates)
            .iter()
            .filter(|hit| known.contains(&hit.entry.id))
            .filter_map(|hit| self.params.link(&record, hit, now))
            .collect();

        let count = self.store.append(record.clone()).await?;
        debug!(
            id = %record.id_short(),
            origin = record.origin(),
            connections = record.connections.len(),
            "record stored"
        );

        // The store is canonical; a failed index or graph update is repaired
        // by the rebuild paths on the next open.
        if let Err(err) = self.index.add(MirrorEntry::from(&record), vector).await {
            warn!(id = %record.id, error = %err, "vector index update failed; index will be rebuilt on next open");
        }
        let edges: Vec<Edge> = record
            .connections
            .iter()
            .map(|c| Edge {
                to: c.target_id.clone(),
                strength: c.strength,
                kind: c.kind.clone(),
            })
            .collect();
        if let Err(err) = self.graph.add_edges(&record.id, &edges).await {
            warn!(id = %record.id, error = %err, "association graph update failed");
        }

        if self.params.decay_every > 0 && count % self.params.decay_every == 0 {
            self.decay_at(now.max(timestamp)).await?;
            if let Some(stored) = self.store.get(&record.id)? {
                record = stored;
            }
        }
        if self.params.cluster_every > 0 && count % self.params.cluster_every == 0 {
            if let Err(err) = self.update_concept_clusters().await {
                warn!(error = %err, "concept cluster update failed");
            }
        }
        Ok(record)
    }

    pub fn load_record_by_id(&self, id: &str) -> StoreResult<Option<ThoughtRecord>> {
        self.store.get(id)
    }

    /// The `n` most recent records, newest first.
    pub fn recent(&self, n: usize) -> StoreResult<Vec<ThoughtRecord>> {
        let mut records = self.store.load_all()?;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(n);
        Ok(records)
    }

    pub fn stats(&self) -> StoreResult<MemoryStats> {
        let records = self.store.load_all()?;
        let total_activation: f64 = records.iter().map(|r| r.activation).sum();
        Ok(MemoryStats {
            records: records.len(),
            index_size: self.index.len(),
            mirror_len: self.index.mirror_len(),
            edges: self.graph.edge_count(),
            linked_records: records.iter().filter(|r| !r.connections.is_empty()).count(),
            mean_activation: if records.is_empty() {
                0.0
            } else {
                total_activation / records.len() as f64
            },
            newest: records.iter().map(|r| r.timestamp).max(),
        })
    }
}
