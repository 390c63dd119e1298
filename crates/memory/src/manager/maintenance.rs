//! Decay cycles and recovery of the derived indexes for [`MemoryGraph`].

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::StoreResult;
use crate::store::DecayReport;

use super::MemoryGraph;

impl MemoryGraph {
    /// Run one activation decay cycle now.
    pub async fn decay(&self) -> StoreResult<DecayReport> {
        self.decay_at(Utc::now()).await
    }

    /// Run one activation decay cycle as of `now`.
    pub async fn decay_at(&self, now: DateTime<Utc>) -> StoreResult<DecayReport> {
        self.store.apply_decay(now, self.params.decay).await
    }

    // ── Recovery ───────────────────────────────────────────────────────────

    /// Re-embed every record and replace the vector index and its mirror.
    pub async fn rebuild_index(&mut self) -> StoreResult<usize> {
        let rebuilt = self.index.rebuild_from_store(&self.store).await?;
        info!(entries = rebuilt, "vector index rebuilt on request");
        Ok(rebuilt)
    }

    /// Replace the association file with adjacency derived from the
    /// connections stored on each record.
    pub async fn rederive_associations(&mut self) -> StoreResult<usize> {
        let records = self.store.load_all()?;
        self.graph.rederive(&records).await
    }
}
