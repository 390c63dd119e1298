use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use super::MemoryGraph;
use crate::error::StoreResult;
use crate::schema::ThoughtRecord;

impl MemoryGraph {
    /// Records most relevant to `query`: `0.7 · similarity + 0.3 · activation`,
    /// best first.  `exclude_id` is never returned.
    ///
    /// An embedding failure yields no results rather than an error.  Vectors
    /// appended by another process since the last read are picked up first.
    pub async fn search_similar(
        &mut self,
        query: &str,
        k: usize,
        exclude_id: Option<&str>,
    ) -> StoreResult<Vec<ThoughtRecord>> {
        self.index.reload_if_changed();
        if k == 0 || self.index.is_empty() {
            return Ok(Vec::new());
        }
        let vector = match self.index.embedder().embed(query).await {
            Ok(v) if v.len() == self.index.dimensions() => v,
            Ok(v) => {
                warn!(expected = self.index.dimensions(), actual = v.len(), "query embedding has wrong dimensions");
                return Ok(Vec::new());
            }
            Err(err) => {
                warn!(error = %err, "query embedding failed");
                return Ok(Vec::new());
            }
        };

        let hits = self.index.search(&vector, k.saturating_mul(2));
        let mut by_id: HashMap<String, ThoughtRecord> = self
            .store
            .load_all()?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        let mut results: Vec<ThoughtRecord> = hits
            .into_iter()
            .filter(|hit| Some(hit.entry.id.as_str()) != exclude_id)
            .filter_map(|hit| {
                let mut record = by_id.remove(&hit.entry.id)?;
                record.relevance_score = Some(self.params.relevance(hit.similarity, record.activation));
                Some(record)
            })
            .collect();
        results.sort_by(|a, b| {
            b.relevance_score
                .unwrap_or(0.0)
                .total_cmp(&a.relevance_score.unwrap_or(0.0))
        });
        results.truncate(k);
        debug!(query_len = query.len(), found = results.len(), "similarity search");
        Ok(results)
    }

    /// Records linked to `id` in either direction with strength at least
    /// `min_strength` (configured default when `None`), strongest first.
    pub fn get_associated(&self, id: &str, min_strength: Option<f64>) -> StoreResult<Vec<ThoughtRecord>> {
        let min_strength = min_strength.unwrap_or(self.params.min_association_strength);
        let neighbors: Vec<_> = self
            .graph
            .incident(id)
            .into_iter()
            .filter(|n| n.strength >= min_strength)
            .collect();
        if neighbors.is_empty() {
            return Ok(Vec::new());
        }
        self.resolve(neighbors.iter().map(|n| n.id.as_str()))
    }

    /// Bounded breadth-first walk from `start_id`.  Each frontier node
    /// contributes its `branch_factor` strongest links; visited ids are
    /// skipped.  Returns the reached records in visit order, starting with
    /// `start_id` itself.
    pub fn trace(&self, start_id: &str, depth: usize, branch_factor: usize) -> StoreResult<Vec<ThoughtRecord>> {
        let mut visited: HashSet<String> = HashSet::from([start_id.to_string()]);
        let mut order: Vec<String> = vec![start_id.to_string()];
        let mut frontier = vec![start_id.to_string()];

        for level in 0..depth {
            let mut next = Vec::new();
            for node in &frontier {
                for neighbor in self.graph.incident(node).into_iter().take(branch_factor) {
                    if visited.insert(neighbor.id.clone()) {
                        order.push(neighbor.id.clone());
                        next.push(neighbor.id);
                    }
                }
            }
            if next.is_empty() {
                debug!(level, "trace exhausted");
                break;
            }
            frontier = next;
        }
        self.resolve(order.iter().map(String::as_str))
    }

    /// Load the records for `ids`, preserving their order and skipping ids
    /// the store no longer holds.
    fn resolve<'a>(&self, ids: impl Iterator<Item = &'a str>) -> StoreResult<Vec<ThoughtRecord>> {
        let mut by_id: HashMap<String, ThoughtRecord> = self
            .store
            .load_all()?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Ok(ids.filter_map(|id| by_id.remove(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use reverie_llm::{Embedder, HashEmbedder};
    use tempfile::TempDir;

    use super::*;
    use crate::graph::Edge;
    use crate::lock::LockOptions;
    use crate::manager::GraphParams;
    use crate::schema::origin_metadata;

    async fn open(dir: &TempDir, embedder: Arc<dyn Embedder>) -> MemoryGraph {
        MemoryGraph::open(dir.path(), embedder, GraphParams::default(), LockOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn search_ranks_by_relevance_and_honours_exclude() {
        let dir = TempDir::new().unwrap();
        let mut memory = open(&dir, Arc::new(HashEmbedder::new(256))).await;
        let garden = memory
            .save_record("roses bloom in the quiet garden", origin_metadata("reflection"))
            .await
            .unwrap();
        memory
            .save_record("compilers lower syntax trees", origin_metadata("monologue"))
            .await
            .unwrap();

        let hits = memory.search_similar("roses bloom in the quiet garden", 2, None).await.unwrap();
        assert_eq!(hits[0].id, garden.id);
        let top = hits[0].relevance_score.unwrap();
        assert!((top - 1.0).abs() < 1e-6);
        assert!(hits.windows(2).all(|w| w[0].relevance_score >= w[1].relevance_score));

        let excluded = memory
            .search_similar("roses bloom in the quiet garden", 2, Some(&garden.id))
            .await
            .unwrap();
        assert!(excluded.iter().all(|r| r.id != garden.id));
    }

    #[tokio::test]
    async fn search_on_empty_memory_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut memory = open(&dir, Arc::new(HashEmbedder::new(32))).await;
        assert!(memory.search_similar("anything", 3, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_sees_records_saved_through_another_handle() {
        let dir = TempDir::new().unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(128));
        let mut reader = open(&dir, Arc::clone(&embedder)).await;
        let mut writer = open(&dir, embedder).await;
        assert!(reader.search_similar("tide pools at dawn", 3, None).await.unwrap().is_empty());

        let saved = writer
            .save_record("tide pools at dawn", origin_metadata("external"))
            .await
            .unwrap();
        let hits = reader.search_similar("tide pools at dawn", 3, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, saved.id);
    }

    #[tokio::test]
    async fn associated_filters_by_strength_both_directions() {
        let dir = TempDir::new().unwrap();
        let mut memory = open(&dir, Arc::new(HashEmbedder::new(128))).await;
        let t0 = Utc::now() - Duration::hours(2);
        let a = memory
            .save_record_at("the lighthouse keeper counts waves", origin_metadata("reflection"), t0)
            .await
            .unwrap();
        let b = memory
            .save_record_at(
                "the lighthouse keeper counts waves at night",
                origin_metadata("reflection"),
                t0 + Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(b.connections[0].target_id, a.id);

        // a only has an incoming edge, still visible.
        let around_a = memory.get_associated(&a.id, None).unwrap();
        assert_eq!(around_a.len(), 1);
        assert_eq!(around_a[0].id, b.id);
        assert!(memory.get_associated(&a.id, Some(1.01)).unwrap().is_empty());
        assert!(memory.get_associated("unknown", None).unwrap().is_empty());
    }

    fn edge(to: &str, strength: f64) -> Edge {
        Edge {
            to: to.to_string(),
            strength,
            kind: "semantic_association".to_string(),
        }
    }

    #[tokio::test]
    async fn trace_is_bounded_by_depth_and_branch_factor() {
        let dir = TempDir::new().unwrap();
        let mut memory = open(&dir, Arc::new(HashEmbedder::new(64))).await;
        let mut ids = Vec::new();
        for text in ["root", "left", "right", "leaf one", "leaf two", "far"] {
            let record = memory.save_record(text, origin_metadata("dream")).await.unwrap();
            ids.push(record.id);
        }
        let [root, left, right, leaf1, leaf2, far] = <[String; 6]>::try_from(ids).unwrap();

        // Overwrite whatever the embedder linked with a known shape.
        let mut unlinked = memory.store.load_all().unwrap();
        for record in &mut unlinked {
            record.connections.clear();
        }
        memory.graph.rederive(&unlinked).await.unwrap();
        memory.graph.add_edges(&root, &[edge(&left, 0.9), edge(&right, 0.5)]).await.unwrap();
        memory.graph.add_edges(&left, &[edge(&leaf1, 0.8), edge(&leaf2, 0.6)]).await.unwrap();
        memory.graph.add_edges(&leaf1, &[edge(&far, 0.7)]).await.unwrap();

        let names = |records: Vec<ThoughtRecord>| records.into_iter().map(|r| r.id).collect::<Vec<_>>();

        assert_eq!(
            names(memory.trace(&root, 1, 5).unwrap()),
            vec![root.clone(), left.clone(), right.clone()]
        );
        assert_eq!(names(memory.trace(&root, 1, 1).unwrap()), vec![root.clone(), left.clone()]);
        assert_eq!(
            names(memory.trace(&root, 2, 5).unwrap()),
            vec![root.clone(), left.clone(), right.clone(), leaf1.clone(), leaf2.clone()]
        );
        let everything = names(memory.trace(&root, 10, 5).unwrap());
        assert_eq!(everything.len(), 6);
        assert_eq!(everything.first(), Some(&root));
        assert_eq!(everything.last(), Some(&far));
        assert_eq!(names(memory.trace(&root, 0, 5).unwrap()), vec![root.clone()]);
        assert!(memory.trace("missing", 3, 3).unwrap().is_empty());
    }
}
