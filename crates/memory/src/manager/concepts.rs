//! Concept regrouping and lookup for [`MemoryGraph`].

use std::collections::HashSet;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::concepts::{ConceptCluster, build_clusters, cluster_count, kmeans};
use crate::error::StoreResult;
use crate::schema::ThoughtRecord;

use super::MemoryGraph;

impl MemoryGraph {
    /// Regroup every record into concept clusters and replace the persisted
    /// set.  Returns the number of clusters written, or `None` when there are
    /// too few records to cluster.
    pub async fn update_concept_clusters(&mut self) -> StoreResult<Option<usize>> {
        let records = self.store.load_all()?;
        if records.len() < self.params.cluster_min_records.max(1) {
            debug!(records = records.len(), "too few records to cluster");
            return Ok(None);
        }

        self.index.reload_if_changed();
        let indexed: Vec<Option<Vec<f32>>> = {
            let by_id = self.index.vectors_by_id();
            records
                .iter()
                .map(|record| by_id.get(record.id.as_str()).map(|v| v.to_vec()))
                .collect()
        };
        let mut vectors = Vec::with_capacity(records.len());
        for (record, vector) in records.iter().zip(indexed) {
            match vector {
                Some(vector) => vectors.push(vector),
                None => vectors.push(self.index.embed(&record.text).await),
            }
        }

        let k = cluster_count(records.len());
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let clustering = kmeans(&vectors, k, self.params.cluster_iterations, &mut rng);
        let now = Utc::now();
        let clusters = build_clusters(&records, &vectors, &clustering, now);
        let written = clusters.len();

        self.concepts.replace(clusters, now).await?;
        info!(records = records.len(), clusters = written, "concept clusters updated");
        Ok(Some(written))
    }

    /// The persisted concept clusters, as of the last regrouping.
    pub fn concepts(&self) -> StoreResult<Vec<ConceptCluster>> {
        Ok(self.concepts.load()?.clusters)
    }

    /// Records belonging to `cluster_id`, in store order.  Unknown clusters
    /// and members that no longer exist yield nothing.
    pub fn concept_records(&self, cluster_id: &str) -> StoreResult<Vec<ThoughtRecord>> {
        let Some(cluster) = self.concepts.get(cluster_id)? else {
            return Ok(Vec::new());
        };
        let members: HashSet<&str> = cluster.thought_ids.iter().map(String::as_str).collect();
        Ok(self
            .store
            .load_all()?
            .into_iter()
            .filter(|record| members.contains(record.id.as_str()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reverie_llm::HashEmbedder;
    use tempfile::TempDir;

    use crate::concepts::CLUSTERS_FILE;
    use crate::lock::LockOptions;
    use crate::manager::GraphParams;
    use crate::schema::origin_metadata;

    use super::*;

    async fn open(dir: &TempDir, params: GraphParams) -> MemoryGraph {
        MemoryGraph::open(dir.path(), Arc::new(HashEmbedder::new(64)), params, LockOptions::default())
            .await
            .unwrap()
    }

    fn manual() -> GraphParams {
        GraphParams {
            cluster_every: 0,
            ..GraphParams::default()
        }
    }

    #[tokio::test]
    async fn too_few_records_are_not_clustered() {
        let dir = TempDir::new().unwrap();
        let mut memory = open(&dir, manual()).await;
        for i in 0..3 {
            memory.save_record(&format!("lonely note {i}"), origin_metadata("dream")).await.unwrap();
        }
        assert_eq!(memory.update_concept_clusters().await.unwrap(), None);
        assert!(memory.concepts().unwrap().is_empty());
        assert!(!dir.path().join(CLUSTERS_FILE).exists());
    }

    #[tokio::test]
    async fn every_record_lands_in_exactly_one_cluster() {
        let dir = TempDir::new().unwrap();
        let mut memory = open(&dir, manual()).await;
        let mut ids = Vec::new();
        for i in 0..12 {
            let origin = if i % 3 == 0 { "reflection" } else { "dream" };
            let record = memory
                .save_record(&format!("a passing thought number {i} about tides"), origin_metadata(origin))
                .await
                .unwrap();
            ids.push(record.id);
        }

        assert_eq!(memory.update_concept_clusters().await.unwrap(), Some(memory.concepts().unwrap().len()));
        let clusters = memory.concepts().unwrap();
        assert!(!clusters.is_empty() && clusters.len() <= 3);

        let mut seen: Vec<String> = clusters.iter().flat_map(|c| c.thought_ids.clone()).collect();
        seen.sort();
        ids.sort();
        assert_eq!(seen, ids);
        for cluster in &clusters {
            assert_eq!(cluster.size, cluster.thought_ids.len());
            assert!(cluster.common_themes.len() <= 3);
            assert!(!cluster.central_thought.is_empty());
        }
    }

    #[tokio::test]
    async fn concept_records_returns_cluster_members() {
        let dir = TempDir::new().unwrap();
        let mut memory = open(&dir, manual()).await;
        for i in 0..10 {
            memory
                .save_record(&format!("harbour lights flicker {i}"), origin_metadata("monologue"))
                .await
                .unwrap();
        }
        memory.update_concept_clusters().await.unwrap();

        for cluster in memory.concepts().unwrap() {
            let members = memory.concept_records(&cluster.id).unwrap();
            let mut got: Vec<String> = members.iter().map(|r| r.id.clone()).collect();
            let mut want = cluster.thought_ids.clone();
            got.sort();
            want.sort();
            assert_eq!(got, want);
            assert!(members.iter().any(|r| r.text == cluster.central_thought));
        }
        assert!(memory.concept_records("concept_99").unwrap().is_empty());
    }

    #[tokio::test]
    async fn insertions_trigger_regrouping() {
        let dir = TempDir::new().unwrap();
        let params = GraphParams {
            cluster_every: 10,
            ..GraphParams::default()
        };
        let mut memory = open(&dir, params).await;
        for i in 0..9 {
            memory.save_record(&format!("note {i}"), origin_metadata("external")).await.unwrap();
        }
        assert!(memory.concepts().unwrap().is_empty());

        memory.save_record("the tenth note", origin_metadata("external")).await.unwrap();
        let clusters = memory.concepts().unwrap();
        assert_eq!(clusters.iter().map(|c| c.size).sum::<usize>(), 10);
        assert!(clusters.iter().all(|c| c.common_themes == vec!["external".to_string()]));
    }
}
