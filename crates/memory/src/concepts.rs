//! Concept clusters: periodic k-means over record embeddings, persisted as
//! `concept_clusters.json`.
//!
//! A cluster is derived data.  Every pass replaces the whole file, so ids
//! (`concept_<n>`) are only stable until the next regrouping.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::durable::DurableStore;
use crate::error::StoreResult;
use crate::schema::ThoughtRecord;
use crate::vector_index::squared_l2;

pub const CLUSTERS_FILE: &str = "concept_clusters.json";

const MIN_CLUSTERS: usize = 3;
const MAX_CLUSTERS: usize = 20;
const RECORDS_PER_CLUSTER: usize = 10;
const MAX_THEMES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptCluster {
    pub id: String,
    /// Text of the member closest to the cluster centroid.
    pub central_thought: String,
    pub thought_ids: Vec<String>,
    pub size: usize,
    pub created_at: DateTime<Utc>,
    pub common_themes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConceptMap {
    #[serde(default)]
    pub clusters: Vec<ConceptCluster>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Number of clusters for `records` records: one per ten, between 3 and 20,
/// never more than there are records.
pub fn cluster_count(records: usize) -> usize {
    (records / RECORDS_PER_CLUSTER)
        .clamp(MIN_CLUSTERS, MAX_CLUSTERS)
        .min(records)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clustering {
    pub centroids: Vec<Vec<f32>>,
    /// Cluster of each input point, by position.
    pub labels: Vec<usize>,
}

/// Lloyd's k-means with k-means++ seeding.  Stops early once an iteration
/// leaves every assignment unchanged; a cluster that empties keeps its
/// previous centroid.
pub fn kmeans<R: Rng + ?Sized>(points: &[Vec<f32>], k: usize, iterations: usize, rng: &mut R) -> Clustering {
    let k = k.min(points.len());
    if k == 0 {
        return Clustering {
            centroids: Vec::new(),
            labels: Vec::new(),
        };
    }

    let mut centroids = seed_centroids(points, k, rng);
    let mut labels = assign(points, &centroids);
    for _ in 0..iterations {
        centroids = recenter(points, &labels, &centroids);
        let next = assign(points, &centroids);
        if next == labels {
            break;
        }
        labels = next;
    }
    Clustering { centroids, labels }
}

/// Each further seed is drawn with probability proportional to its squared
/// distance from the nearest seed so far.
fn seed_centroids<R: Rng + ?Sized>(points: &[Vec<f32>], k: usize, rng: &mut R) -> Vec<Vec<f32>> {
    let first = points[rng.random_range(0..points.len())].clone();
    let mut distances: Vec<f64> = points.iter().map(|p| f64::from(squared_l2(p, &first))).collect();
    let mut centroids = vec![first];

    while centroids.len() < k {
        let total: f64 = distances.iter().sum();
        let pick = if total > 0.0 {
            let mut target = rng.random_range(0.0..total);
            distances
                .iter()
                .position(|d| {
                    target -= d;
                    target < 0.0
                })
                .unwrap_or(points.len() - 1)
        } else {
            rng.random_range(0..points.len())
        };
        let chosen = points[pick].clone();
        for (distance, point) in distances.iter_mut().zip(points) {
            *distance = distance.min(f64::from(squared_l2(point, &chosen)));
        }
        centroids.push(chosen);
    }
    centroids
}

fn nearest(centroids: &[Vec<f32>], point: &[f32]) -> usize {
    centroids
        .iter()
        .enumerate()
        .min_by(|a, b| squared_l2(point, a.1).total_cmp(&squared_l2(point, b.1)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn assign(points: &[Vec<f32>], centroids: &[Vec<f32>]) -> Vec<usize> {
    points.iter().map(|point| nearest(centroids, point)).collect()
}

fn recenter(points: &[Vec<f32>], labels: &[usize], previous: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let mut sums: Vec<Vec<f32>> = previous.iter().map(|c| vec![0.0; c.len()]).collect();
    let mut counts = vec![0usize; previous.len()];
    for (point, &label) in points.iter().zip(labels) {
        counts[label] += 1;
        for (sum, value) in sums[label].iter_mut().zip(point) {
            *sum += value;
        }
    }
    sums.into_iter()
        .zip(counts)
        .zip(previous)
        .map(|((sum, count), old)| match count {
            0 => old.clone(),
            n => sum.into_iter().map(|v| v / n as f32).collect(),
        })
        .collect()
}

/// The most frequent origins among `members`, at most three, ties broken by
/// name.
pub fn common_themes(members: &[&ThoughtRecord]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for record in members {
        *counts.entry(record.origin()).or_default() += 1;
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(MAX_THEMES)
        .map(|(origin, _)| origin.to_string())
        .collect()
}

/// Turn a clustering of `records` (embedded as `vectors`, same order) into
/// concept clusters.  Empty clusters are dropped.
pub fn build_clusters(
    records: &[ThoughtRecord],
    vectors: &[Vec<f32>],
    clustering: &Clustering,
    now: DateTime<Utc>,
) -> Vec<ConceptCluster> {
    let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (position, &label) in clustering.labels.iter().enumerate() {
        members.entry(label).or_default().push(position);
    }

    members
        .into_iter()
        .filter_map(|(label, positions)| {
            let centroid = clustering.centroids.get(label)?;
            let central = positions
                .iter()
                .copied()
                .min_by(|&a, &b| squared_l2(&vectors[a], centroid).total_cmp(&squared_l2(&vectors[b], centroid)))?;
            let group: Vec<&ThoughtRecord> = positions.iter().map(|&p| &records[p]).collect();
            Some(ConceptCluster {
                id: format!("concept_{label}"),
                central_thought: records[central].text.clone(),
                thought_ids: group.iter().map(|r| r.id.clone()).collect(),
                size: group.len(),
                created_at: now,
                common_themes: common_themes(&group),
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ConceptStore {
    path: PathBuf,
    durable: DurableStore,
}

impl ConceptStore {
    pub fn new(dir: &Path, durable: DurableStore) -> Self {
        Self {
            path: dir.join(CLUSTERS_FILE),
            durable,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> StoreResult<ConceptMap> {
        self.durable.load(&self.path, ConceptMap::default())
    }

    pub fn get(&self, id: &str) -> StoreResult<Option<ConceptCluster>> {
        Ok(self.load()?.clusters.into_iter().find(|cluster| cluster.id == id))
    }

    /// Replace every cluster in one locked write.
    pub async fn replace(&self, clusters: Vec<ConceptCluster>, now: DateTime<Utc>) -> StoreResult<()> {
        self.durable
            .update(&self.path, ConceptMap::default, move |map: &mut ConceptMap| {
                map.clusters = clusters;
                map.last_updated = Some(now);
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    use super::*;
    use crate::schema::origin_metadata;

    fn blob(center: [f32; 2], n: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| vec![center[0] + i as f32 * 0.01, center[1] - i as f32 * 0.01])
            .collect()
    }

    #[test]
    fn cluster_count_scales_with_records() {
        assert_eq!(cluster_count(0), 0);
        assert_eq!(cluster_count(2), 2);
        assert_eq!(cluster_count(10), 3);
        assert_eq!(cluster_count(45), 4);
        assert_eq!(cluster_count(1_000), 20);
    }

    #[test]
    fn kmeans_separates_distant_groups() {
        let mut points = blob([0.0, 0.0], 5);
        points.extend(blob([10.0, 10.0], 5));
        points.extend(blob([-10.0, 10.0], 5));
        let mut rng = StdRng::seed_from_u64(11);

        let clustering = kmeans(&points, 3, 20, &mut rng);
        assert_eq!(clustering.centroids.len(), 3);
        assert_eq!(clustering.labels.len(), 15);
        for group in clustering.labels.chunks(5) {
            assert!(group.iter().all(|label| *label == group[0]));
        }
        let mut distinct: Vec<usize> = clustering.labels.chunks(5).map(|g| g[0]).collect();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn kmeans_on_nothing_is_empty() {
        let mut rng = StdRng::seed_from_u64(1);
        let clustering = kmeans(&[], 3, 10, &mut rng);
        assert!(clustering.centroids.is_empty());
        assert!(clustering.labels.is_empty());
    }

    #[test]
    fn themes_rank_origins_by_frequency() {
        let now = Utc::now();
        let records: Vec<ThoughtRecord> = ["dream", "reflection", "dream", "monologue", "external", "dream", "reflection"]
            .into_iter()
            .map(|origin| ThoughtRecord::new("x", origin_metadata(origin), now))
            .collect();
        let refs: Vec<&ThoughtRecord> = records.iter().collect();
        assert_eq!(common_themes(&refs), vec!["dream", "reflection", "external"]);
    }

    #[test]
    fn central_thought_is_closest_to_centroid() {
        let now = Utc::now();
        let records: Vec<ThoughtRecord> = ["edge", "middle", "other edge"]
            .into_iter()
            .map(|text| ThoughtRecord::new(text, origin_metadata("dream"), now))
            .collect();
        let vectors = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![2.2, 0.0]];
        let clustering = Clustering {
            centroids: vec![vec![1.05, 0.0]],
            labels: vec![0, 0, 0],
        };

        let clusters = build_clusters(&records, &vectors, &clustering, now);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].id, "concept_0");
        assert_eq!(clusters[0].central_thought, "middle");
        assert_eq!(clusters[0].size, 3);
        assert_eq!(clusters[0].common_themes, vec!["dream"]);
    }

    #[tokio::test]
    async fn replace_overwrites_previous_clusters() {
        let dir = TempDir::new().unwrap();
        let store = ConceptStore::new(dir.path(), DurableStore::default());
        assert!(store.load().unwrap().clusters.is_empty());

        let cluster = |id: &str| ConceptCluster {
            id: id.to_string(),
            central_thought: "t".to_string(),
            thought_ids: vec!["a".to_string()],
            size: 1,
            created_at: Utc::now(),
            common_themes: vec!["dream".to_string()],
        };
        store.replace(vec![cluster("concept_0"), cluster("concept_1")], Utc::now()).await.unwrap();
        store.replace(vec![cluster("concept_2")], Utc::now()).await.unwrap();

        let map = store.load().unwrap();
        assert_eq!(map.clusters.len(), 1);
        assert!(map.last_updated.is_some());
        assert!(store.get("concept_0").unwrap().is_none());
        assert_eq!(store.get("concept_2").unwrap().unwrap().size, 1);
    }
}
