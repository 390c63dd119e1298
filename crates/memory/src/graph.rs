//! Association adjacency, persisted as `associations.json` and held in
//! memory as an arena.
//!
//! Each link is stored once, from source to target.  Lookups that need
//! both directions (the associative trace) use the per-node incoming list,
//! so nothing is duplicated on disk.  The arena is only ever extended on
//! insertion; it is rebuilt wholesale only when the file was changed by
//! another process or rederived from record connections.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::durable::{DurableStore, LoadSource};
use crate::error::StoreResult;
use crate::schema::ThoughtRecord;

pub const ASSOCIATIONS_FILE: &str = "associations.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub to: String,
    pub strength: f64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssociationFile {
    #[serde(default)]
    pub associations: BTreeMap<String, Vec<Edge>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl AssociationFile {
    /// Rederive adjacency from the `connections` stored on each record.
    pub fn from_records(records: &[ThoughtRecord]) -> Self {
        let mut file = Self::default();
        for record in records {
            for connection in &record.connections {
                upsert(
                    file.associations.entry(record.id.clone()).or_default(),
                    Edge {
                        to: connection.target_id.clone(),
                        strength: connection.strength,
                        kind: connection.kind.clone(),
                    },
                );
            }
        }
        file.last_updated = Some(Utc::now());
        file
    }

    pub fn edge_count(&self) -> usize {
        self.associations.values().map(Vec::len).sum()
    }
}

fn upsert(edges: &mut Vec<Edge>, edge: Edge) {
    match edges.iter_mut().find(|existing| existing.to == edge.to) {
        Some(existing) => *existing = edge,
        None => edges.push(edge),
    }
}

/// A node adjacent to the queried one, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub strength: f64,
    pub kind: String,
}

type NodeIx = usize;
type EdgeIx = usize;

#[derive(Debug)]
struct StoredEdge {
    from: NodeIx,
    to: NodeIx,
    strength: f64,
    kind: String,
}

#[derive(Debug, Default)]
struct Arena {
    ids: Vec<String>,
    slots: HashMap<String, NodeIx>,
    edges: Vec<StoredEdge>,
    outgoing: Vec<Vec<EdgeIx>>,
    incoming: Vec<Vec<EdgeIx>>,
}

impl Arena {
    fn from_file(file: &AssociationFile) -> Self {
        let mut arena = Self::default();
        for (source, edges) in &file.associations {
            for edge in edges {
                arena.insert(source, edge);
            }
        }
        arena
    }

    fn node(&mut self, id: &str) -> NodeIx {
        if let Some(&ix) = self.slots.get(id) {
            return ix;
        }
        let ix = self.ids.len();
        self.ids.push(id.to_string());
        self.slots.insert(id.to_string(), ix);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        ix
    }

    fn insert(&mut self, source: &str, edge: &Edge) {
        let from = self.node(source);
        let to = self.node(&edge.to);
        let existing = self.outgoing[from]
            .iter()
            .copied()
            .find(|&e| self.edges[e].to == to);
        match existing {
            Some(e) => {
                self.edges[e].strength = edge.strength;
                self.edges[e].kind = edge.kind.clone();
            }
            None => {
                let e = self.edges.len();
                self.edges.push(StoredEdge {
                    from,
                    to,
                    strength: edge.strength,
                    kind: edge.kind.clone(),
                });
                self.outgoing[from].push(e);
                self.incoming[to].push(e);
            }
        }
    }

    fn neighbor(&self, node: NodeIx, e: EdgeIx) -> Neighbor {
        let edge = &self.edges[e];
        Neighbor {
            id: self.ids[node].clone(),
            strength: edge.strength,
            kind: edge.kind.clone(),
        }
    }
}

pub struct AssociationGraph {
    path: PathBuf,
    durable: DurableStore,
    arena: Arena,
}

impl AssociationGraph {
    /// Load the adjacency file.  When it is missing or unusable but records
    /// carry connections, the graph is rederived from them and persisted.
    pub async fn open(
        dir: &Path,
        durable: DurableStore,
        records: &[ThoughtRecord],
    ) -> StoreResult<Self> {
        let path = dir.join(ASSOCIATIONS_FILE);
        let loaded = durable.load_traced(&path, AssociationFile::default)?;
        let mut graph = Self {
            path,
            durable,
            arena: Arena::from_file(&loaded.value),
        };

        let recorded: usize = records.iter().map(|r| r.connections.len()).sum();
        if loaded.source == LoadSource::Default && recorded > 0 {
            warn!(
                path = %graph.path.display(),
                connections = recorded,
                "association file unusable; rederiving from record connections"
            );
            graph.rederive(records).await?;
        }
        Ok(graph)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the persisted adjacency with one derived from `records`.
    pub async fn rederive(&mut self, records: &[ThoughtRecord]) -> StoreResult<usize> {
        let derived = AssociationFile::from_records(records);
        let count = derived.edge_count();
        let arena = Arena::from_file(&derived);
        self.durable
            .update(&self.path, AssociationFile::default, move |file: &mut AssociationFile| {
                *file = derived;
                Ok(())
            })
            .await?;
        self.arena = arena;
        info!(edges = count, path = %self.path.display(), "association graph rederived");
        Ok(count)
    }

    /// Persist `edges` from `source` and extend the in-memory arena.
    pub async fn add_edges(&mut self, source: &str, edges: &[Edge]) -> StoreResult<()> {
        if edges.is_empty() {
            return Ok(());
        }
        let known_before = self.arena.edges.len();
        let incoming = edges.to_vec();
        let source_id = source.to_string();
        let file = self
            .durable
            .update(&self.path, AssociationFile::default, move |file: &mut AssociationFile| {
                let before = file.edge_count();
                let list = file.associations.entry(source_id).or_default();
                for edge in incoming {
                    upsert(list, edge);
                }
                file.last_updated = Some(Utc::now());
                Ok((before, file.clone()))
            })
            .await?;

        let (persisted_before, snapshot) = file;
        if persisted_before != known_before {
            // Another writer touched the file since we loaded it.
            self.arena = Arena::from_file(&snapshot);
        } else {
            for edge in edges {
                self.arena.insert(source, edge);
            }
        }
        Ok(())
    }

    /// Links stored from `id`, strongest first.
    pub fn outgoing(&self, id: &str) -> Vec<Neighbor> {
        let Some(&node) = self.arena.slots.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<Neighbor> = self.arena.outgoing[node]
            .iter()
            .map(|&e| self.arena.neighbor(self.arena.edges[e].to, e))
            .collect();
        sort_strongest_first(&mut out);
        out
    }

    /// Links touching `id` in either direction, strongest first, one entry
    /// per neighbour.
    pub fn incident(&self, id: &str) -> Vec<Neighbor> {
        let Some(&node) = self.arena.slots.get(id) else {
            return Vec::new();
        };
        let mut best: HashMap<NodeIx, Neighbor> = HashMap::new();
        let outgoing = self.arena.outgoing[node]
            .iter()
            .map(|&e| (self.arena.edges[e].to, e));
        let incoming = self.arena.incoming[node]
            .iter()
            .map(|&e| (self.arena.edges[e].from, e));
        for (other, e) in outgoing.chain(incoming) {
            if other == node {
                continue;
            }
            let candidate = self.arena.neighbor(other, e);
            match best.get(&other) {
                Some(current) if current.strength >= candidate.strength => {}
                _ => {
                    best.insert(other, candidate);
                }
            }
        }
        let mut out: Vec<Neighbor> = best.into_values().collect();
        sort_strongest_first(&mut out);
        out
    }

    pub fn edge_count(&self) -> usize {
        self.arena.edges.len()
    }

    pub fn node_count(&self) -> usize {
        self.arena.ids.len()
    }
}

fn sort_strongest_first(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(|a, b| b.strength.total_cmp(&a.strength).then_with(|| a.id.cmp(&b.id)));
}
