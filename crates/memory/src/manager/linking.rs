//! Connection strength between a new record and its nearest neighbours.
//!
//! ```text
//! strength = 0.6 · similarity
//!          + 0.2 · 1 / (1 + 0.1 · Δhours)
//!          + 0.2 · (1.2 if same origin else 0.8)
//! ```
//!
//! clamped to `[0, 1]`; only links strictly above `0.3` survive.  All
//! constants come from [`GraphParams`].

use chrono::{DateTime, Utc};
use reverie_config::MemoryConfig;

use crate::schema::{Connection, ThoughtRecord, connection_type};
use crate::store::DecayPolicy;
use crate::vector_index::IndexHit;

#[derive(Debug, Clone, PartialEq)]
pub struct GraphParams {
    pub candidates: usize,
    pub semantic_weight: f64,
    pub time_weight: f64,
    pub origin_weight: f64,
    pub time_decay_per_hour: f64,
    pub same_origin_factor: f64,
    pub cross_origin_factor: f64,
    pub connection_threshold: f64,
    pub decay: DecayPolicy,
    pub decay_every: usize,
    pub search_similarity_weight: f64,
    pub search_activation_weight: f64,
    pub min_association_strength: f64,
    pub cluster_every: usize,
    pub cluster_min_records: usize,
    pub cluster_iterations: usize,
}

impl From<&MemoryConfig> for GraphParams {
    fn from(cfg: &MemoryConfig) -> Self {
        Self {
            candidates: cfg.connection_candidates,
            semantic_weight: cfg.semantic_weight,
            time_weight: cfg.time_weight,
            origin_weight: cfg.origin_weight,
            time_decay_per_hour: cfg.time_decay_per_hour,
            same_origin_factor: cfg.same_origin_factor,
            cross_origin_factor: cfg.cross_origin_factor,
            connection_threshold: cfg.connection_threshold,
            decay: DecayPolicy {
                rate: cfg.decay_rate,
                floor: cfg.activation_floor,
            },
            decay_every: cfg.decay_every,
            search_similarity_weight: cfg.search_similarity_weight,
            search_activation_weight: cfg.search_activation_weight,
            min_association_strength: cfg.min_association_strength,
            cluster_every: cfg.cluster_every,
            cluster_min_records: cfg.cluster_min_records,
            cluster_iterations: cfg.cluster_iterations,
        }
    }
}

impl Default for GraphParams {
    fn default() -> Self {
        Self::from(&MemoryConfig::default())
    }
}

/// The three factors behind one connection strength, kept for logging and
/// inspection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrengthBreakdown {
    pub similarity: f64,
    pub time_factor: f64,
    pub origin_factor: f64,
    pub strength: f64,
}

impl GraphParams {
    pub fn strength(&self, similarity: f64, hours_apart: f64, same_origin: bool) -> StrengthBreakdown {
        let time_factor = 1.0 / (1.0 + self.time_decay_per_hour * hours_apart.abs());
        let origin_factor = if same_origin {
            self.same_origin_factor
        } else {
            self.cross_origin_factor
        };
        let strength = (self.semantic_weight * similarity
            + self.time_weight * time_factor
            + self.origin_weight * origin_factor)
            .clamp(0.0, 1.0);
        StrengthBreakdown {
            similarity,
            time_factor,
            origin_factor,
            strength,
        }
    }

    /// The connection from `record` to the record behind `hit`, if strong
    /// enough to keep.
    pub fn link(&self, record: &ThoughtRecord, hit: &IndexHit, now: DateTime<Utc>) -> Option<Connection> {
        if hit.entry.id == record.id {
            return None;
        }
        let hours_apart = record
            .timestamp
            .signed_duration_since(hit.entry.timestamp)
            .num_milliseconds() as f64
            / 3_600_000.0;
        let breakdown = self.strength(hit.similarity, hours_apart, record.origin() == hit.entry.origin);
        if breakdown.strength <= self.connection_threshold {
            return None;
        }
        Some(Connection {
            target_id: hit.entry.id.clone(),
            strength: breakdown.strength,
            kind: connection_type(record.origin(), &hit.entry.origin),
            created_at: now,
        })
    }

    pub fn relevance(&self, similarity: f64, activation: f64) -> f64 {
        self.search_similarity_weight * similarity + self.search_activation_weight * activation
    }
}
