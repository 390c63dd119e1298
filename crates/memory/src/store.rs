//! The canonical record store: `thoughts.json`, a JSON array of
//! [`ThoughtRecord`]s in insertion order.
//!
//! Every mutation runs under the file lock through [`DurableStore::update`];
//! reads are lock-free and may be slightly stale.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::durable::DurableStore;
use crate::error::{StoreError, StoreResult};
use crate::schema::{Connection, ThoughtRecord};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayPolicy {
    /// Per-day rate: one cycle multiplies activation by `1 / (1 + rate · Δdays)`.
    pub rate: f64,
    pub floor: f64,
}

impl Default for DecayPolicy {
    fn default() -> Self {
        Self {
            rate: 0.05,
            floor: 0.1,
        }
    }
}

impl DecayPolicy {
    /// Activation after one cycle covering `elapsed_days`.
    ///
    /// `Δdays` is the time since this record was last decayed, so successive
    /// cycles compound and a second cycle at the same instant is a no-op.
    pub fn apply(&self, activation: f64, elapsed_days: f64) -> f64 {
        let factor = 1.0 / (1.0 + self.rate * elapsed_days.max(0.0));
        (activation * factor).clamp(self.floor, 1.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecayReport {
    pub records: usize,
    pub decayed: usize,
    pub at_floor: usize,
    pub mean_activation: f64,
}

#[derive(Debug, Clone)]
pub struct ThoughtStore {
    path: PathBuf,
    durable: DurableStore,
}

impl ThoughtStore {
    pub fn new(path: impl Into<PathBuf>, durable: DurableStore) -> Self {
        Self {
            path: path.into(),
            durable,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_all(&self) -> StoreResult<Vec<ThoughtRecord>> {
        self.durable.load(&self.path, Vec::new())
    }

    pub fn get(&self, id: &str) -> StoreResult<Option<ThoughtRecord>> {
        Ok(self.load_all()?.into_iter().find(|record| record.id == id))
    }

    pub fn count(&self) -> StoreResult<usize> {
        Ok(self.load_all()?.len())
    }

    /// Append `record`, rejecting an id that is already stored.  Returns the
    /// record count after the append.
    pub async fn append(&self, record: ThoughtRecord) -> StoreResult<usize> {
        self.durable
            .update(&self.path, Vec::new, move |records: &mut Vec<ThoughtRecord>| {
                if records.iter().any(|existing| existing.id == record.id) {
                    return Err(StoreError::DuplicateId(record.id));
                }
                debug!(id = %record.id, "appending record");
                records.push(record);
                Ok(records.len())
            })
            .await
    }

    /// Write the connections computed for `id`.  Returns `false` when the
    /// record is not in the store.
    pub async fn set_connections(&self, id: &str, connections: Vec<Connection>) -> StoreResult<bool> {
        self.durable
            .update(&self.path, Vec::new, |records: &mut Vec<ThoughtRecord>| {
                match records.iter_mut().find(|record| record.id == id) {
                    Some(record) => {
                        record.connections = connections;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
            .await
    }

    /// Run one decay cycle over every record at instant `now`.
    pub async fn apply_decay(&self, now: DateTime<Utc>, policy: DecayPolicy) -> StoreResult<DecayReport> {
        let report = self
            .durable
            .update(&self.path, Vec::new, |records: &mut Vec<ThoughtRecord>| {
                let mut report = DecayReport {
                    records: records.len(),
                    ..DecayReport::default()
                };
                for record in records.iter_mut() {
                    let since = record.last_decay.unwrap_or(record.timestamp);
                    let elapsed_days =
                        now.signed_duration_since(since).num_milliseconds() as f64 / 86_400_000.0;
                    if elapsed_days > 0.0 {
                        let next = policy.apply(record.activation, elapsed_days);
                        if next < record.activation {
                            report.decayed += 1;
                        }
                        record.activation = next;
                        record.last_decay = Some(now);
                    } else if record.activation < policy.floor {
                        record.activation = policy.floor;
                    }
                    if record.activation <= policy.floor {
                        report.at_floor += 1;
                    }
                    report.mean_activation += record.activation;
                }
                if report.records > 0 {
                    report.mean_activation /= report.records as f64;
                }
                Ok(report)
            })
            .await?;

        info!(
            records = report.records,
            decayed = report.decayed,
            at_floor = report.at_floor,
            mean_activation = report.mean_activation,
            "activation decay cycle complete"
        );
        Ok(report)
    }

    /// Ids currently stored, for consistency checks against derived indexes.
    pub fn ids(&self) -> StoreResult<HashSet<String>> {
        Ok(self.load_all()?.into_iter().map(|record| record.id).collect())
    }
}
