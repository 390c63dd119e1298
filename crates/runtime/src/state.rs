//! Persisted scheduling metadata: `scheduler_state.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reverie_config::SchedulerConfig;
use reverie_memory::{DurableStore, StoreResult};

pub const STATE_FILE: &str = "scheduler_state.json";
pub const MOOD_HISTORY_CAP: usize = 20;
pub const CHAIN_HISTORY_CAP: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodTransition {
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub to: String,
    pub from_intensity: f64,
    pub to_intensity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub timestamp: DateTime<Utc>,
    pub seed_id: String,
    pub thought_ids: Vec<String>,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerState {
    /// Last execution per job kind.  Absent means never run.
    pub last_runs: BTreeMap<String, DateTime<Utc>>,
    /// Current base interval per kind in seconds, nudged by retuning.
    pub dynamic_intervals: BTreeMap<String, f64>,
    pub mood_transitions: Vec<MoodTransition>,
    pub thought_chains: Vec<ChainRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_chain_seed: Option<String>,
    pub recent_external_input: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl SchedulerState {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            dynamic_intervals: config
                .intervals
                .iter()
                .map(|(kind, secs)| (kind.clone(), *secs as f64))
                .collect(),
            ..Self::default()
        }
    }

    pub fn push_transition(&mut self, transition: MoodTransition) {
        push_capped(&mut self.mood_transitions, transition, MOOD_HISTORY_CAP);
    }

    pub fn push_chain(&mut self, chain: ChainRecord) {
        push_capped(&mut self.thought_chains, chain, CHAIN_HISTORY_CAP);
    }
}

fn push_capped<T>(items: &mut Vec<T>, item: T, cap: usize) {
    items.push(item);
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerStateStore {
    path: PathBuf,
    durable: DurableStore,
    defaults: SchedulerState,
}

impl SchedulerStateStore {
    pub fn new(data_dir: &Path, durable: DurableStore, config: &SchedulerConfig) -> Self {
        Self {
            path: data_dir.join(STATE_FILE),
            durable,
            defaults: SchedulerState::from_config(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn defaults(&self) -> &SchedulerState {
        &self.defaults
    }

    pub fn load(&self) -> StoreResult<SchedulerState> {
        self.durable.load(&self.path, self.defaults.clone())
    }

    /// Locked read-modify-write; stamps `last_updated`.
    pub async fn update<R>(&self, f: impl FnOnce(&mut SchedulerState) -> R) -> StoreResult<R> {
        let defaults = self.defaults.clone();
        self.durable
            .update(&self.path, move || defaults, |state: &mut SchedulerState| {
                let out = f(state);
                state.last_updated = Some(Utc::now());
                Ok(out)
            })
            .await
    }

    /// Write the defaults if no state exists yet.  Returns whether it did.
    pub async fn init(&self) -> StoreResult<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        self.update(|_| ()).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverie_memory::durable::backup_path;
    use std::fs;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> SchedulerStateStore {
        SchedulerStateStore::new(dir.path(), DurableStore::default(), &SchedulerConfig::default())
    }

    #[tokio::test]
    async fn init_writes_config_defaults_once() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.init().await.unwrap());
        assert!(!store.init().await.unwrap());

        let state = store.load().unwrap();
        assert!(state.last_runs.is_empty());
        assert_eq!(state.dynamic_intervals["reflection"], 300.0);
        assert!(state.last_updated.is_some());
    }

    #[tokio::test]
    async fn corrupt_state_recovers_from_backup_and_is_repaired() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let first = Utc::now() - chrono::Duration::minutes(5);
        store
            .update(|s| {
                s.last_runs.insert("dream".to_string(), first);
            })
            .await
            .unwrap();
        store
            .update(|s| {
                s.last_runs.insert("reflection".to_string(), Utc::now());
            })
            .await
            .unwrap();
        assert!(backup_path(store.path()).exists());

        fs::write(store.path(), b"{\"last_runs\": {\"dream\": ").unwrap();
        let recovered = store.load().unwrap();
        assert_eq!(recovered.last_runs.get("dream"), Some(&first));
        assert!(!recovered.last_runs.contains_key("reflection"));

        let repaired: SchedulerState = serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(repaired, recovered);
    }

    #[test]
    fn histories_are_capped() {
        let mut state = SchedulerState::default();
        for i in 0..25 {
            state.push_transition(MoodTransition {
                timestamp: Utc::now(),
                from: format!("m{i}"),
                to: format!("m{}", i + 1),
                from_intensity: 0.5,
                to_intensity: 0.5,
            });
            state.push_chain(ChainRecord {
                timestamp: Utc::now(),
                seed_id: format!("s{i}"),
                thought_ids: Vec::new(),
                length: 0,
            });
        }
        assert_eq!(state.mood_transitions.len(), MOOD_HISTORY_CAP);
        assert_eq!(state.mood_transitions[0].from, "m5");
        assert_eq!(state.thought_chains.len(), CHAIN_HISTORY_CAP);
        assert_eq!(state.thought_chains.last().unwrap().seed_id, "s24");
    }
}
