use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::info;

use reverie_config::AppConfig;
use reverie_llm::{Embedder, Generator};
use reverie_memory::{DurableStore, GraphParams, IntegrityAuditor, LockOptions, MemoryGraph};

use crate::clock::AdaptiveClock;
use crate::mood::{AFFECT_FILE, MoodState, MoodStore};
use crate::state::{STATE_FILE, SchedulerStateStore};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Everything a job needs.  The memory graph is behind an async mutex
/// because its in-memory index is mutable; jobs hold it only around
/// memory calls, never across generation.
pub struct JobContext {
    pub memory: Arc<Mutex<MemoryGraph>>,
    pub generator: Arc<dyn Generator>,
    pub clock: AdaptiveClock,
    pub auditor: Arc<IntegrityAuditor>,
    pub generation: GenerationSettings,
    pub chain_probability: f64,
}

impl JobContext {
    /// Open memory, scheduler state and mood under `config.storage` and
    /// register the runtime's critical files with the auditor.
    pub async fn open(config: &AppConfig, embedder: Arc<dyn Embedder>, generator: Arc<dyn Generator>) -> Result<Self> {
        let data_dir = config.storage.data_path();
        let lock = LockOptions::from(&config.storage);

        let memory = MemoryGraph::open(&data_dir, embedder, GraphParams::from(&config.memory), lock)
            .await
            .with_context(|| format!("failed to open memory under {}", data_dir.display()))?;
        let clock = open_clock(config).await?;
        let auditor = integrity_auditor(config, clock.state_store())?;

        Ok(Self {
            memory: Arc::new(Mutex::new(memory)),
            generator,
            clock,
            auditor: Arc::new(auditor),
            generation: GenerationSettings {
                max_tokens: config.llm.max_tokens,
                temperature: config.llm.temperature,
            },
            chain_probability: config.scheduler.chain_probability,
        })
    }
}

/// Scheduler state and mood stores under `config.storage`, with the state
/// file created from configuration on first use.
pub async fn open_clock(config: &AppConfig) -> Result<AdaptiveClock> {
    let data_dir = config.storage.data_path();
    let durable = DurableStore::new(LockOptions::from(&config.storage));

    let state = SchedulerStateStore::new(&data_dir, durable.clone(), &config.scheduler);
    if state.init().await.context("failed to initialize scheduler state")? {
        info!(path = %state.path().display(), "scheduler state created from configuration");
    }
    let mood = MoodStore::new(&data_dir, durable);
    Ok(AdaptiveClock::new(state, mood, config.scheduler.clone()))
}

/// An auditor that also knows the runtime's own critical files and their
/// defaults.
pub fn integrity_auditor(config: &AppConfig, state: &SchedulerStateStore) -> Result<IntegrityAuditor> {
    let durable = DurableStore::new(LockOptions::from(&config.storage));
    Ok(
        IntegrityAuditor::new(config.storage.data_path(), config.storage.snapshot_path(), durable)
            .with_critical(STATE_FILE, serde_json::to_value(state.defaults())?)
            .with_critical(AFFECT_FILE, serde_json::to_value(MoodState::default())?),
    )
}
