//! The periodic jobs the scheduler drives.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rand::seq::IndexedRandom;
use serde_json::json;
use tracing::{debug, info};

use reverie_llm::clean_generation;
use reverie_memory::schema::truncate_str;
use reverie_memory::{Origin, ThoughtRecord, origin_metadata};

use crate::context::JobContext;
use crate::mood::{MoodState, blended_intensity, mood_from_text};
use crate::state::ChainRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKind {
    Reflection,
    Dream,
    Monologue,
    Existential,
    Chain,
    IntegrityCheck,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        Self::Reflection,
        Self::Dream,
        Self::Monologue,
        Self::Existential,
        Self::Chain,
        Self::IntegrityCheck,
    ];

    /// Key used in scheduler state and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reflection => "reflection",
            Self::Dream => "dream",
            Self::Monologue => "monologue",
            Self::Existential => "existential",
            Self::Chain => "chain",
            Self::IntegrityCheck => "integrity_check",
        }
    }

    /// Origin tag of the records this kind writes, if any.
    pub fn origin(self) -> Option<Origin> {
        match self {
            Self::Reflection => Some(Origin::Reflection),
            Self::Dream => Some(Origin::Dream),
            Self::Monologue => Some(Origin::Monologue),
            Self::Existential => Some(Origin::ExistentialQuestion),
            Self::Chain => Some(Origin::ThoughtChain),
            Self::IntegrityCheck => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .with_context(|| format!("unknown job kind: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Thought { id: String, text: String },
    Chain(ChainRecord),
    Audit { issues: usize, repairs: usize },
    Skipped(String),
}

#[async_trait]
pub trait Job: Send + Sync {
    fn kind(&self) -> JobKind;
    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome>;
}

/// One job per kind.
pub fn default_jobs() -> Vec<Arc<dyn Job>> {
    vec![
        Arc::new(ThoughtJob::new(JobKind::Reflection)),
        Arc::new(ThoughtJob::new(JobKind::Dream)),
        Arc::new(ThoughtJob::new(JobKind::Monologue)),
        Arc::new(ThoughtJob::new(JobKind::Existential)),
        Arc::new(ChainJob),
        Arc::new(IntegrityJob),
    ]
}

// ── Prompts ───────────────────────────────────────────────────────────────────

const FRAGMENT_CHARS: usize = 160;

fn fragments_block(fragments: &[ThoughtRecord]) -> String {
    if fragments.is_empty() {
        return "(no earlier thoughts yet)".to_string();
    }
    fragments
        .iter()
        .map(|r| format!("- {}", truncate_str(&r.text, FRAGMENT_CHARS)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn prompt_for(kind: JobKind, mood: &MoodState, fragments: &[ThoughtRecord]) -> String {
    let task = match kind {
        JobKind::Reflection => "Reflect briefly on what these recent thoughts reveal. Answer in one or two sentences.",
        JobKind::Dream => "Describe a short, strange dream image woven from these thoughts. One or two sentences.",
        JobKind::Monologue => "Continue your inner monologue in one or two plain sentences.",
        JobKind::Existential => "Ask yourself one honest question about your own existence. One sentence.",
        JobKind::Chain | JobKind::IntegrityCheck => "Continue the thought.",
    };
    format!(
        "You are a quiet, introspective mind. Current mood: {} (intensity {:.2}).\n\nRecent thoughts:\n{}\n\n{}",
        mood.mood,
        mood.intensity,
        fragments_block(fragments),
        task
    )
}

fn chain_prompt(previous: &ThoughtRecord, context: &[ThoughtRecord], step: usize, length: usize) -> String {
    format!(
        "You are following a train of thought (step {} of {}).\n\nPrevious thought:\n{}\n\nAssociated thoughts:\n{}\n\nWrite the next thought in the chain, one or two sentences.",
        step + 1,
        length,
        truncate_str(&previous.text, FRAGMENT_CHARS * 2),
        fragments_block(context)
    )
}

async fn generate(ctx: &JobContext, prompt: &str) -> Result<String> {
    let raw = ctx
        .generator
        .generate(prompt, ctx.generation.max_tokens, ctx.generation.temperature)
        .await
        .context("generation failed")?;
    let text = clean_generation(&raw);
    if text.is_empty() {
        bail!("generator returned no text");
    }
    Ok(text)
}

// ── Thought jobs ──────────────────────────────────────────────────────────────

const RECENT_FRAGMENTS: usize = 3;
const DREAM_MOOD_CHANCE: f64 = 0.3;

/// Reflection, dream, monologue and existential jobs: generate one thought
/// from the mood and recent memory, then store and link it.
pub struct ThoughtJob {
    kind: JobKind,
}

impl ThoughtJob {
    pub fn new(kind: JobKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Job for ThoughtJob {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome> {
        let origin = self.kind.origin().context("job kind writes no records")?;
        let mood = ctx.clock.mood_store().load()?;
        let fragments = ctx.memory.lock().await.recent(RECENT_FRAGMENTS)?;

        let text = generate(ctx, &prompt_for(self.kind, &mood, &fragments)).await?;

        let mut metadata = origin_metadata(origin.slug());
        metadata.insert("mood".to_string(), json!(mood.mood));
        metadata.insert("mood_intensity".to_string(), json!(mood.intensity));
        let record = ctx.memory.lock().await.save_record(&text, metadata).await?;
        info!(kind = %self.kind, id = %record.id_short(), connections = record.connections.len(), "thought stored");

        match self.kind {
            JobKind::Reflection => {
                let chained = rand::rng().random_bool(ctx.chain_probability.clamp(0.0, 1.0));
                if chained {
                    ctx.clock.schedule_chain(&record.id).await?;
                }
            }
            JobKind::Dream => {
                let shift = rand::rng().random_bool(DREAM_MOOD_CHANCE);
                if shift {
                    shift_mood_from_dream(ctx, &mood, &record.text).await?;
                }
            }
            _ => {}
        }

        Ok(JobOutcome::Thought {
            id: record.id,
            text: record.text,
        })
    }
}

async fn shift_mood_from_dream(ctx: &JobContext, current: &MoodState, text: &str) -> Result<()> {
    let Some(mood) = mood_from_text(text) else {
        return Ok(());
    };
    if mood == current.mood {
        return Ok(());
    }
    let intensity = blended_intensity(current.intensity, &mut rand::rng());
    ctx.clock.transition_to(current, mood, intensity).await?;
    Ok(())
}

// ── Chains ────────────────────────────────────────────────────────────────────

const CHAIN_SEED_POOL: usize = 20;
const CHAIN_TRACE_DEPTH: usize = 2;
const CHAIN_TRACE_BRANCH: usize = 2;

/// Follows associations from a seed record and writes a short sequence of
/// continuations.
pub struct ChainJob;

impl ChainJob {
    async fn chain_from(&self, ctx: &JobContext, seed: Option<String>) -> Result<Option<ChainRecord>> {
        let seed = {
            let memory = ctx.memory.lock().await;
            let scheduled = match seed {
                Some(id) => memory.load_record_by_id(&id)?,
                None => None,
            };
            match scheduled {
                Some(record) => Some(record),
                None => memory.recent(CHAIN_SEED_POOL)?.choose(&mut rand::rng()).cloned(),
            }
        };
        let Some(seed) = seed else {
            return Ok(None);
        };

        let length = rand::rng().random_range(2..=4);
        let mut previous = seed.clone();
        let mut thought_ids = Vec::with_capacity(length);
        for step in 0..length {
            let context: Vec<ThoughtRecord> = ctx
                .memory
                .lock()
                .await
                .trace(&previous.id, CHAIN_TRACE_DEPTH, CHAIN_TRACE_BRANCH)?
                .into_iter()
                .filter(|r| r.id != previous.id)
                .take(RECENT_FRAGMENTS)
                .collect();

            let text = generate(ctx, &chain_prompt(&previous, &context, step, length)).await?;
            let mut metadata = origin_metadata(Origin::ThoughtChain.slug());
            metadata.insert("seed_id".to_string(), json!(seed.id));
            metadata.insert("previous_id".to_string(), json!(previous.id));
            metadata.insert("chain_position".to_string(), json!(step + 1));
            let record = ctx.memory.lock().await.save_record(&text, metadata).await?;
            debug!(step, id = %record.id_short(), "chain link stored");
            thought_ids.push(record.id.clone());
            previous = record;
        }

        Ok(Some(ChainRecord {
            timestamp: Utc::now(),
            seed_id: seed.id,
            length: thought_ids.len(),
            thought_ids,
        }))
    }
}

#[async_trait]
impl Job for ChainJob {
    fn kind(&self) -> JobKind {
        JobKind::Chain
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome> {
        let seed = ctx.clock.state_store().load()?.next_chain_seed;
        let result = self.chain_from(ctx, seed).await;

        // The scheduled seed is consumed whether or not the chain succeeded.
        let recorded = result.as_ref().ok().cloned().flatten();
        ctx.clock
            .state_store()
            .update(move |state| {
                state.next_chain_seed = None;
                if let Some(chain) = recorded {
                    state.push_chain(chain);
                }
            })
            .await?;

        match result? {
            Some(chain) => {
                info!(seed = %chain.seed_id, length = chain.length, "thought chain complete");
                Ok(JobOutcome::Chain(chain))
            }
            None => Ok(JobOutcome::Skipped("no records to seed a chain".to_string())),
        }
    }
}

// ── Integrity ────────────────────────────────────────────────────────────────

pub struct IntegrityJob;

#[async_trait]
impl Job for IntegrityJob {
    fn kind(&self) -> JobKind {
        JobKind::IntegrityCheck
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome> {
        let report = ctx.auditor.audit().await?;
        Ok(JobOutcome::Audit {
            issues: report.issues_found,
            repairs: report.repairs_made,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use reverie_config::AppConfig;
    use reverie_llm::{Generator, HashEmbedder};
    use tempfile::TempDir;

    use super::*;

    /// Numbered canned replies.
    pub(crate) struct ScriptedGenerator {
        calls: AtomicUsize,
    }

    impl ScriptedGenerator {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, _prompt: &str, _max_tokens: u32, _temperature: f32) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("Thought: \"quiet thought number {n} about the sea\""))
        }
    }

    pub(crate) struct FailingGenerator;

    #[async_trait]
    impl Generator for FailingGenerator {
        async fn generate(&self, _prompt: &str, _max_tokens: u32, _temperature: f32) -> Result<String> {
            bail!("model offline")
        }
    }

    pub(crate) fn test_config(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().join("data").display().to_string();
        config.storage.snapshot_dir = dir.path().join("snapshots").display().to_string();
        config.llm.embedding_dim = 64;
        config
    }

    pub(crate) async fn context(dir: &TempDir, generator: Arc<dyn Generator>) -> JobContext {
        JobContext::open(&test_config(dir), Arc::new(HashEmbedder::new(64)), generator)
            .await
            .unwrap()
    }

    #[test]
    fn kinds_parse_and_print() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert_eq!("integrity-check".parse::<JobKind>().unwrap(), JobKind::IntegrityCheck);
        assert!("learning".parse::<JobKind>().is_err());
        assert_eq!(JobKind::Existential.origin().unwrap().slug(), "existential_question");
    }

    #[tokio::test]
    async fn thought_job_stores_a_cleaned_record() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Arc::new(ScriptedGenerator::new())).await;

        let outcome = ThoughtJob::new(JobKind::Monologue).run(&ctx).await.unwrap();
        let JobOutcome::Thought { id, text } = outcome else {
            panic!("expected a thought");
        };
        assert_eq!(text, "quiet thought number 0 about the sea");
        let stored = ctx.memory.lock().await.load_record_by_id(&id).unwrap().unwrap();
        assert_eq!(stored.origin(), "monologue");
        assert_eq!(stored.metadata["mood"], "neutral");
    }

    #[tokio::test]
    async fn failed_generation_stores_nothing() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Arc::new(FailingGenerator)).await;
        assert!(ThoughtJob::new(JobKind::Dream).run(&ctx).await.is_err());
        assert_eq!(ctx.memory.lock().await.stats().unwrap().records, 0);
    }

    #[tokio::test]
    async fn chain_follows_the_scheduled_seed_and_clears_it() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Arc::new(ScriptedGenerator::new())).await;
        let seed = ctx
            .memory
            .lock()
            .await
            .save_record("the sea at night", origin_metadata("reflection"))
            .await
            .unwrap();
        ctx.clock.schedule_chain(&seed.id).await.unwrap();

        let JobOutcome::Chain(chain) = ChainJob.run(&ctx).await.unwrap() else {
            panic!("expected a chain");
        };
        assert_eq!(chain.seed_id, seed.id);
        assert!((2..=4).contains(&chain.length));

        let state = ctx.clock.state_store().load().unwrap();
        assert_eq!(state.next_chain_seed, None);
        assert_eq!(state.thought_chains, vec![chain.clone()]);

        let memory = ctx.memory.lock().await;
        let first = memory.load_record_by_id(&chain.thought_ids[0]).unwrap().unwrap();
        assert_eq!(first.origin(), "thought_chain");
        assert_eq!(first.metadata["seed_id"], json!(seed.id));
    }

    #[tokio::test]
    async fn chain_without_records_is_skipped() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Arc::new(ScriptedGenerator::new())).await;
        assert!(matches!(ChainJob.run(&ctx).await.unwrap(), JobOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn failed_chain_still_clears_the_seed() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Arc::new(FailingGenerator)).await;
        let seed = ctx
            .memory
            .lock()
            .await
            .save_record("a seed", origin_metadata("reflection"))
            .await
            .unwrap();
        ctx.clock.schedule_chain(&seed.id).await.unwrap();

        assert!(ChainJob.run(&ctx).await.is_err());
        let state = ctx.clock.state_store().load().unwrap();
        assert_eq!(state.next_chain_seed, None);
        assert!(state.thought_chains.is_empty());
    }

    #[tokio::test]
    async fn integrity_job_reports_clean_directory() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Arc::new(ScriptedGenerator::new())).await;
        assert_eq!(
            IntegrityJob.run(&ctx).await.unwrap(),
            JobOutcome::Audit { issues: 0, repairs: 0 }
        );
    }
}
