use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Reverie".to_string(),
        }
    }
}

// ── Storage ───────────────────────────────────────────────────────────────────

/// Where persisted resources live and how the advisory file lock behaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding every persisted resource (records, index, graph,
    /// scheduler state).  Overridden by `REVERIE_DATA_DIR`.
    pub data_dir: String,
    /// Root for timestamped integrity snapshots.
    pub snapshot_dir: String,
    /// Bounded wait for lock acquisition before failing with a timeout.
    pub lock_timeout_secs: u64,
    /// Age after which a lock marker is presumed abandoned.
    pub lock_stale_secs: u64,
    pub lock_poll_millis: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: ".reverie/data".to_string(),
            snapshot_dir: ".reverie/snapshots".to_string(),
            lock_timeout_secs: 10,
            lock_stale_secs: 300,
            lock_poll_millis: 100,
        }
    }
}

impl StorageConfig {
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.snapshot_dir)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_millis.max(1))
    }
}

// ── Memory graph tuning ───────────────────────────────────────────────────────

/// Hand-tuned constants for connection strength, activation decay and
/// retrieval ranking.
///
/// Connection strength between a new record and a candidate:
///
/// ```text
/// strength = semantic_weight · similarity
///          + time_weight     · 1 / (1 + time_decay_per_hour · Δhours)
///          + origin_weight   · (same_origin_factor | cross_origin_factor)
/// ```
///
/// Only connections strictly above `connection_threshold` are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Nearest neighbours considered when linking a new record.
    pub connection_candidates: usize,
    pub semantic_weight: f64,
    pub time_weight: f64,
    pub origin_weight: f64,
    pub time_decay_per_hour: f64,
    pub same_origin_factor: f64,
    pub cross_origin_factor: f64,
    pub connection_threshold: f64,
    /// Per-day decay rate applied multiplicatively to activation.
    pub decay_rate: f64,
    /// Activation never drops below this value.
    pub activation_floor: f64,
    /// Run a decay cycle whenever the record count is a multiple of this.
    /// `0` disables insertion-triggered decay.
    pub decay_every: usize,
    pub search_similarity_weight: f64,
    pub search_activation_weight: f64,
    /// Default cut-off for `get_associated`.
    pub min_association_strength: f64,
    /// Regroup records into concept clusters whenever the record count is a
    /// multiple of this.  `0` disables insertion-triggered clustering.
    pub cluster_every: usize,
    /// Clustering is skipped below this many records.
    pub cluster_min_records: usize,
    /// Lloyd iterations per clustering pass.
    pub cluster_iterations: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            connection_candidates: 5,
            semantic_weight: 0.6,
            time_weight: 0.2,
            origin_weight: 0.2,
            time_decay_per_hour: 0.1,
            same_origin_factor: 1.2,
            cross_origin_factor: 0.8,
            connection_threshold: 0.3,
            decay_rate: 0.05,
            activation_floor: 0.1,
            decay_every: 10,
            search_similarity_weight: 0.7,
            search_activation_weight: 0.3,
            min_association_strength: 0.4,
            cluster_every: 20,
            cluster_min_records: 10,
            cluster_iterations: 20,
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between driver ticks.
    pub tick_seconds: u64,
    /// Static base interval per job kind, in seconds.  Kinds missing from the
    /// map fall back to one hour.
    pub intervals: BTreeMap<String, u64>,
    /// Uniform jitter applied to the adapted interval (0.1 = ±10%).
    pub jitter: f64,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
    /// Per-retune nudge applied to dynamic intervals (0.05 = ±5%).
    pub interval_drift: f64,
    /// Dynamic intervals stay within this fraction of the static default.
    pub drift_bound: f64,
    pub retune_minutes: u64,
    pub mood_transition_minutes: u64,
    /// Chance that a reflection schedules a follow-up thought chain.
    pub chain_probability: f64,
    /// How long shutdown waits for in-flight jobs before aborting them.
    pub shutdown_grace_secs: u64,
}

pub const FALLBACK_INTERVAL_SECS: u64 = 3600;

impl Default for SchedulerConfig {
    fn default() -> Self {
        let intervals = [
            ("reflection", 300),
            ("dream", 900),
            ("monologue", 1200),
            ("existential", 1800),
            ("chain", 7200),
            ("integrity_check", 1800),
        ]
        .into_iter()
        .map(|(kind, secs)| (kind.to_string(), secs))
        .collect();

        Self {
            tick_seconds: 60,
            intervals,
            jitter: 0.1,
            min_multiplier: 0.5,
            max_multiplier: 2.0,
            interval_drift: 0.05,
            drift_bound: 0.3,
            retune_minutes: 60,
            mood_transition_minutes: 30,
            chain_probability: 0.2,
            shutdown_grace_secs: 10,
        }
    }
}

impl SchedulerConfig {
    /// Static base interval for `kind` in seconds.
    pub fn base_interval(&self, kind: &str) -> u64 {
        self.intervals
            .get(kind)
            .copied()
            .unwrap_or(FALLBACK_INTERVAL_SECS)
    }
}

// ── Models ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    /// `ollama` for the HTTP embedding endpoint, `hash` for the offline
    /// deterministic embedder.  Overridden by `REVERIE_EMBEDDER`.
    pub embedder: String,
    pub embed_model: String,
    pub embedding_dim: usize,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "llama3.1:8b".to_string(),
            embedder: "ollama".to_string(),
            embed_model: "nomic-embed-text".to_string(),
            embedding_dim: 768,
            base_url: "http://localhost:11434".to_string(),
            max_tokens: 200,
            temperature: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// When set, a daily-rolling log file is written here in addition to
    /// stderr.
    pub log_dir: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub storage: StorageConfig,
    pub memory: MemoryConfig,
    pub scheduler: SchedulerConfig,
    pub llm: LlmConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the tuning code would otherwise clamp against inverted
    /// or non-finite bounds.
    pub fn validate(&self) -> Result<()> {
        let mem = &self.memory;
        for (name, value) in [
            ("memory.semantic_weight", mem.semantic_weight),
            ("memory.time_weight", mem.time_weight),
            ("memory.origin_weight", mem.origin_weight),
            ("memory.time_decay_per_hour", mem.time_decay_per_hour),
            ("memory.same_origin_factor", mem.same_origin_factor),
            ("memory.cross_origin_factor", mem.cross_origin_factor),
            ("memory.decay_rate", mem.decay_rate),
            ("memory.search_similarity_weight", mem.search_similarity_weight),
            ("memory.search_activation_weight", mem.search_activation_weight),
            ("scheduler.interval_drift", self.scheduler.interval_drift),
        ] {
            non_negative(name, value)?;
        }
        unit_interval("memory.connection_threshold", mem.connection_threshold)?;
        unit_interval("memory.activation_floor", mem.activation_floor)?;
        unit_interval("memory.min_association_strength", mem.min_association_strength)?;

        let sched = &self.scheduler;
        ensure!(
            sched.min_multiplier.is_finite() && sched.min_multiplier > 0.0,
            "scheduler.min_multiplier must be a positive number, got {}",
            sched.min_multiplier
        );
        ensure!(
            sched.max_multiplier.is_finite() && sched.max_multiplier >= sched.min_multiplier,
            "scheduler.max_multiplier ({}) must not be below min_multiplier ({})",
            sched.max_multiplier,
            sched.min_multiplier
        );
        ensure!(
            (0.0..1.0).contains(&sched.jitter),
            "scheduler.jitter must be in [0, 1), got {}",
            sched.jitter
        );
        ensure!(
            (0.0..1.0).contains(&sched.drift_bound),
            "scheduler.drift_bound must be in [0, 1), got {}",
            sched.drift_bound
        );
        unit_interval("scheduler.chain_probability", sched.chain_probability)?;

        ensure!(self.llm.embedding_dim > 0, "llm.embedding_dim must be positive");
        Ok(())
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(dir) = non_empty_var("REVERIE_DATA_DIR") {
            self.storage.data_dir = dir;
        }
        if let Some(level) = non_empty_var("REVERIE_LOG_LEVEL") {
            self.telemetry.log_level = level;
        }
        if let Some(url) = non_empty_var("OLLAMA_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(embedder) = non_empty_var("REVERIE_EMBEDDER") {
            self.llm.embedder = embedder;
        }
    }
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    ensure!(
        value.is_finite() && value >= 0.0,
        "{name} must be a non-negative number, got {value}"
    );
    Ok(())
}

fn unit_interval(name: &str, value: f64) -> Result<()> {
    ensure!((0.0..=1.0).contains(&value), "{name} must be in [0, 1], got {value}");
    Ok(())
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // ── Tuning defaults ────────────────────────────────────────────────────
    // The memory graph and scheduler constants are load-bearing: changing
    // them changes which records link and how often jobs run.

    #[test]
    fn memory_tuning_defaults() {
        let mem = MemoryConfig::default();
        assert_eq!(mem.connection_candidates, 5);
        assert!((mem.semantic_weight - 0.6).abs() < f64::EPSILON);
        assert!((mem.time_weight - 0.2).abs() < f64::EPSILON);
        assert!((mem.origin_weight - 0.2).abs() < f64::EPSILON);
        assert!((mem.connection_threshold - 0.3).abs() < f64::EPSILON);
        assert!((mem.decay_rate - 0.05).abs() < f64::EPSILON);
        assert!((mem.activation_floor - 0.1).abs() < f64::EPSILON);
        assert_eq!(mem.decay_every, 10);
        assert_eq!(mem.cluster_every, 20);
        assert_eq!(mem.cluster_min_records, 10);
    }

    #[test]
    fn scheduler_defaults() {
        let sched = SchedulerConfig::default();
        assert_eq!(sched.base_interval("reflection"), 300);
        assert_eq!(sched.base_interval("dream"), 900);
        assert_eq!(sched.base_interval("integrity_check"), 1800);
        assert_eq!(sched.base_interval("unheard_of"), FALLBACK_INTERVAL_SECS);
        assert!((sched.jitter - 0.1).abs() < f64::EPSILON);
        assert!((sched.drift_bound - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn storage_defaults() {
        let storage = StorageConfig::default();
        assert_eq!(storage.lock_timeout(), Duration::from_secs(10));
        assert_eq!(storage.lock_stale_after(), Duration::from_secs(300));
        assert_eq!(storage.lock_poll_interval(), Duration::from_millis(100));
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.agent.name, "Reverie");
        assert_eq!(cfg.llm.provider, "ollama");
        assert_eq!(cfg.scheduler.tick_seconds, 60);
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[memory]
connection_threshold = 0.45

[scheduler.intervals]
reflection = 120
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert!((cfg.memory.connection_threshold - 0.45).abs() < f64::EPSILON);
        assert_eq!(cfg.memory.connection_candidates, 5);
        assert_eq!(cfg.scheduler.base_interval("reflection"), 120);
        // A map given in the file replaces the default map wholesale.
        assert_eq!(cfg.scheduler.base_interval("dream"), FALLBACK_INTERVAL_SECS);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    // ── validate ──────────────────────────────────────────────────────────

    fn rejected(config: &AppConfig, field: &str) {
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains(field), "expected {field} in: {err}");
    }

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn inverted_multipliers_are_rejected() {
        let mut cfg = AppConfig::default();
        cfg.scheduler.min_multiplier = 2.5;
        rejected(&cfg, "max_multiplier");
    }

    #[test]
    fn non_positive_or_nan_min_multiplier_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.scheduler.min_multiplier = 0.0;
        rejected(&cfg, "min_multiplier");
        cfg.scheduler.min_multiplier = f64::NAN;
        rejected(&cfg, "min_multiplier");
    }

    #[test]
    fn nan_max_multiplier_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.scheduler.max_multiplier = f64::NAN;
        rejected(&cfg, "max_multiplier");
    }

    #[test]
    fn negative_or_whole_drift_bound_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.scheduler.drift_bound = -0.1;
        rejected(&cfg, "drift_bound");
        cfg.scheduler.drift_bound = 1.0;
        rejected(&cfg, "drift_bound");
    }

    #[test]
    fn jitter_outside_unit_range_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.scheduler.jitter = -0.2;
        rejected(&cfg, "jitter");
        cfg.scheduler.jitter = 1.5;
        rejected(&cfg, "jitter");
    }

    #[test]
    fn negative_interval_drift_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.scheduler.interval_drift = -0.05;
        rejected(&cfg, "interval_drift");
    }

    #[test]
    fn chain_probability_above_one_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.scheduler.chain_probability = 1.2;
        rejected(&cfg, "chain_probability");
    }

    #[test]
    fn activation_floor_outside_unit_range_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.memory.activation_floor = 1.5;
        rejected(&cfg, "activation_floor");
        cfg.memory.activation_floor = -0.1;
        rejected(&cfg, "activation_floor");
    }

    #[test]
    fn threshold_and_association_cutoff_outside_unit_range_are_rejected() {
        let mut cfg = AppConfig::default();
        cfg.memory.connection_threshold = 2.0;
        rejected(&cfg, "connection_threshold");

        let mut cfg = AppConfig::default();
        cfg.memory.min_association_strength = -1.0;
        rejected(&cfg, "min_association_strength");
    }

    #[test]
    fn negative_weights_and_rates_are_rejected() {
        let mut cfg = AppConfig::default();
        cfg.memory.decay_rate = -0.05;
        rejected(&cfg, "decay_rate");

        let mut cfg = AppConfig::default();
        cfg.memory.semantic_weight = f64::INFINITY;
        rejected(&cfg, "semantic_weight");

        let mut cfg = AppConfig::default();
        cfg.memory.cross_origin_factor = -0.8;
        rejected(&cfg, "cross_origin_factor");
    }

    #[test]
    fn zero_embedding_dim_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.llm.embedding_dim = 0;
        rejected(&cfg, "embedding_dim");
    }

    #[test]
    fn load_from_rejects_invalid_bounds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inverted.toml");
        fs::write(
            &path,
            r#"
[scheduler]
min_multiplier = 2.5
max_multiplier = 2.0
"#,
        )
        .unwrap();
        let err = AppConfig::load_from(&path).unwrap_err().to_string();
        assert!(err.contains("max_multiplier"), "{err}");
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.agent.name = "RoundTrip".to_string();
        cfg.llm.embedder = "hash".to_string();
        cfg.memory.decay_every = 25;
        cfg.scheduler.intervals.insert("dream".to_string(), 60);
        cfg.telemetry.log_dir = Some("/var/log/reverie".to_string());

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.agent.name, "RoundTrip");
        assert_eq!(loaded.memory.decay_every, 25);
        assert_eq!(loaded.scheduler.base_interval("dream"), 60);
        assert_eq!(loaded.telemetry.log_dir.as_deref(), Some("/var/log/reverie"));
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/config.toml");
        AppConfig::default().save_to(&path).unwrap();
        assert!(path.exists());
    }

    // ── Env var overrides ──────────────────────────────────────────────────

    #[test]
    fn env_embedder_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(
            &path,
            r#"
[llm]
embedder = "ollama"
"#,
        )
        .unwrap();

        // SAFETY: no other test reads REVERIE_EMBEDDER.
        unsafe { env::set_var("REVERIE_EMBEDDER", "hash") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.llm.embedder, "hash");
        unsafe { env::remove_var("REVERIE_EMBEDDER") };
    }

    #[test]
    fn blank_env_value_is_ignored() {
        assert!(non_empty_var("REVERIE_TEST_SURELY_UNSET_VAR").is_none());
    }

    #[test]
    fn shipped_default_file_matches_code_defaults() {
        let shipped: AppConfig = toml::from_str(include_str!("../../../config/default.toml")).unwrap();
        let code = AppConfig::default();
        assert_eq!(shipped.storage.data_dir, code.storage.data_dir);
        assert_eq!(shipped.memory.decay_every, code.memory.decay_every);
        assert_eq!(shipped.memory.cluster_every, code.memory.cluster_every);
        assert_eq!(shipped.scheduler.intervals, code.scheduler.intervals);
        assert_eq!(shipped.llm.embedding_dim, code.llm.embedding_dim);
        assert!(shipped.telemetry.log_dir.is_none());
    }
}
