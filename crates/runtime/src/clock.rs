//! Mood-modulated job intervals.
//!
//! ```text
//! adapted = base · clamp(mood_factor · kind_factor, 0.5, 2.0) · U(0.9, 1.1)
//! ```
//!
//! where `base` is the kind's dynamic interval.  A job is due once the time
//! since its last run reaches the adapted interval; a job that never ran is
//! due immediately.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{debug, info};

use reverie_config::{FALLBACK_INTERVAL_SECS, SchedulerConfig};
use reverie_memory::StoreResult;

use crate::jobs::JobKind;
use crate::mood::{MoodState, MoodStore, next_mood};
use crate::state::{MoodTransition, SchedulerState, SchedulerStateStore};

/// Mood intensity above which jobs run more often.
const HIGH_INTENSITY: f64 = 0.7;
const LOW_INTENSITY: f64 = 0.3;
const CHAIN_INTENSITY: f64 = 0.6;
const MOOD_TRANSITION_CHANCE: f64 = 0.3;
/// A scheduled chain becomes due roughly this long after scheduling.
const CHAIN_LEAD_SECS: f64 = 60.0;

pub fn mood_factor(intensity: f64) -> f64 {
    if intensity > HIGH_INTENSITY {
        0.7
    } else if intensity < LOW_INTENSITY {
        1.3
    } else {
        1.0
    }
}

pub fn kind_factor(kind: JobKind, mood: &MoodState, recent_external_input: bool) -> f64 {
    let m = mood.mood.as_str();
    match kind {
        JobKind::Reflection if matches!(m, "reflective" | "curious") => 0.8,
        JobKind::Dream if matches!(m, "melancholy" | "confused") => 0.8,
        JobKind::Existential if matches!(m, "reflective" | "somber") => 0.8,
        JobKind::Existential => 1.2,
        JobKind::Chain if mood.intensity > CHAIN_INTENSITY => 0.7,
        JobKind::Monologue if recent_external_input => 0.7,
        _ => 1.0,
    }
}

/// The kind's current base interval: dynamic, then configured, then one
/// hour.
pub fn base_interval(config: &SchedulerConfig, state: &SchedulerState, kind: JobKind) -> f64 {
    state
        .dynamic_intervals
        .get(kind.as_str())
        .copied()
        .filter(|secs| *secs > 0.0)
        .or_else(|| config.intervals.get(kind.as_str()).map(|secs| *secs as f64))
        .unwrap_or(FALLBACK_INTERVAL_SECS as f64)
}

/// Adapted interval before jitter, in seconds.
pub fn adapted_interval(config: &SchedulerConfig, state: &SchedulerState, mood: &MoodState, kind: JobKind) -> f64 {
    let multiplier = (mood_factor(mood.intensity) * kind_factor(kind, mood, state.recent_external_input))
        .clamp(config.min_multiplier, config.max_multiplier);
    base_interval(config, state, kind) * multiplier
}

/// The range the jittered interval can fall in.
pub fn interval_bounds(config: &SchedulerConfig, state: &SchedulerState, mood: &MoodState, kind: JobKind) -> (f64, f64) {
    let adapted = adapted_interval(config, state, mood, kind);
    (adapted * (1.0 - config.jitter), adapted * (1.0 + config.jitter))
}

pub fn should_execute_at<R: Rng + ?Sized>(
    config: &SchedulerConfig,
    state: &SchedulerState,
    mood: &MoodState,
    kind: JobKind,
    now: DateTime<Utc>,
    rng: &mut R,
) -> bool {
    let Some(last) = state.last_runs.get(kind.as_str()) else {
        return true;
    };
    let jitter = config.jitter.abs();
    let interval = adapted_interval(config, state, mood, kind) * rng.random_range(1.0 - jitter..=1.0 + jitter);
    let elapsed = now.signed_duration_since(*last).num_milliseconds() as f64 / 1000.0;
    elapsed >= interval
}

/// Nudge every dynamic interval by a uniform `±drift` and keep it within
/// `±bound` of the configured default.
pub fn retune<R: Rng + ?Sized>(config: &SchedulerConfig, state: &mut SchedulerState, rng: &mut R) {
    let drift = config.interval_drift.abs();
    for (kind, secs) in state.dynamic_intervals.iter_mut() {
        let default = config.intervals.get(kind).map(|d| *d as f64).unwrap_or(*secs);
        let nudged = *secs * rng.random_range(1.0 - drift..=1.0 + drift);
        *secs = nudged.clamp(default * (1.0 - config.drift_bound), default * (1.0 + config.drift_bound));
    }
}

/// Owns the scheduling state and the mood signal and answers "is this job
/// due?".
#[derive(Debug, Clone)]
pub struct AdaptiveClock {
    state: SchedulerStateStore,
    mood: MoodStore,
    config: SchedulerConfig,
}

impl AdaptiveClock {
    pub fn new(state: SchedulerStateStore, mood: MoodStore, config: SchedulerConfig) -> Self {
        Self { state, mood, config }
    }

    pub fn state_store(&self) -> &SchedulerStateStore {
        &self.state
    }

    pub fn mood_store(&self) -> &MoodStore {
        &self.mood
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn should_execute(&self, kind: JobKind) -> StoreResult<bool> {
        let state = self.state.load()?;
        let mood = self.mood.load()?;
        let due = should_execute_at(&self.config, &state, &mood, kind, Utc::now(), &mut rand::rng());
        debug!(kind = kind.as_str(), due, "due check");
        Ok(due)
    }

    /// Record a run of `kind` at the current instant, whatever its outcome.
    /// A monologue run also consumes the external-input marker.
    pub async fn mark_executed(&self, kind: JobKind) -> StoreResult<()> {
        self.mark_executed_at(kind, Utc::now()).await
    }

    pub async fn mark_executed_at(&self, kind: JobKind, at: DateTime<Utc>) -> StoreResult<()> {
        self.state
            .update(|state| {
                state.last_runs.insert(kind.as_str().to_string(), at);
                if kind == JobKind::Monologue {
                    state.recent_external_input = false;
                }
            })
            .await
    }

    pub async fn retune_intervals(&self) -> StoreResult<BTreeMap<String, f64>> {
        let config = &self.config;
        let intervals = self
            .state
            .update(|state| {
                retune(config, state, &mut rand::rng());
                state.dynamic_intervals.clone()
            })
            .await?;
        info!(intervals = ?intervals, "dynamic intervals retuned");
        Ok(intervals)
    }

    /// Seed the next chain at `seed_id` and move the chain timer so the
    /// chain becomes due about a minute from now.
    pub async fn schedule_chain(&self, seed_id: &str) -> StoreResult<()> {
        let config = &self.config;
        self.state
            .update(|state| {
                let interval = base_interval(config, state, JobKind::Chain);
                let back = ((interval - CHAIN_LEAD_SECS).max(0.0) * 1000.0) as i64;
                state
                    .last_runs
                    .insert(JobKind::Chain.as_str().to_string(), Utc::now() - Duration::milliseconds(back));
                state.next_chain_seed = Some(seed_id.to_string());
            })
            .await?;
        info!(seed = %seed_id, "thought chain scheduled");
        Ok(())
    }

    pub async fn note_external_input(&self) -> StoreResult<()> {
        self.state.update(|state| state.recent_external_input = true).await
    }

    /// With 30% probability move the mood to a successor and record the
    /// transition.
    pub async fn maybe_transition_mood(&self) -> StoreResult<Option<MoodTransition>> {
        let current = self.mood.load()?;
        let next = {
            let mut rng = rand::rng();
            rng.random_bool(MOOD_TRANSITION_CHANCE)
                .then(|| next_mood(&current, &mut rng))
        };
        match next {
            Some((mood, intensity)) => self.transition_to(&current, &mood, intensity).await.map(Some),
            None => Ok(None),
        }
    }

    /// Set the mood and append the transition to the bounded history.
    pub async fn transition_to(&self, from: &MoodState, mood: &str, intensity: f64) -> StoreResult<MoodTransition> {
        let set = self.mood.set(mood, intensity).await?;
        let transition = MoodTransition {
            timestamp: Utc::now(),
            from: from.mood.clone(),
            to: set.mood.clone(),
            from_intensity: from.intensity,
            to_intensity: set.intensity,
        };
        let recorded = transition.clone();
        self.state.update(move |state| state.push_transition(recorded)).await?;
        info!(from = %transition.from, to = %transition.to, intensity = transition.to_intensity, "mood transition");
        Ok(transition)
    }
}
