//! The external mood signal that modulates scheduling.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use reverie_memory::{DurableStore, StoreResult};

pub const AFFECT_FILE: &str = "affective_state.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodState {
    pub mood: String,
    pub intensity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for MoodState {
    fn default() -> Self {
        Self {
            mood: "neutral".to_string(),
            intensity: 0.0,
            updated_at: None,
        }
    }
}

const FALLBACK_SUCCESSORS: &[&str] = &["neutral", "curious", "reflective"];

/// Moods reachable from `mood` in one transition.
pub fn successors(mood: &str) -> &'static [&'static str] {
    match mood {
        "neutral" => &["curious", "reflective", "hopeful"],
        "curious" => &["reflective", "hopeful", "confused"],
        "reflective" => &["melancholy", "neutral", "curious"],
        "melancholy" => &["somber", "reflective", "neutral"],
        "somber" => &["melancholy", "reflective", "neutral"],
        "hopeful" => &["optimistic", "curious", "neutral"],
        "optimistic" => &["hopeful", "neutral", "curious"],
        "confused" => &["curious", "reflective", "neutral"],
        _ => FALLBACK_SUCCESSORS,
    }
}

/// Pick a successor mood with intensity drifting by at most ±0.2, kept in
/// `[0.1, 0.9]`.
pub fn next_mood<R: Rng + ?Sized>(current: &MoodState, rng: &mut R) -> (String, f64) {
    let mood = successors(&current.mood)
        .choose(rng)
        .copied()
        .unwrap_or("neutral")
        .to_string();
    let intensity = (current.intensity + rng.random_range(-0.2..=0.2)).clamp(0.1, 0.9);
    (mood, intensity)
}

const MOOD_KEYWORDS: &[(&str, &[&str])] = &[
    ("curious", &["discover", "explore", "fascinate", "intriguing", "possibility"]),
    ("reflective", &["consider", "meaning", "understand", "perspective", "insight"]),
    ("melancholy", &["loss", "fading", "distant", "alone", "forgotten"]),
    ("hopeful", &["light", "emerge", "possibility", "dawn", "future"]),
    ("confused", &["maze", "uncertain", "unclear", "shifting", "strange"]),
];

/// The mood whose keywords appear most often in `text`.  Ties go to the
/// earlier mood in the table.
pub fn mood_from_text(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    let mut best: Option<(&'static str, usize)> = None;
    for &(mood, keywords) in MOOD_KEYWORDS {
        let score = keywords.iter().filter(|k| lower.contains(*k)).count();
        if score > 0 && best.is_none_or(|(_, top)| score > top) {
            best = Some((mood, score));
        }
    }
    best.map(|(mood, _)| mood)
}

/// Intensity after a text-driven mood shift: mostly the old intensity, with
/// a pull toward the middle of the range.
pub fn blended_intensity<R: Rng + ?Sized>(current: f64, rng: &mut R) -> f64 {
    (current * 0.7 + rng.random_range(0.4..=0.8) * 0.3).clamp(0.1, 0.9)
}

#[derive(Debug, Clone)]
pub struct MoodStore {
    path: PathBuf,
    durable: DurableStore,
}

impl MoodStore {
    pub fn new(data_dir: &Path, durable: DurableStore) -> Self {
        Self {
            path: data_dir.join(AFFECT_FILE),
            durable,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> StoreResult<MoodState> {
        self.durable.load(&self.path, MoodState::default())
    }

    /// Replace the mood.  Intensity is clamped to `[0, 1]` and rounded to two
    /// decimals.
    pub async fn set(&self, mood: &str, intensity: f64) -> StoreResult<MoodState> {
        let next = MoodState {
            mood: mood.trim().to_lowercase(),
            intensity: (intensity.clamp(0.0, 1.0) * 100.0).round() / 100.0,
            updated_at: Some(Utc::now()),
        };
        let stored = next.clone();
        self.durable
            .update(&self.path, MoodState::default, move |state: &mut MoodState| {
                *state = stored;
                Ok(())
            })
            .await?;
        debug!(mood = %next.mood, intensity = next.intensity, "mood set");
        Ok(next)
    }
}
