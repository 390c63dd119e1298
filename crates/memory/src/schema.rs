use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ORIGIN_KEY: &str = "origin";
pub const UNKNOWN_ORIGIN: &str = "unknown";

/// Producers of records the system knows about.  The `origin` metadata tag
/// is open-ended; these are the values the scheduler's jobs write.
///
/// | Origin                | Written by                                  |
/// |-----------------------|---------------------------------------------|
/// | `reflection`          | periodic reflection job                     |
/// | `dream`               | dream job                                   |
/// | `monologue`           | inner monologue job                         |
/// | `existential_question`| existential job                             |
/// | `thought_chain`       | chain job continuing an associative trace   |
/// | `external`            | records added by a collaborator or the CLI  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Reflection,
    Dream,
    Monologue,
    ExistentialQuestion,
    ThoughtChain,
    External,
}

impl Origin {
    pub fn slug(self) -> &'static str {
        match self {
            Self::Reflection => "reflection",
            Self::Dream => "dream",
            Self::Monologue => "monologue",
            Self::ExistentialQuestion => "existential_question",
            Self::ThoughtChain => "thought_chain",
            Self::External => "external",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reflection" => Some(Self::Reflection),
            "dream" => Some(Self::Dream),
            "monologue" => Some(Self::Monologue),
            "existential_question" | "existential" => Some(Self::ExistentialQuestion),
            "thought_chain" | "chain" => Some(Self::ThoughtChain),
            "external" | "user" => Some(Self::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub target_id: String,
    pub strength: f64,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default = "full_activation")]
    pub activation: f64,
    /// When the last decay cycle touched this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decay: Option<DateTime<Utc>>,
    /// Query-time ranking score; never persisted.
    #[serde(skip)]
    pub relevance_score: Option<f64>,
}

fn full_activation() -> f64 {
    1.0
}

impl ThoughtRecord {
    /// A fresh record with a time-ordered id and sanitized text.
    pub fn new(
        text: &str,
        metadata: BTreeMap<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            timestamp,
            text: sanitize_text(text),
            metadata,
            connections: Vec::new(),
            activation: full_activation(),
            last_decay: None,
            relevance_score: None,
        }
    }

    pub fn origin(&self) -> &str {
        self.metadata
            .get(ORIGIN_KEY)
            .and_then(|value| value.as_str())
            .unwrap_or(UNKNOWN_ORIGIN)
    }

    /// First 8 characters of the id, for log lines and CLI output.
    pub fn id_short(&self) -> &str {
        match self.id.char_indices().nth(8) {
            Some((i, _)) => &self.id[..i],
            None => &self.id,
        }
    }
}

/// Build a metadata map holding just an origin tag.
pub fn origin_metadata(origin: &str) -> BTreeMap<String, serde_json::Value> {
    let mut metadata = BTreeMap::new();
    metadata.insert(ORIGIN_KEY.to_string(), serde_json::Value::from(origin));
    metadata
}

/// Replace every control character with a space and trim the result.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Label for a link from a record of origin `source` to one of origin
/// `target`.  The checks run in order; the first match wins.
pub fn connection_type(source: &str, target: &str) -> String {
    match (source, target) {
        ("dream", "reflection") => "dream_inspiration".to_string(),
        ("reflection", "dream") => "reflection_of_dream".to_string(),
        (a, b) if a == b => format!("shared_{a}_context"),
        (a, b) if a == "existential_question" || b == "existential_question" => {
            "philosophical_link".to_string()
        }
        _ => "semantic_association".to_string(),
    }
}

/// Truncate `s` to at most `max_chars` Unicode scalar values.
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_control_characters() {
        assert_eq!(sanitize_text("  line one\nline\ttwo\u{7}  "), "line one line two");
        assert_eq!(sanitize_text("plain"), "plain");
    }

    #[test]
    fn connection_type_table() {
        assert_eq!(connection_type("dream", "reflection"), "dream_inspiration");
        assert_eq!(connection_type("reflection", "dream"), "reflection_of_dream");
        assert_eq!(connection_type("dream", "dream"), "shared_dream_context");
        assert_eq!(
            connection_type("existential_question", "existential_question"),
            "shared_existential_question_context"
        );
        assert_eq!(connection_type("monologue", "existential_question"), "philosophical_link");
        assert_eq!(connection_type("monologue", "dream"), "semantic_association");
    }

    #[test]
    fn record_serialization_skips_relevance() {
        let mut record = ThoughtRecord::new("hello", origin_metadata("dream"), Utc::now());
        record.relevance_score = Some(0.9);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("relevance_score").is_none());
        assert!(json.get("last_decay").is_none());

        let back: ThoughtRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.relevance_score, None);
        assert_eq!(back.origin(), "dream");
        assert_eq!(back.activation, 1.0);
    }

    #[test]
    fn missing_origin_reads_as_unknown() {
        let record = ThoughtRecord::new("x", BTreeMap::new(), Utc::now());
        assert_eq!(record.origin(), UNKNOWN_ORIGIN);
    }

    #[test]
    fn origin_labels_roundtrip() {
        for origin in [
            Origin::Reflection,
            Origin::Dream,
            Origin::Monologue,
            Origin::ExistentialQuestion,
            Origin::ThoughtChain,
            Origin::External,
        ] {
            assert_eq!(Origin::from_label(origin.slug()), Some(origin));
        }
        assert_eq!(Origin::from_label("weather"), None);
    }
}
