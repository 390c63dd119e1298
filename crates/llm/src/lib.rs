//! Model collaborators consumed by the memory substrate and the scheduler.
//!
//! Both models are treated as pure functions: [`Embedder`] maps text to a
//! fixed-length vector, [`Generator`] maps a prompt to text.  Neither retries
//! internally; retry policy belongs to the caller.

mod hash;
mod ollama;

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;

pub use hash::HashEmbedder;
pub use ollama::{OllamaEmbedder, OllamaGenerator};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text` into a vector of exactly [`Embedder::dimensions`] floats.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String>;
}

/// Select an embedding backend by name (`ollama` or `hash`).
pub fn build_embedder(
    backend: &str,
    model: &str,
    base_url: &str,
    dimensions: usize,
) -> Result<Arc<dyn Embedder>> {
    match backend.trim().to_ascii_lowercase().as_str() {
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(model, base_url, dimensions))),
        "hash" | "offline" => Ok(Arc::new(HashEmbedder::new(dimensions))),
        other => bail!("unknown embedder backend: {other}"),
    }
}

/// Strip the wrapping a chat model tends to put around a short answer:
/// surrounding whitespace, matching quotes, and a leading "Thought:" style
/// label.
pub fn clean_generation(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some((label, rest)) = text.split_once(':') {
        if !label.is_empty() && label.len() <= 16 && !label.contains(char::is_whitespace) {
            text = rest.trim_start();
        }
    }
    for quote in ['"', '\'', '“'] {
        let close = if quote == '“' { '”' } else { quote };
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(close) {
            text = &text[quote.len_utf8()..text.len() - close.len_utf8()];
            break;
        }
    }
    text.trim().to_string()
}
