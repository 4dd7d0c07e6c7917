//! Token counting and budget defaults for the chunker.
//!
//! Counting prefers `tiktoken-rs` encodings for the configured embedding model and falls back
//! to whitespace counting when no tokenizer can be resolved (typical for the offline hashing
//! embedder with a custom model label).

use std::sync::Arc;

use anyhow::Error as TokenizerError;
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, model::get_context_size, o200k_base, p50k_base,
    r50k_base,
};

use super::ChunkingError;
use crate::config::EmbeddingProvider;

/// Shared token counting function.
pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

const FALLBACK_CONTEXT_WINDOW: usize = 4096;

/// Per-chunk token budget: the explicit override (clamped to `>= 1`) or the model's context window.
pub fn determine_max_tokens(override_tokens: Option<usize>, model: &str) -> usize {
    match override_tokens {
        Some(explicit) => explicit.max(1),
        None => embedding_context_window(model),
    }
}

/// Input limit of the embedding model, in tokens.
pub fn embedding_context_window(model: &str) -> usize {
    if model.starts_with("text-embedding-3") || model.starts_with("text-embedding-ada-002") {
        return 8192;
    }
    let size = get_context_size(model);
    if size == 0 {
        FALLBACK_CONTEXT_WINDOW
    } else {
        size.min(FALLBACK_CONTEXT_WINDOW)
    }
}

/// Build the token counter matching the embedding backend.
///
/// The hosted provider must have a real tokenizer; the hashing embedder degrades to a
/// whitespace counter with a warning.
pub fn build_token_counter(
    provider: EmbeddingProvider,
    model: &str,
) -> Result<TokenCounter, ChunkingError> {
    match provider {
        EmbeddingProvider::OpenAI => build_tiktoken_counter(model),
        EmbeddingProvider::Hashing => match build_tiktoken_counter(model) {
            Ok(counter) => Ok(counter),
            Err(error) => {
                tracing::warn!(
                    model,
                    error = %error,
                    "Tokenizer unavailable; falling back to whitespace counter"
                );
                Ok(whitespace_token_counter())
            }
        },
    }
}

/// Counts whitespace-separated words; non-empty text is never zero tokens.
pub fn whitespace_token_counter() -> TokenCounter {
    Arc::new(|segment: &str| {
        let tokens = segment.split_whitespace().count();
        if tokens == 0 && !segment.is_empty() {
            1
        } else {
            tokens
        }
    })
}

fn build_tiktoken_counter(model: &str) -> Result<TokenCounter, ChunkingError> {
    let trimmed = model.trim();
    let target = if trimmed.is_empty() {
        "cl100k_base"
    } else {
        trimmed
    };
    let encoding = resolve_encoding(target).map_err(|source| ChunkingError::Tokenizer {
        model: target.to_string(),
        source,
    })?;
    let encoding = Arc::new(encoding);
    Ok(Arc::new(move |segment: &str| {
        encoding.encode_ordinary(segment).len()
    }))
}

fn resolve_encoding(model: &str) -> Result<CoreBPE, TokenizerError> {
    if let Ok(encoding) = get_bpe_from_model(model) {
        return Ok(encoding);
    }
    match model {
        "o200k_base" => o200k_base(),
        "p50k_base" => p50k_base(),
        "r50k_base" | "gpt2" => r50k_base(),
        _ => {
            tracing::debug!(model, "Unknown tokenizer model; using 'cl100k_base'");
            cl100k_base()
        }
    }
}
