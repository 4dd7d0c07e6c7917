//! Structure-aware chunking of converted documents.
//!
//! The chunker walks a [`StructuredDocument`] in reading order and turns every item into a
//! *unit* tagged with its heading path (the stack of headings in force). Units above the token
//! budget are force-split with `semchunk-rs`; all others are emitted whole, so boundaries
//! follow the document structure. With `merge_peers` on, adjacent units that belong to the same
//! section, or to sibling sections under the same parent, are concatenated while the combined
//! text still fits the budget.
//!
//! Every decision depends only on the document and the configuration, so re-chunking the same
//! input yields the same sequence.

mod tokens;

pub use tokens::{
    TokenCounter, build_token_counter, determine_max_tokens, embedding_context_window,
    whitespace_token_counter,
};

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Error as TokenizerError;
use semchunk_rs::Chunker;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::StructuredDocument;

/// Separator placed between merged units.
const UNIT_SEPARATOR: &str = "\n";

/// Errors produced while chunking a document.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// The configured token budget is zero.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// Tokenizer resources were unavailable for the configured model.
    #[error("failed to initialize tokenizer for model '{model}': {source}")]
    Tokenizer {
        /// Embedding model we attempted to load.
        model: String,
        /// Underlying error raised by the tokenizer library.
        #[source]
        source: TokenizerError,
    },
    /// A piece still exceeded the budget after forced splitting.
    #[error("chunk of {tokens} tokens from '{source_id}' exceeds the {max_tokens} token budget")]
    BudgetViolation {
        /// Document being chunked.
        source_id: String,
        /// Token count of the offending piece.
        tokens: usize,
        /// Configured budget.
        max_tokens: usize,
    },
}

/// Chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Hard upper bound on tokens per chunk.
    pub max_tokens: usize,
    /// Concatenate adjacent peer units while they fit the budget.
    pub merge_peers: bool,
}

/// Provenance of a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOrigin {
    /// Identifier of the source article.
    pub source_id: String,
    /// Sorted, de-duplicated pages covered by the chunk; `None` when unknown.
    pub page_numbers: Option<Vec<u32>>,
    /// Innermost heading in force at the end of the chunk. For peers merged across sibling
    /// sections this is the last section's heading.
    pub heading: Option<String>,
}

/// Bounded span of document text ready for embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Chunk text.
    pub text: String,
    /// Where the text came from.
    pub origin: ChunkOrigin,
}

/// Splits structured documents into token-bounded chunks.
#[derive(Clone)]
pub struct DocumentChunker {
    config: ChunkerConfig,
    counter: TokenCounter,
}

impl std::fmt::Debug for DocumentChunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentChunker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct Unit {
    text: String,
    pages: BTreeSet<u32>,
    path: Vec<String>,
}

struct Pending {
    text: String,
    pages: BTreeSet<u32>,
    heading: Option<String>,
    path: Vec<String>,
}

impl Pending {
    fn start(unit: Unit) -> Self {
        Self {
            heading: unit.path.last().cloned(),
            text: unit.text,
            pages: unit.pages,
            path: unit.path,
        }
    }

    /// Same section, or sibling sections sharing a parent.
    fn is_peer(&self, unit: &Unit) -> bool {
        if self.path == unit.path {
            return true;
        }
        match (self.path.split_last(), unit.path.split_last()) {
            (Some((_, parent)), Some((_, other_parent))) => parent == other_parent,
            _ => false,
        }
    }

    fn absorb(&mut self, merged_text: String, unit: Unit) {
        self.text = merged_text;
        self.pages.extend(unit.pages);
        self.heading = unit.path.last().cloned();
        self.path = unit.path;
    }

    fn finish(self, source_id: &str) -> Chunk {
        let page_numbers = if self.pages.is_empty() {
            None
        } else {
            Some(self.pages.into_iter().collect())
        };
        Chunk {
            text: self.text,
            origin: ChunkOrigin {
                source_id: source_id.to_string(),
                page_numbers,
                heading: self.heading,
            },
        }
    }
}

impl DocumentChunker {
    /// Create a chunker; a zero budget is rejected.
    pub fn new(config: ChunkerConfig, counter: TokenCounter) -> Result<Self, ChunkingError> {
        if config.max_tokens == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        Ok(Self { config, counter })
    }

    /// Active configuration.
    pub fn config(&self) -> ChunkerConfig {
        self.config
    }

    /// Token count of `text` under this chunker's tokenizer.
    pub fn count_tokens(&self, text: &str) -> usize {
        (self.counter)(text)
    }

    /// Chunk a document.
    pub fn chunk(&self, document: &StructuredDocument) -> Result<Vec<Chunk>, ChunkingError> {
        let max_tokens = self.config.max_tokens;
        let mut units = Vec::new();
        for unit in structural_units(document) {
            units.extend(self.split_oversized(&document.source_id, unit)?);
        }

        let mut chunks = Vec::new();
        let mut pending: Option<Pending> = None;
        for unit in units {
            if self.config.merge_peers
                && let Some(current) = pending.as_mut()
                && current.is_peer(&unit)
            {
                let merged = format!("{}{UNIT_SEPARATOR}{}", current.text, unit.text);
                if self.count_tokens(&merged) <= max_tokens {
                    current.absorb(merged, unit);
                    continue;
                }
            }
            if let Some(done) = pending.replace(Pending::start(unit)) {
                chunks.push(done.finish(&document.source_id));
            }
        }
        if let Some(done) = pending {
            chunks.push(done.finish(&document.source_id));
        }

        for chunk in &chunks {
            let tokens = self.count_tokens(&chunk.text);
            if tokens > max_tokens {
                tracing::error!(doi = %document.source_id, tokens, max_tokens, "Chunk exceeds token budget");
                return Err(ChunkingError::BudgetViolation {
                    source_id: document.source_id.clone(),
                    tokens,
                    max_tokens,
                });
            }
        }

        tracing::debug!(
            doi = %document.source_id,
            items = document.items.len(),
            chunks = chunks.len(),
            max_tokens,
            merge_peers = self.config.merge_peers,
            "Chunked document"
        );
        Ok(chunks)
    }

    fn split_oversized(&self, source_id: &str, unit: Unit) -> Result<Vec<Unit>, ChunkingError> {
        let max_tokens = self.config.max_tokens;
        if self.count_tokens(&unit.text) <= max_tokens {
            return Ok(vec![unit]);
        }

        let counter = Arc::clone(&self.counter);
        let splitter = Chunker::new(max_tokens, Box::new(move |segment: &str| counter(segment)));
        let mut pieces = Vec::new();
        for piece in splitter.chunk(&unit.text) {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let tokens = self.count_tokens(piece);
            if tokens > max_tokens {
                return Err(ChunkingError::BudgetViolation {
                    source_id: source_id.to_string(),
                    tokens,
                    max_tokens,
                });
            }
            pieces.push(Unit {
                text: piece.to_string(),
                pages: unit.pages.clone(),
                path: unit.path.clone(),
            });
        }
        tracing::trace!(doi = source_id, pieces = pieces.len(), "Force-split oversized item");
        Ok(pieces)
    }
}

/// Flatten items into units, tracking the heading stack as sections open and close.
///
/// A heading line is prefixed to the first body item of its section; a heading directly
/// followed by another heading becomes a unit on its own.
fn structural_units(document: &StructuredDocument) -> Vec<Unit> {
    let mut headings: Vec<(u8, String)> = Vec::new();
    let mut open_heading: Option<Unit> = None;
    let mut units = Vec::with_capacity(document.items.len());
    for item in &document.items {
        let text = item.text.trim();
        if text.is_empty() {
            continue;
        }
        let pages: BTreeSet<u32> = item.pages.iter().copied().collect();
        if let Some(level) = item.label.heading_level() {
            units.extend(open_heading.take());
            while headings.last().is_some_and(|(open, _)| *open >= level) {
                headings.pop();
            }
            headings.push((level, text.to_string()));
            open_heading = Some(Unit {
                text: text.to_string(),
                pages,
                path: headings.iter().map(|(_, heading)| heading.clone()).collect(),
            });
            continue;
        }
        let unit = match open_heading.take() {
            Some(mut heading) => {
                heading.text = format!("{}{UNIT_SEPARATOR}{text}", heading.text);
                heading.pages.extend(pages);
                heading
            }
            None => Unit {
                text: text.to_string(),
                pages,
                path: headings.iter().map(|(_, heading)| heading.clone()).collect(),
            },
        };
        units.push(unit);
    }
    units.extend(open_heading);
    units
}
