//! Structured document model produced by PDF conversion.
//!
//! Conversion itself is an external concern: anything implementing [`DocumentConverter`]
//! can feed the chunker. The model is serde-friendly so a converter's JSON export can be
//! deserialized directly into a [`StructuredDocument`].

mod pdf;

pub use pdf::PdfTextConverter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ordered sequence of content items extracted from one source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredDocument {
    /// Identifier of the document the items came from (article identifier).
    pub source_id: String,
    /// Content items in reading order.
    pub items: Vec<DocItem>,
}

/// One content item with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocItem {
    /// Structural role of the item.
    #[serde(flatten)]
    pub label: ItemLabel,
    /// Item text.
    pub text: String,
    /// Pages the item was found on (1-based).
    #[serde(default)]
    pub pages: Vec<u32>,
}

/// Structural role of a [`DocItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "label", rename_all = "snake_case")]
pub enum ItemLabel {
    /// Document title; outranks every section header.
    Title,
    /// Section heading at the given depth (1 = top level).
    SectionHeader {
        /// Nesting depth, starting at 1.
        level: u8,
    },
    /// Body paragraph.
    Paragraph,
    /// Bullet or numbered list entry.
    ListItem,
    /// Serialized table.
    Table,
    /// Figure or table caption.
    Caption,
    /// Display formula.
    Formula,
    /// Footnote text.
    Footnote,
}

impl ItemLabel {
    /// Heading depth when the item opens a section, `None` for body content.
    pub fn heading_level(self) -> Option<u8> {
        match self {
            Self::Title => Some(0),
            Self::SectionHeader { level } => Some(level.max(1)),
            _ => None,
        }
    }
}

impl DocItem {
    /// Body item convenience constructor.
    pub fn paragraph(text: impl Into<String>, pages: Vec<u32>) -> Self {
        Self {
            label: ItemLabel::Paragraph,
            text: text.into(),
            pages,
        }
    }

    /// Section heading convenience constructor.
    pub fn heading(level: u8, text: impl Into<String>, pages: Vec<u32>) -> Self {
        Self {
            label: ItemLabel::SectionHeader { level },
            text: text.into(),
            pages,
        }
    }
}

/// Errors raised while turning raw bytes into a [`StructuredDocument`].
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The bytes could not be parsed as a document.
    #[error("failed to parse document '{source_id}': {message}")]
    Parse {
        /// Identifier of the offending document.
        source_id: String,
        /// Parser diagnostic.
        message: String,
    },
    /// Parsing succeeded but produced no text.
    #[error("document '{0}' contains no extractable text")]
    Empty(String),
}

/// Opaque PDF-to-structure converter.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Convert raw article bytes into structured content.
    async fn convert(
        &self,
        source_id: &str,
        bytes: &[u8],
    ) -> Result<StructuredDocument, ConversionError>;
}
