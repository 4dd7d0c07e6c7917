//! Plain-text PDF conversion backed by lopdf.

use async_trait::async_trait;

use super::{ConversionError, DocItem, DocumentConverter, StructuredDocument};

/// Extracts one paragraph item per blank-line separated block on each page.
///
/// No layout analysis is attempted, so the output never carries headings.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfTextConverter;

impl PdfTextConverter {
    /// Create a converter.
    pub const fn new() -> Self {
        Self
    }

    fn extract(source_id: &str, bytes: &[u8]) -> Result<StructuredDocument, ConversionError> {
        let doc = lopdf::Document::load_mem(bytes).map_err(|e| ConversionError::Parse {
            source_id: source_id.to_string(),
            message: e.to_string(),
        })?;

        let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
        tracing::debug!(doi = source_id, page_count = pages.len(), "Extracting PDF text");

        let mut items = Vec::new();
        for page in pages {
            match doc.extract_text(&[page]) {
                Ok(text) => items.extend(
                    paragraphs(&text)
                        .into_iter()
                        .map(|block| DocItem::paragraph(block, vec![page])),
                ),
                Err(e) => {
                    tracing::warn!(doi = source_id, page, error = %e, "Failed to extract page text, skipping");
                }
            }
        }

        if items.is_empty() {
            return Err(ConversionError::Empty(source_id.to_string()));
        }
        Ok(StructuredDocument {
            source_id: source_id.to_string(),
            items,
        })
    }
}

#[async_trait]
impl DocumentConverter for PdfTextConverter {
    async fn convert(
        &self,
        source_id: &str,
        bytes: &[u8],
    ) -> Result<StructuredDocument, ConversionError> {
        let owned_id = source_id.to_string();
        let owned_bytes = bytes.to_vec();
        // lopdf parsing is CPU bound.
        tokio::task::spawn_blocking(move || Self::extract(&owned_id, &owned_bytes))
            .await
            .map_err(|e| ConversionError::Parse {
                source_id: source_id.to_string(),
                message: e.to_string(),
            })?
    }
}

/// Split page text into blocks separated by blank lines, collapsing inner whitespace.
fn paragraphs(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !current.is_empty() {
                blocks.push(collapse(&current));
                current.clear();
            }
        } else {
            current.push(trimmed);
        }
    }
    if !current.is_empty() {
        blocks.push(collapse(&current));
    }
    blocks
}

fn collapse(lines: &[&str]) -> String {
    lines
        .iter()
        .flat_map(|line| line.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_split_on_blank_lines() {
        let text = "First line\n  continues here\n\n\nSecond   block\n";
        assert_eq!(
            paragraphs(text),
            vec!["First line continues here", "Second block"]
        );
        assert!(paragraphs("   \n\n").is_empty());
    }

    #[tokio::test]
    async fn garbage_bytes_fail_to_parse() {
        let error = PdfTextConverter::new()
            .convert("10.1/x", b"definitely not a pdf")
            .await
            .unwrap_err();
        assert!(matches!(error, ConversionError::Parse { .. }));
    }
}
