use crate::config::SNIPPET_MAX_CHARS;
use crate::models::{Citation, RetrieveResult, RetrievedDocument};
use std::fmt;

pub const UNTITLED: &str = "untitled document";
pub const UNKNOWN_SOURCE: &str = "unknown source";
pub const NO_RESULTS: &str = "Retrieval result: no relevant documents found.";

/// Turn ranked hits into at most `limit` citations, keeping the ranking.
///
/// Ids come from metadata when present, otherwise from the 1-based position
/// in this batch, so they are only meaningful within one call.
pub fn format_citations(docs: &[RetrievedDocument], limit: usize) -> Vec<Citation> {
    docs.iter()
        .take(limit)
        .enumerate()
        .map(|(idx, doc)| {
            let fallback_id = u32::try_from(idx + 1).unwrap_or(u32::MAX);
            Citation {
                id: doc.metadata.id.unwrap_or(fallback_id),
                title: doc
                    .metadata
                    .title
                    .clone()
                    .unwrap_or_else(|| UNTITLED.to_string()),
                source: doc
                    .metadata
                    .source
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
                snippet: Some(snippet(&doc.text)),
            }
        })
        .collect()
}

fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_MAX_CHARS).collect()
}

// This rendering is the tool output the model reads.
impl fmt::Display for RetrieveResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(error) = &self.error {
            writeln!(f, "Retrieval failed: {}", error)?;
        }

        if self.citations.is_empty() {
            return f.write_str(NO_RESULTS);
        }

        write!(f, "Retrieved {} relevant documents:\n\n", self.citations.len())?;
        for citation in &self.citations {
            writeln!(f, "[{}]", citation.id)?;
            writeln!(f, "Title: {}", citation.title)?;
            writeln!(f, "Source: {}", citation.source)?;
            if let Some(snippet) = citation.snippet.as_deref().filter(|s| !s.is_empty()) {
                writeln!(f, "Snippet: {}", snippet)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
