use crate::models::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use unicode_segmentation::UnicodeSegmentation;

/// Where the vector store gets its documents on first population.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn load(&self) -> Result<Vec<SourceDocument>>;
}

/// Fetches a fixed list of web pages (HTML or PDF).
pub struct WebDocumentSource {
    client: Client,
    urls: Vec<String>,
    cleaner: HtmlCleaner,
}

impl WebDocumentSource {
    pub fn new(urls: Vec<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("rag_agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            urls,
            cleaner: HtmlCleaner::new()?,
        })
    }

    async fn fetch(&self, url: &str) -> Result<SourceDocument> {
        log::info!("Fetching source document: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("fetching {} failed with {}: {}", url, status, error_text));
        }

        let is_pdf = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("application/pdf"))
            .unwrap_or(false)
            || url.to_lowercase().ends_with(".pdf");

        if is_pdf {
            let bytes = response.bytes().await?;
            let content = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
                .await?
                .with_context(|| format!("failed to extract text from {}", url))?;
            let title = url
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .map(str::to_string);
            return Ok(SourceDocument {
                text: self.cleaner.collapse_whitespace(&content),
                metadata: DocumentMetadata {
                    title,
                    source: Some(url.to_string()),
                    ..Default::default()
                },
            });
        }

        let html = response.text().await?;
        let (title, text) = self.cleaner.clean(&html);
        Ok(SourceDocument {
            text,
            metadata: DocumentMetadata {
                title,
                source: Some(url.to_string()),
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl DocumentSource for WebDocumentSource {
    async fn load(&self) -> Result<Vec<SourceDocument>> {
        let mut documents = Vec::new();
        for url in &self.urls {
            let doc = self.fetch(url).await?;
            if doc.text.is_empty() {
                log::warn!("Source {} produced no text, skipping", url);
                continue;
            }
            documents.push(doc);
        }

        log::info!("Loaded {} source documents", documents.len());
        Ok(documents)
    }
}

/// Reduces an HTML page to its title and visible body text.
pub struct HtmlCleaner {
    title: Selector,
    body: Selector,
    re_whitespace: Regex,
}

/// Elements whose text never reaches the reader.
const HIDDEN_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

impl HtmlCleaner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            title: parse_selector("title")?,
            body: parse_selector("body")?,
            re_whitespace: Regex::new(r"\s+")?,
        })
    }

    pub fn clean(&self, html: &str) -> (Option<String>, String) {
        let document = Html::parse_document(html);

        let title = document
            .select(&self.title)
            .next()
            .map(|t| self.collapse_whitespace(&t.text().collect::<String>()))
            .filter(|t| !t.is_empty());

        let text = match document.select(&self.body).next() {
            Some(body) => visible_text(body),
            None => String::new(),
        };

        (title, self.collapse_whitespace(&text))
    }

    pub fn collapse_whitespace(&self, text: &str) -> String {
        self.re_whitespace.replace_all(text, " ").trim().to_string()
    }
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow::anyhow!("invalid selector {}: {:?}", selector, e))
}

/// Text nodes under `root`, skipping anything inside a hidden element.
fn visible_text(root: ElementRef) -> String {
    let mut parts = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map(|e| HIDDEN_ELEMENTS.contains(&e.name()))
                .unwrap_or(false)
        });
        if !hidden {
            parts.push(&**text);
        }
    }
    parts.join(" ")
}

/// Splits text into overlapping windows along sentence boundaries.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        anyhow::ensure!(chunk_size > 0, "chunk size must be positive");
        anyhow::ensure!(
            chunk_overlap < chunk_size,
            "chunk overlap ({}) must be smaller than chunk size ({})",
            chunk_overlap,
            chunk_size
        );
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn split_documents(&self, documents: &[SourceDocument]) -> Vec<DocumentChunk> {
        let mut chunks = Vec::new();
        for document in documents {
            for (idx, text) in self.split_text(&document.text).into_iter().enumerate() {
                chunks.push(DocumentChunk {
                    text,
                    metadata: DocumentMetadata {
                        chunk_index: Some(idx),
                        ..document.metadata.clone()
                    },
                });
            }
        }

        log::info!("Created {} chunks from {} documents", chunks.len(), documents.len());
        chunks
    }

    /// Every returned chunk is at most `chunk_size` characters.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_len = 0;

        for piece in self.pieces(text) {
            let piece_len = piece.chars().count();

            if current_len + piece_len > self.chunk_size && current_len > 0 {
                // Sentences carry their trailing whitespace; hard-split fragments do not.
                let at_sentence_boundary = current.ends_with(char::is_whitespace);
                let finished = current.trim();
                if !finished.is_empty() {
                    chunks.push(finished.to_string());
                }

                // Start the next window with the tail of the previous one.
                let mut overlap = tail_chars(finished, self.chunk_overlap);
                if at_sentence_boundary
                    && !overlap.is_empty()
                    && !piece.starts_with(char::is_whitespace)
                {
                    overlap.push(' ');
                }
                let overlap_len = overlap.chars().count();

                if overlap_len + piece_len <= self.chunk_size {
                    current = overlap;
                    current_len = overlap_len;
                } else {
                    current.clear();
                    current_len = 0;
                }
            }

            current.push_str(&piece);
            current_len += piece_len;
        }

        let last = current.trim();
        if !last.is_empty() {
            chunks.push(last.to_string());
        }

        chunks
    }

    /// Sentences, with oversized ones cut so that overlap plus piece still fits.
    fn pieces(&self, text: &str) -> Vec<String> {
        let window = self.chunk_size - self.chunk_overlap;
        let mut pieces = Vec::new();

        for sentence in text.unicode_sentences() {
            if sentence.chars().count() <= self.chunk_size {
                pieces.push(sentence.to_string());
                continue;
            }
            let chars: Vec<char> = sentence.chars().collect();
            for part in chars.chunks(window) {
                pieces.push(part.iter().collect());
            }
        }

        pieces
    }
}

fn tail_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(n)).collect()
}
