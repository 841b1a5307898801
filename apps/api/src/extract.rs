//! Text extraction from stored artifacts.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::models::file::FileRecord;
use crate::registry::BlobStore;

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, file: &FileRecord) -> Result<String>;
}

/// Fetches the PDF from blob storage and extracts its text on a blocking thread.
pub struct PdfTextExtractor {
    blobs: Arc<dyn BlobStore>,
}

impl PdfTextExtractor {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }
}

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    async fn extract(&self, file: &FileRecord) -> Result<String> {
        let bytes = self
            .blobs
            .get(&file.storage_ref)
            .await
            .with_context(|| format!("File '{}' is missing from storage", file.filename))?;

        let filename = file.filename.clone();
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .context("PDF extraction task panicked")?
            .with_context(|| format!("PDF parsing failed for '{filename}'"))?;

        let text = normalize_whitespace(&text);
        if text.is_empty() {
            bail!("'{}' contains no extractable text", file.filename);
        }
        Ok(text)
    }
}

/// Collapses runs of blank lines and trailing spaces left by PDF layout.
fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines().map(str::trim_end) {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}
