//! Knowledge Base Retriever — reference passages for the scoring prompts.
//!
//! `Retriever` is the capability the pipeline depends on. The default
//! backend is `KnowledgeBase`: reference documents (job description, case
//! study brief, scoring rubric) loaded from a directory at startup, split
//! into passages and ranked by weighted term overlap with the query.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Soft cap on passage length; paragraphs are merged up to this size.
const PASSAGE_TARGET_CHARS: usize = 900;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "are", "was", "were", "will", "you",
    "your", "our", "has", "have", "had", "not", "but", "can", "all", "any", "its", "into", "about",
    "their", "they", "them", "who", "what", "which", "when", "how", "use", "using", "data",
    "fetch", "related",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub source: String,
    pub text: String,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `top_k` passages, most relevant first.
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<Passage>>;
}

/// Joins passages into the single context block handed to the scorer.
pub fn context_block(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|p| format!("[{}]\n{}", p.source, p.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Startup failure: the worker cannot score anything without references.
#[derive(Debug, Error)]
pub enum KnowledgeBaseError {
    #[error("Knowledge base directory '{0}' is unreadable: {1}")]
    Unreadable(PathBuf, #[source] std::io::Error),

    #[error("Knowledge base directory '{0}' contains no usable reference documents")]
    Empty(PathBuf),
}

struct IndexedPassage {
    passage: Passage,
    term_counts: HashMap<String, u32>,
}

/// In-process index over the reference documents.
pub struct KnowledgeBase {
    passages: Vec<IndexedPassage>,
    /// Number of passages containing each term.
    document_frequency: HashMap<String, u32>,
}

impl KnowledgeBase {
    /// Loads every `.pdf`, `.txt` and `.md` file in `dir`. Files that fail to
    /// parse are skipped with a warning; an empty result is fatal.
    pub fn load(dir: &Path) -> Result<Self, KnowledgeBaseError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| KnowledgeBaseError::Unreadable(dir.to_path_buf(), e))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let mut documents = Vec::new();
        for path in paths {
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let source = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("reference")
                .to_string();
            let text = match ext.to_ascii_lowercase().as_str() {
                "pdf" => pdf_extract::extract_text(&path).map_err(|e| e.to_string()),
                "txt" | "md" => std::fs::read_to_string(&path).map_err(|e| e.to_string()),
                _ => continue,
            };
            match text {
                Ok(text) if !text.trim().is_empty() => documents.push((source, text)),
                Ok(_) => warn!("Reference document {} has no text, skipping", path.display()),
                Err(e) => warn!("Failed to read reference document {}: {e}", path.display()),
            }
        }

        let kb = Self::from_documents(documents);
        if kb.passages.is_empty() {
            return Err(KnowledgeBaseError::Empty(dir.to_path_buf()));
        }
        Ok(kb)
    }

    pub fn from_documents(documents: Vec<(String, String)>) -> Self {
        let mut passages = Vec::new();
        let mut document_frequency: HashMap<String, u32> = HashMap::new();

        for (source, text) in documents {
            for chunk in split_passages(&text) {
                let mut term_counts: HashMap<String, u32> = HashMap::new();
                for term in tokenize(&chunk) {
                    *term_counts.entry(term).or_default() += 1;
                }
                for term in term_counts.keys() {
                    *document_frequency.entry(term.clone()).or_default() += 1;
                }
                passages.push(IndexedPassage {
                    passage: Passage {
                        source: source.clone(),
                        text: chunk,
                    },
                    term_counts,
                });
            }
        }

        Self {
            passages,
            document_frequency,
        }
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    /// Ranks passages by Σ tf·idf over distinct query terms. Ties keep document order.
    fn rank(&self, query: &str, top_k: usize) -> Vec<Passage> {
        let terms: HashSet<String> = tokenize(query).collect();
        let total = self.passages.len() as f64;

        let mut scored: Vec<(usize, f64)> = self
            .passages
            .iter()
            .enumerate()
            .map(|(idx, indexed)| {
                let score = terms
                    .iter()
                    .filter_map(|term| {
                        let tf = *indexed.term_counts.get(term)? as f64;
                        let df = *self.document_frequency.get(term)? as f64;
                        Some((1.0 + tf.ln()) * (1.0 + total / df).ln())
                    })
                    .sum::<f64>();
                (idx, score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(top_k)
            .map(|(idx, _)| self.passages[idx].passage.clone())
            .collect()
    }
}

#[async_trait]
impl Retriever for KnowledgeBase {
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<Passage>> {
        Ok(self.rank(text, top_k))
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
}

/// Splits on blank lines, merging short paragraphs up to the target size.
fn split_passages(text: &str) -> Vec<String> {
    let mut passages = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if !current.is_empty() && current.len() + paragraph.len() > PASSAGE_TARGET_CHARS {
            passages.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        passages.push(current);
    }
    passages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kb() -> KnowledgeBase {
        KnowledgeBase::from_documents(vec![
            (
                "job_description".to_string(),
                "Backend Engineer\n\nWe need strong experience with Go, REST APIs and PostgreSQL."
                    .to_string(),
            ),
            (
                "case_study".to_string(),
                "Case study brief: build an evaluation service with a job queue and tests."
                    .to_string(),
            ),
            (
                "scoring_rubric".to_string(),
                "Project rubric: correctness, code quality, resilience, documentation.".to_string(),
            ),
        ])
    }

    #[tokio::test]
    async fn test_query_ranks_relevant_passage_first() {
        let passages = kb().query("project rubric resilience", 3).await.unwrap();
        assert_eq!(passages.len(), 3);
        assert_eq!(passages[0].source, "scoring_rubric");
    }

    #[tokio::test]
    async fn test_query_respects_top_k() {
        let passages = kb().query("backend engineer Go experience", 1).await.unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].source, "job_description");
    }

    #[test]
    fn test_context_block_labels_sources() {
        let block = context_block(&[
            Passage {
                source: "a".to_string(),
                text: "first".to_string(),
            },
            Passage {
                source: "b".to_string(),
                text: "second".to_string(),
            },
        ]);
        assert_eq!(block, "[a]\nfirst\n\n[b]\nsecond");
    }

    #[test]
    fn test_split_passages_merges_short_paragraphs() {
        let text = "one\n\ntwo\n\n".to_string() + &"x".repeat(PASSAGE_TARGET_CHARS);
        let passages = split_passages(&text);
        assert_eq!(passages.len(), 2);
        assert_eq!(passages[0], "one\n\ntwo");
    }

    #[test]
    fn test_load_reads_text_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scoring_rubric.md"), "Rubric: tests matter.").unwrap();
        std::fs::write(dir.path().join("notes.bin"), "ignored").unwrap();

        let kb = KnowledgeBase::load(dir.path()).unwrap();
        assert_eq!(kb.len(), 1);
    }

    #[test]
    fn test_load_empty_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            KnowledgeBase::load(dir.path()),
            Err(KnowledgeBaseError::Empty(_))
        ));
    }

    #[test]
    fn test_load_missing_directory_is_fatal() {
        assert!(matches!(
            KnowledgeBase::load(Path::new("/definitely/not/here")),
            Err(KnowledgeBaseError::Unreadable(..))
        ));
    }
}
