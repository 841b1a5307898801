//! In-process collaborators for unit and router tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::admission::window::memory::MemoryWindowCounter;
use crate::admission::AdmissionController;
use crate::config::Config;
use crate::extract::TextExtractor;
use crate::llm_client::ScoringService;
use crate::models::file::FileRecord;
use crate::models::job::EvaluationResult;
use crate::queue::memory::MemoryTaskQueue;
use crate::registry::blob::memory::MemoryBlobStore;
use crate::registry::FileRegistry;
use crate::retrieval::{Passage, Retriever};
use crate::state::AppState;
use crate::store::memory::MemoryKvStore;
use crate::store::StateStore;

pub const CV_REPLY: &str = r#"{"cv_match_rate": 0.72, "cv_feedback": "Three years of backend Go work match the role."}"#;
pub const PROJECT_REPLY: &str = r#"{"project_score": 4.0, "project_feedback": "REST API is implemented with tests."}"#;
pub const SUMMARY_REPLY: &str = r#"{"overall_summary": "Solid backend candidate with a tested REST project. Meets both passing grades.", "is_accepted": true}"#;

pub fn sample_result() -> EvaluationResult {
    EvaluationResult {
        cv_match_rate: 0.72,
        cv_feedback: "Three years of backend Go work match the role.".to_string(),
        project_score: 4.0,
        project_feedback: "REST API is implemented with tests.".to_string(),
        overall_summary: "Solid backend candidate.".to_string(),
        is_accepted: true,
    }
}

#[derive(Debug, Clone)]
pub struct ScorerCall {
    pub system: String,
    pub user: String,
    pub temperature: f32,
}

/// Answers each stage with a canned reply, optionally failing the first
/// `n` calls or sleeping before answering.
pub struct FakeScorer {
    failures_left: AtomicU32,
    cv_reply: String,
    project_reply: String,
    summary_reply: String,
    delay: Option<Duration>,
    calls: Mutex<Vec<ScorerCall>>,
}

impl FakeScorer {
    pub fn passing() -> Self {
        Self {
            failures_left: AtomicU32::new(0),
            cv_reply: CV_REPLY.to_string(),
            project_reply: PROJECT_REPLY.to_string(),
            summary_reply: SUMMARY_REPLY.to_string(),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_first(n: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(n),
            ..Self::passing()
        }
    }

    pub fn with_cv_reply(mut self, reply: &str) -> Self {
        self.cv_reply = reply.to_string();
        self
    }

    pub fn with_project_reply(mut self, reply: &str) -> Self {
        self.project_reply = reply.to_string();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ScorerCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScoringService for FakeScorer {
    async fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String> {
        self.calls.lock().unwrap().push(ScorerCall {
            system: system.to_string(),
            user: user.to_string(),
            temperature,
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("scoring service unavailable");
        }

        if system.contains("\"overall_summary\"") {
            Ok(self.summary_reply.clone())
        } else if system.contains("\"project_score\"") {
            Ok(self.project_reply.clone())
        } else if system.contains("\"cv_match_rate\"") {
            Ok(self.cv_reply.clone())
        } else {
            Err(anyhow!("unrecognised stage prompt"))
        }
    }
}

#[derive(Default)]
pub struct StaticRetriever {
    unavailable: bool,
    queries: Mutex<Vec<String>>,
}

impl StaticRetriever {
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<Passage>> {
        self.queries.lock().unwrap().push(text.to_string());
        if self.unavailable {
            bail!("knowledge base unavailable");
        }
        Ok(vec![Passage {
            source: "scoring_rubric".to_string(),
            text: "Backend roles need APIs, tests and resilience.".to_string(),
        }]
        .into_iter()
        .take(top_k)
        .collect())
    }
}

/// Returns fixed text per filename. Unknown files get a generic body unless
/// the extractor was built with `empty()`.
#[derive(Default)]
pub struct StaticExtractor {
    texts: HashMap<String, String>,
    strict: bool,
}

impl StaticExtractor {
    pub fn empty() -> Self {
        Self {
            texts: HashMap::new(),
            strict: true,
        }
    }

    pub fn with_text(mut self, filename: &str, text: &str) -> Self {
        self.texts.insert(filename.to_string(), text.to_string());
        self
    }
}

#[async_trait]
impl TextExtractor for StaticExtractor {
    async fn extract(&self, file: &FileRecord) -> Result<String> {
        match self.texts.get(&file.filename) {
            Some(text) => Ok(text.clone()),
            None if self.strict => bail!("File '{}' is missing from storage", file.filename),
            None => Ok(format!("Extracted text of {}", file.filename)),
        }
    }
}

/// Handles to the in-memory backends behind a test `AppState`.
pub struct TestBackends {
    pub kv: Arc<MemoryKvStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub queue: Arc<MemoryTaskQueue>,
}

pub fn app_state(config: Config) -> (AppState, TestBackends) {
    let kv = Arc::new(MemoryKvStore::default());
    let blobs = Arc::new(MemoryBlobStore::default());
    let queue = Arc::new(MemoryTaskQueue::default());

    let store = StateStore::new(kv.clone(), config.record_ttl);
    let registry = FileRegistry::new(store.clone(), blobs.clone(), config.max_upload_bytes);
    let admission = AdmissionController::new(
        Arc::new(MemoryWindowCounter::default()),
        config.trust_forwarded_for,
    );

    let state = AppState {
        store,
        registry,
        queue: queue.clone(),
        admission,
        config: Arc::new(config),
    };
    (state, TestBackends { kv, blobs, queue })
}
