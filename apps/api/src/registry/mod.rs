//! File Registry — the only way uploaded artifacts enter the system.
//!
//! `register` validates, stores the bytes, then writes the `FileRecord`;
//! a rejected upload leaves no record behind. Stored objects live under
//! `UPLOAD_PREFIX`, which the bucket expires alongside the records.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::file::FileRecord;
use crate::store::{StateStore, StoreError};

pub mod blob;

pub use blob::BlobStore;

pub const PDF_CONTENT_TYPE: &str = "application/pdf";
pub const UPLOAD_PREFIX: &str = "uploads/";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("File '{field}' exceeds the maximum size of {} MB", .limit / (1024 * 1024))]
    TooLarge { field: String, limit: usize },

    #[error("File '{field}' has type '{content_type}'; only PDF files are allowed")]
    UnsupportedType { field: String, content_type: String },

    #[error("File '{field}' is empty")]
    Empty { field: String },

    #[error("Blob storage failed: {0:#}")]
    Blob(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A fully received multipart file part.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Clone)]
pub struct FileRegistry {
    store: StateStore,
    blobs: Arc<dyn BlobStore>,
    max_bytes: usize,
}

impl FileRegistry {
    pub fn new(store: StateStore, blobs: Arc<dyn BlobStore>, max_bytes: usize) -> Self {
        Self {
            store,
            blobs,
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Checks size and type without touching storage.
    pub fn validate(&self, file: &UploadedFile) -> Result<(), RegistryError> {
        if file.bytes.len() > self.max_bytes {
            return Err(RegistryError::TooLarge {
                field: file.field.clone(),
                limit: self.max_bytes,
            });
        }
        let content_type = file.content_type.as_deref().unwrap_or("");
        if !is_pdf(content_type) {
            return Err(RegistryError::UnsupportedType {
                field: file.field.clone(),
                content_type: if content_type.is_empty() {
                    "unknown".to_string()
                } else {
                    content_type.to_string()
                },
            });
        }
        if file.bytes.is_empty() {
            return Err(RegistryError::Empty {
                field: file.field.clone(),
            });
        }
        Ok(())
    }

    pub async fn register(&self, file: UploadedFile) -> Result<FileRecord, RegistryError> {
        self.validate(&file)?;

        let id = Uuid::new_v4();
        let storage_ref = format!("{UPLOAD_PREFIX}{id}.pdf");
        let size_bytes = file.bytes.len() as u64;

        self.blobs
            .put(&storage_ref, file.bytes, PDF_CONTENT_TYPE)
            .await
            .map_err(RegistryError::Blob)?;

        let record = FileRecord {
            id,
            filename: file.filename,
            storage_ref,
            content_type: PDF_CONTENT_TYPE.to_string(),
            size_bytes,
            uploaded_at: Utc::now(),
        };
        self.store.put_file(&record).await?;

        info!(file_id = %id, field = %file.field, size_bytes, "Registered upload");
        Ok(record)
    }

    /// Removes a registered file and its object. Failures are logged; the
    /// record and object still expire on their own.
    pub async fn discard(&self, record: &FileRecord) {
        if let Err(e) = self.store.delete_file(record.id).await {
            warn!(file_id = %record.id, "Failed to delete file record: {e}");
        }
        if let Err(e) = self.blobs.delete(&record.storage_ref).await {
            warn!(file_id = %record.id, "Failed to delete stored object: {e:#}");
        }
    }

    /// `Ok(None)` means the id is unknown or expired.
    pub async fn resolve(&self, id: Uuid) -> Result<Option<FileRecord>, StoreError> {
        self.store.get_file(id).await
    }
}

fn is_pdf(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|essence| essence.trim().eq_ignore_ascii_case(PDF_CONTENT_TYPE))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::blob::memory::MemoryBlobStore;
    use super::*;
    use crate::store::memory::MemoryKvStore;

    fn registry(max_bytes: usize) -> (FileRegistry, Arc<MemoryKvStore>, Arc<MemoryBlobStore>) {
        let kv = Arc::new(MemoryKvStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let store = StateStore::new(kv.clone(), Duration::from_secs(86_400));
        (FileRegistry::new(store, blobs.clone(), max_bytes), kv, blobs)
    }

    fn pdf(field: &str, body: &'static [u8]) -> UploadedFile {
        UploadedFile {
            field: field.to_string(),
            filename: format!("{field}.pdf"),
            content_type: Some("application/pdf".to_string()),
            bytes: Bytes::from_static(body),
        }
    }

    #[tokio::test]
    async fn test_register_then_resolve() {
        let (registry, _, blobs) = registry(1024);
        let record = registry.register(pdf("cv", b"%PDF-1.4 cv")).await.unwrap();

        let resolved = registry.resolve(record.id).await.unwrap().unwrap();
        assert_eq!(resolved, record);
        assert_eq!(resolved.storage_ref, format!("uploads/{}.pdf", record.id));
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn test_each_registration_gets_a_fresh_id() {
        let (registry, _, _) = registry(1024);
        let a = registry.register(pdf("cv", b"%PDF a")).await.unwrap();
        let b = registry.register(pdf("project", b"%PDF b")).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_oversize_rejected_without_side_effects() {
        let (registry, kv, blobs) = registry(4);
        let err = registry.register(pdf("cv", b"%PDF-1.4 too big")).await.unwrap_err();
        assert!(matches!(err, RegistryError::TooLarge { .. }));
        assert_eq!(kv.count_with_prefix("file:"), 0);
        assert_eq!(blobs.len(), 0);
    }

    #[tokio::test]
    async fn test_wrong_type_rejected_without_side_effects() {
        let (registry, kv, blobs) = registry(1024);
        let mut file = pdf("project", b"hello");
        file.content_type = Some("text/plain".to_string());
        let err = registry.register(file).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedType { .. }));
        assert_eq!(kv.count_with_prefix("file:"), 0);
        assert_eq!(blobs.len(), 0);
    }

    #[tokio::test]
    async fn test_discard_removes_record_and_object() {
        let (registry, kv, blobs) = registry(1024);
        let record = registry.register(pdf("cv", b"%PDF-1.4 cv")).await.unwrap();

        registry.discard(&record).await;
        assert!(registry.resolve(record.id).await.unwrap().is_none());
        assert_eq!(kv.count_with_prefix("file:"), 0);
        assert_eq!(blobs.len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_id_resolves_to_none() {
        let (registry, _, _) = registry(1024);
        assert!(registry.resolve(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[test]
    fn test_pdf_content_type_matching() {
        assert!(is_pdf("application/pdf"));
        assert!(is_pdf("Application/PDF; name=cv.pdf"));
        assert!(!is_pdf("application/octet-stream"));
        assert!(!is_pdf(""));
    }
}
