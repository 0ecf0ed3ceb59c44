//! Capability traits for the three external collaborators.
//!
//! The pipeline never talks HTTP directly. Each collaborator is reached
//! through one trait, so the coordinator can run against the real services
//! or against in-memory fakes in tests.
//!
//! ```text
//!              ┌────────────────────┐
//!  source ───▶ │ ConversionBackend  │ ──▶ markdown / json / zip bundle
//!              └────────────────────┘
//!                        │ images
//!                        ▼
//!              ┌────────────────────┐
//!              │  CaptionBackend    │ ──▶ caption text (+ short title)
//!              └────────────────────┘
//!
//!  markdown ─▶ ┌────────────────────┐
//!              │    RemoteStore     │ ──▶ list / upsert / delete by file_source
//!              └────────────────────┘
//! ```
//!
//! | Trait | HTTP implementation |
//! |-------|---------------------|
//! | [`ConversionBackend`] | [`crate::docling::DoclingClient`] |
//! | [`CaptionBackend`] | [`crate::caption::VlmCaptioner`] |
//! | [`RemoteStore`] | [`crate::lightrag::LightRagClient`] |
//!
//! All methods return [`ItemError`]: a collaborator failure is always
//! attributed to one path and never aborts a run.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ItemError;

/// What a conversion produced before any post-processing.
#[derive(Debug, Clone)]
pub enum ConversionPayload {
    /// Markdown (and optionally structured JSON) returned inline.
    Inline {
        markdown: Option<String>,
        json: Option<String>,
    },
    /// A ZIP bundle with markdown, JSON and referenced images.
    Zip(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub payload: ConversionPayload,
    /// Service-reported status, e.g. `success`, `partial_success`, `failure`.
    pub status: Option<String>,
    /// Service-reported error messages, possibly non-fatal.
    pub errors: Vec<String>,
    pub processing_time: Option<f64>,
}

impl ConversionOutput {
    pub fn inline(markdown: impl Into<String>) -> Self {
        Self {
            payload: ConversionPayload::Inline {
                markdown: Some(markdown.into()),
                json: None,
            },
            status: Some("success".to_string()),
            errors: Vec::new(),
            processing_time: None,
        }
    }

    pub fn zip(bytes: Vec<u8>) -> Self {
        Self {
            payload: ConversionPayload::Zip(bytes),
            status: None,
            errors: Vec::new(),
            processing_time: None,
        }
    }
}

/// Turns a binary document into markdown.
///
/// Implementations own their own time budget; the conversion driver adds an
/// outer bound on top.
#[async_trait]
pub trait ConversionBackend: Send + Sync {
    /// Short label for logs and error messages.
    fn name(&self) -> &str;

    async fn convert(&self, path: &Path) -> Result<ConversionOutput, ItemError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caption {
    pub text: String,
    /// Short label used as image alt text, when the backend produced one.
    pub title: Option<String>,
}

/// Describes an image in natural language.
#[async_trait]
pub trait CaptionBackend: Send + Sync {
    /// Model identifier. Part of the caption cache key.
    fn model(&self) -> &str;

    /// Prompt text. Part of the caption cache key.
    fn prompt(&self) -> &str;

    async fn caption(&self, image: &[u8], mime: &str) -> Result<Caption, ItemError>;
}

/// One document as reported by the remote store's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDoc {
    pub id: String,
    pub file_source: String,
    pub status: String,
}

impl RemoteDoc {
    /// Still being ingested; touching it now would race the store.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "pending" | "processing" | "queue" | "queued" | "running"
        )
    }

    /// Ingestion ended in an error state.
    pub fn is_failed(&self) -> bool {
        let status = self.status.to_ascii_lowercase();
        status.contains("fail") || status.contains("error")
    }
}

/// The knowledge-base ingestion service, keyed by `file_source`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Every document whose `file_source` starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteDoc>, ItemError>;

    /// Replace whatever is stored under `file_source` with `text`.
    ///
    /// Must be idempotent: calling it twice leaves exactly one document.
    /// Returns the store's identifier for the new document.
    async fn upsert(&self, file_source: &str, text: &str) -> Result<String, ItemError>;

    /// Remove the document stored under `file_source`. Deleting something
    /// that does not exist succeeds.
    async fn delete(&self, file_source: &str, remote_id: Option<&str>) -> Result<(), ItemError>;

    /// Tasks the ingestion pipeline is still working on. Stores without a
    /// status endpoint report zero.
    async fn inflight(&self) -> Result<u64, ItemError> {
        Ok(0)
    }
}

/// Collaborators wired into one coordinator. `None` means "not configured";
/// stages that need a missing collaborator fail with a config error.
#[derive(Clone, Default)]
pub struct Backends {
    pub converter: Option<Arc<dyn ConversionBackend>>,
    pub captioner: Option<Arc<dyn CaptionBackend>>,
    pub remote: Option<Arc<dyn RemoteStore>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(status: &str) -> RemoteDoc {
        RemoteDoc {
            id: "doc-1".into(),
            file_source: "sync2rag/a.pdf".into(),
            status: status.into(),
        }
    }

    #[test]
    fn classifies_remote_status() {
        assert!(doc("PROCESSING").is_in_flight());
        assert!(doc("pending").is_in_flight());
        assert!(!doc("processed").is_in_flight());
        assert!(doc("failed").is_failed());
        assert!(doc("parse_error").is_failed());
        assert!(!doc("processed").is_failed());
    }
}
