//! Remote File Search capability.
//!
//! The trait is deliberately synchronous: the upstream SDK surface blocks, and
//! bridging onto the async transport is the caller's job (the ingestion worker
//! runs on blocking threads; the chat path runs the generator on a dedicated
//! producer thread). `MockRag` completes everything instantly and backs
//! `mock_mode` deployments; tests script their own fakes against the trait.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const STORE_HANDLE_PREFIX: &str = "fileSearchStores/";

#[derive(Debug, Error)]
pub enum RagError {
    #[error("remote call failed with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("remote transport error: {0}")]
    Transport(String),
    #[error("remote call timed out: {0}")]
    Timeout(String),
    #[error("malformed remote response: {0}")]
    Malformed(String),
    #[error("stream backpressure: chunk queue full")]
    Backpressure,
}

impl RagError {
    /// Server errors, rate limits, timeouts, and transport failures are worth
    /// retrying; everything else is not.
    pub fn retryable(&self) -> bool {
        match self {
            RagError::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            RagError::Transport(_) | RagError::Timeout(_) => true,
            RagError::Malformed(_) | RagError::Backpressure => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub op_handle: String,
    /// May be absent on the first response; callers recover it from a
    /// subsequent status poll when possible.
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OpStatus {
    pub done: bool,
    pub error: Option<String>,
    /// Best-effort file identifier recovered from operation metadata.
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMeta {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundingChunk {
    pub uri: Option<String>,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub store: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundingInfo {
    pub chunks: Vec<GroundingChunk>,
}

/// One streamed generation event: a text delta, and possibly grounding or
/// usage metadata carried on the final events.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub text_delta: Option<String>,
    pub grounding: Option<GroundingInfo>,
    pub usage: Option<UsageMeta>,
}

#[derive(Debug, Clone)]
pub struct AskRequest {
    pub question: String,
    pub store_handles: Vec<String>,
    pub metadata_filter: Option<serde_json::Value>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub uri: Option<String>,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub store: Option<String>,
}

/// A blocking, possibly slow iterator of generation events.
pub type ChunkStream = Box<dyn Iterator<Item = Result<StreamChunk, RagError>> + Send>;

pub trait RagClient: Send + Sync {
    /// Create a remote store; the returned handle must follow the expected
    /// naming convention (`fileSearchStores/...`).
    fn create_store(&self, display_name: &str) -> Result<String, RagError>;

    fn upload_file(
        &self,
        store_handle: &str,
        local_path: &Path,
        display_name: &str,
    ) -> Result<UploadResult, RagError>;

    /// Idempotent status poll for a long-running operation.
    fn op_status(&self, op_handle: &str) -> Result<OpStatus, RagError>;

    fn ask_stream(&self, request: AskRequest) -> Result<ChunkStream, RagError>;

    /// Best-effort remote delete; a 404-equivalent response is success.
    fn delete_store(&self, store_handle: &str) -> Result<(), RagError>;

    /// Best-effort remote delete of an uploaded file; 404 is success.
    fn delete_document(&self, file_id: &str) -> Result<(), RagError>;
}

/// Best-effort citation extraction: a total function that never fails. Shape
/// mismatches just produce fewer citations.
pub fn extract_citations(grounding: &GroundingInfo) -> Vec<Citation> {
    grounding
        .chunks
        .iter()
        .filter(|chunk| {
            let usable = chunk.uri.is_some() || chunk.title.is_some() || chunk.snippet.is_some();
            if !usable {
                tracing::warn!(event = "citation_chunk_unusable", "grounding chunk had no usable fields");
            }
            usable
        })
        .map(|chunk| Citation {
            uri: chunk.uri.clone(),
            title: chunk.title.clone(),
            snippet: chunk.snippet.clone(),
            store: chunk.store.clone(),
        })
        .collect()
}

pub fn validate_store_handle(handle: &str) -> Result<(), RagError> {
    if handle.starts_with(STORE_HANDLE_PREFIX) && handle.len() > STORE_HANDLE_PREFIX.len() {
        Ok(())
    } else {
        Err(RagError::Malformed(format!(
            "store handle `{handle}` does not match `{STORE_HANDLE_PREFIX}...`"
        )))
    }
}

/// Instant-completion client for development and `mock_mode` deployments.
#[derive(Debug, Default)]
pub struct MockRag {
    uploads: AtomicU64,
}

impl MockRag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }
}

impl RagClient for MockRag {
    fn create_store(&self, _display_name: &str) -> Result<String, RagError> {
        Ok(format!("{STORE_HANDLE_PREFIX}mock-{}", Uuid::new_v4().simple()))
    }

    fn upload_file(
        &self,
        _store_handle: &str,
        _local_path: &Path,
        _display_name: &str,
    ) -> Result<UploadResult, RagError> {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(UploadResult {
            op_handle: format!("operations/mock-{}", Uuid::new_v4().simple()),
            file_id: Some(format!("files/mock-{}", Uuid::new_v4().simple())),
        })
    }

    fn op_status(&self, _op_handle: &str) -> Result<OpStatus, RagError> {
        Ok(OpStatus {
            done: true,
            error: None,
            file_id: None,
        })
    }

    fn ask_stream(&self, request: AskRequest) -> Result<ChunkStream, RagError> {
        let text = StreamChunk {
            text_delta: Some(format!("[mock-mode] {}", request.question)),
            ..StreamChunk::default()
        };
        let closing = StreamChunk {
            grounding: Some(GroundingInfo {
                chunks: vec![GroundingChunk {
                    uri: Some("mock://document".to_string()),
                    title: Some("Mock Document".to_string()),
                    snippet: Some("Mock snippet".to_string()),
                    store: request.store_handles.first().cloned(),
                }],
            }),
            usage: Some(UsageMeta {
                prompt_tokens: Some(0),
                completion_tokens: Some(0),
            }),
            ..StreamChunk::default()
        };
        Ok(Box::new(vec![Ok(text), Ok(closing)].into_iter()))
    }

    fn delete_store(&self, store_handle: &str) -> Result<(), RagError> {
        tracing::info!(event = "mock_delete_store", store = store_handle);
        Ok(())
    }

    fn delete_document(&self, file_id: &str) -> Result<(), RagError> {
        tracing::info!(event = "mock_delete_document", file_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RagError::Status {
            status: 429,
            message: String::new()
        }
        .retryable());
        assert!(RagError::Status {
            status: 503,
            message: String::new()
        }
        .retryable());
        assert!(RagError::Timeout("t".into()).retryable());
        assert!(!RagError::Status {
            status: 400,
            message: String::new()
        }
        .retryable());
        assert!(!RagError::Malformed("m".into()).retryable());
        assert!(!RagError::Backpressure.retryable());
    }

    #[test]
    fn citations_skip_unusable_chunks() {
        let grounding = GroundingInfo {
            chunks: vec![
                GroundingChunk {
                    uri: Some("doc://a".to_string()),
                    title: Some("A".to_string()),
                    snippet: None,
                    store: None,
                },
                GroundingChunk::default(),
            ],
        };
        let citations = extract_citations(&grounding);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].uri.as_deref(), Some("doc://a"));
    }

    #[test]
    fn store_handle_validation() {
        assert!(validate_store_handle("fileSearchStores/abc").is_ok());
        assert!(validate_store_handle("fileSearchStores/").is_err());
        assert!(validate_store_handle("stores/abc").is_err());
    }
}
