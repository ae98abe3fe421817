//! Shared test fixtures: a scriptable fake of the remote File Search client
//! and helpers standing up a full app context on a temp directory.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use quaestor_app::config::Settings;
use quaestor_app::services::{
    build_app_context_with, AppContext, AskRequest, ChunkStream, GroundingChunk, GroundingInfo,
    OpStatus, RagClient, RagError, StreamChunk, UploadResult, UsageMeta,
};

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum UploadMode {
    Ok { file_id: Option<String> },
    EmptyHandle,
    Fail { status: u16 },
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum PollMode {
    Done,
    NeverDone,
    RemoteError(String),
}

/// One scripted event of a streamed generation attempt.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum ScriptEvent {
    Delta(String),
    Grounded,
    Usage(u64, u64),
    Retryable,
    Fatal,
}

pub struct FakeRag {
    pub upload_mode: Mutex<UploadMode>,
    pub poll_mode: Mutex<PollMode>,
    pub uploads: AtomicUsize,
    pub polls: AtomicUsize,
    pub asks: AtomicUsize,
    pub deleted_files: Mutex<Vec<String>>,
    /// Scripted stream attempts, consumed front-first; when empty, a single
    /// plain-text answer is produced.
    pub stream_attempts: Mutex<VecDeque<Vec<ScriptEvent>>>,
}

impl FakeRag {
    pub fn new() -> Self {
        Self {
            upload_mode: Mutex::new(UploadMode::Ok {
                file_id: Some("files/xyz".to_string()),
            }),
            poll_mode: Mutex::new(PollMode::Done),
            uploads: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            asks: AtomicUsize::new(0),
            deleted_files: Mutex::new(Vec::new()),
            stream_attempts: Mutex::new(VecDeque::new()),
        }
    }

    #[allow(dead_code)]
    pub fn set_upload_mode(&self, mode: UploadMode) {
        *self.upload_mode.lock().unwrap() = mode;
    }

    #[allow(dead_code)]
    pub fn set_poll_mode(&self, mode: PollMode) {
        *self.poll_mode.lock().unwrap() = mode;
    }

    #[allow(dead_code)]
    pub fn push_stream_attempt(&self, events: Vec<ScriptEvent>) {
        self.stream_attempts.lock().unwrap().push_back(events);
    }

    #[allow(dead_code)]
    pub fn deleted(&self) -> Vec<String> {
        self.deleted_files.lock().unwrap().clone()
    }

    fn events_to_chunks(events: Vec<ScriptEvent>) -> Vec<Result<StreamChunk, RagError>> {
        events
            .into_iter()
            .map(|event| match event {
                ScriptEvent::Delta(text) => Ok(StreamChunk {
                    text_delta: Some(text),
                    ..StreamChunk::default()
                }),
                ScriptEvent::Grounded => Ok(StreamChunk {
                    grounding: Some(GroundingInfo {
                        chunks: vec![GroundingChunk {
                            uri: Some("doc://fake".to_string()),
                            title: Some("Fake Document".to_string()),
                            snippet: Some("a snippet".to_string()),
                            store: None,
                        }],
                    }),
                    ..StreamChunk::default()
                }),
                ScriptEvent::Usage(prompt, completion) => Ok(StreamChunk {
                    usage: Some(UsageMeta {
                        prompt_tokens: Some(prompt),
                        completion_tokens: Some(completion),
                    }),
                    ..StreamChunk::default()
                }),
                ScriptEvent::Retryable => Err(RagError::Status {
                    status: 503,
                    message: "upstream unavailable".to_string(),
                }),
                ScriptEvent::Fatal => Err(RagError::Malformed("bad payload".to_string())),
            })
            .collect()
    }
}

impl RagClient for FakeRag {
    fn create_store(&self, _display_name: &str) -> Result<String, RagError> {
        Ok("fileSearchStores/fake".to_string())
    }

    fn upload_file(
        &self,
        _store_handle: &str,
        _local_path: &Path,
        _display_name: &str,
    ) -> Result<UploadResult, RagError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        match self.upload_mode.lock().unwrap().clone() {
            UploadMode::Ok { file_id } => Ok(UploadResult {
                op_handle: "operations/abc".to_string(),
                file_id,
            }),
            UploadMode::EmptyHandle => Ok(UploadResult {
                op_handle: String::new(),
                file_id: Some("files/orphan".to_string()),
            }),
            UploadMode::Fail { status } => Err(RagError::Status {
                status,
                message: "upload refused".to_string(),
            }),
        }
    }

    fn op_status(&self, _op_handle: &str) -> Result<OpStatus, RagError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        match self.poll_mode.lock().unwrap().clone() {
            PollMode::Done => Ok(OpStatus {
                done: true,
                error: None,
                file_id: None,
            }),
            PollMode::NeverDone => Ok(OpStatus::default()),
            PollMode::RemoteError(message) => Ok(OpStatus {
                done: true,
                error: Some(message),
                file_id: None,
            }),
        }
    }

    fn ask_stream(&self, _request: AskRequest) -> Result<ChunkStream, RagError> {
        self.asks.fetch_add(1, Ordering::SeqCst);
        let events = self
            .stream_attempts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![ScriptEvent::Delta("fake answer".to_string())]);
        Ok(Box::new(Self::events_to_chunks(events).into_iter()))
    }

    fn delete_store(&self, store_handle: &str) -> Result<(), RagError> {
        self.deleted_files
            .lock()
            .unwrap()
            .push(store_handle.to_string());
        Ok(())
    }

    fn delete_document(&self, file_id: &str) -> Result<(), RagError> {
        self.deleted_files.lock().unwrap().push(file_id.to_string());
        Ok(())
    }
}

pub struct TestApp {
    pub ctx: Arc<AppContext>,
    pub rag: Arc<FakeRag>,
    #[allow(dead_code)]
    pub temp: TempDir,
}

pub fn build_test_app(configure: impl FnOnce(&mut Settings)) -> TestApp {
    let temp = TempDir::new().expect("temp dir");
    let mut settings = Settings::default();
    settings.storage.path = temp.path().to_path_buf();
    configure(&mut settings);
    let rag = Arc::new(FakeRag::new());
    let ctx = build_app_context_with(settings, rag.clone()).expect("context");
    TestApp { ctx, rag, temp }
}

#[allow(dead_code)]
pub fn stage_upload(app: &TestApp, name: &str, bytes: &[u8]) -> PathBuf {
    let dir = app.ctx.paths.uploads_dir().expect("uploads dir");
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("write staged file");
    path
}
