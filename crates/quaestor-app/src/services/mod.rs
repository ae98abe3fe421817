//! Orchestration layer for IO-bound services.
//!
//! Modules here coordinate external systems (the metadata store, the remote
//! File Search backend, rate limiting) and the durable ingestion pipeline.
//! Pure transforms (cost math, token estimation) live in `costs` so resource
//! accounting stays localized.

pub mod catalog;
pub mod chat;
pub mod context;
pub mod costs;
pub mod db;
pub mod gemini;
pub mod history;
pub mod ingestion;
pub mod ledger;
pub mod queue;
pub mod rag;
pub mod watchdog;

pub use catalog::{CatalogStore, Document, DocumentStatus, Store, User};
pub use chat::{prepare_chat, run_chat_stream, ChatPlan, ChatRefusal, ChatRequest};
pub use context::{build_app_context, build_app_context_with, AppContext, ContextError};
pub use costs::{
    calc_index_cost, calc_query_cost, estimate_tokens_from_bytes, estimate_tokens_from_text,
    pricing_configured, resolve_model_rates, CostMicros, GlobalPrices, ModelRates, PriceOverrides,
    QueryCost, ResolvedRates,
};
pub use db::{MetaDb, MetaStoreError};
pub use gemini::GeminiRag;
pub use history::{ChatMessage, ChatSession, HistoryStore};
pub use ingestion::{gate, run_ingestion, IngestDisposition, IngestError, IngestGate};
pub use ledger::{Budget, BudgetLocks, LedgerStore, QueryLog, INDEX_MODEL};
pub use queue::{IngestJob, IngestQueue};
pub use rag::{
    extract_citations, AskRequest, Citation, ChunkStream, GroundingChunk, GroundingInfo, MockRag,
    OpStatus, RagClient, RagError, StreamChunk, UploadResult, UsageMeta,
};
pub use watchdog::{
    sweep_stuck_documents, sweep_stuck_documents_at, ResetMode, WatchdogError, WatchdogReport,
};
