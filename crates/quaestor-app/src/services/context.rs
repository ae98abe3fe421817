//! Shared application context: settings, metadata stores, the remote RAG
//! client, and the injected concurrency/rate-limit resources. Everything is
//! constructed explicitly (no module-level singletons) so tests can stand up
//! independent limits.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::Settings;
use crate::paths::{AppPaths, PathError};
use crate::services::catalog::CatalogStore;
use crate::services::db::{MetaDb, MetaStoreError};
use crate::services::gemini::GeminiRag;
use crate::services::history::HistoryStore;
use crate::services::ledger::{BudgetLocks, LedgerStore};
use crate::services::queue::IngestQueue;
use crate::services::rag::{MockRag, RagClient, RagError};

pub type ChatRateLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Meta(#[from] MetaStoreError),
    #[error(transparent)]
    Rag(#[from] RagError),
    #[error("invalid context configuration: {0}")]
    InvalidConfig(String),
}

pub struct AppContext {
    pub settings: Settings,
    pub paths: AppPaths,
    pub catalog: CatalogStore,
    pub ledger: LedgerStore,
    pub history: HistoryStore,
    pub queue: IngestQueue,
    pub rag: Arc<dyn RagClient>,
    pub chat_limiter: ChatRateLimiter,
    pub stream_gate: Arc<Semaphore>,
    pub budget_locks: BudgetLocks,
}

impl AppContext {
    pub fn check_chat_rate_limit(&self, user_id: &str) -> bool {
        self.chat_limiter.check_key(&user_id.to_string()).is_ok()
    }
}

/// Build the full context, choosing the mock client when `gemini.mock_mode`
/// is set.
pub fn build_app_context(settings: Settings) -> Result<Arc<AppContext>, ContextError> {
    let rag: Arc<dyn RagClient> = if settings.gemini.mock_mode {
        Arc::new(MockRag::new())
    } else {
        Arc::new(GeminiRag::from_config(&settings.gemini)?)
    };
    build_app_context_with(settings, rag)
}

/// Build the context around an explicit RAG client; tests inject fakes here.
pub fn build_app_context_with(
    settings: Settings,
    rag: Arc<dyn RagClient>,
) -> Result<Arc<AppContext>, ContextError> {
    let paths = AppPaths::new(&settings.storage.path)?;
    let db = MetaDb::open(&paths)?;

    let per_minute = NonZeroU32::new(settings.chat.rate_limit_per_minute).ok_or_else(|| {
        ContextError::InvalidConfig("chat.rate_limit_per_minute must be positive".to_string())
    })?;
    let max_streams = settings.chat.max_concurrent_streams;
    if max_streams == 0 {
        return Err(ContextError::InvalidConfig(
            "chat.max_concurrent_streams must be positive".to_string(),
        ));
    }

    Ok(Arc::new(AppContext {
        catalog: CatalogStore::new(db.clone()),
        ledger: LedgerStore::new(db.clone()),
        history: HistoryStore::new(db.clone()),
        queue: IngestQueue::new(db),
        rag,
        chat_limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
        stream_gate: Arc::new(Semaphore::new(max_streams)),
        budget_locks: BudgetLocks::new(),
        paths,
        settings,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rate_limiter_enforces_per_user_quota() {
        let temp = TempDir::new().expect("temp dir");
        let mut settings = Settings::default();
        settings.storage.path = temp.path().to_path_buf();
        settings.chat.rate_limit_per_minute = 2;
        let ctx = build_app_context(settings).expect("context");

        assert!(ctx.check_chat_rate_limit("user-a"));
        assert!(ctx.check_chat_rate_limit("user-a"));
        assert!(!ctx.check_chat_rate_limit("user-a"));
        // Another user has an independent bucket.
        assert!(ctx.check_chat_rate_limit("user-b"));
    }

    #[test]
    fn zero_stream_limit_is_rejected() {
        let temp = TempDir::new().expect("temp dir");
        let mut settings = Settings::default();
        settings.storage.path = temp.path().to_path_buf();
        settings.chat.max_concurrent_streams = 0;
        assert!(build_app_context(settings).is_err());
    }
}
