//! Application-level error type shared across binaries and services.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::AppConfigError;
use crate::paths::PathError;
use crate::server::ServerError;
use crate::services::context::ContextError;
use crate::services::ingestion::IngestError;
use crate::services::watchdog::WatchdogError;
use crate::services::{MetaStoreError, RagError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] AppConfigError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Meta(#[from] MetaStoreError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
    #[error(transparent)]
    Rag(#[from] RagError),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("background task aborted: {0}")]
    TaskAborted(String),
    #[error("user `{0}` not found")]
    UserNotFound(String),
    #[error("store `{0}` not found")]
    StoreNotFound(String),
}
