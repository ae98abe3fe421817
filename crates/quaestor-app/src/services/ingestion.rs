//! Durable ingestion job: upload a document to the remote File Search store,
//! poll the long-running operation to completion, and reconcile the Document
//! row. The job assumes at-least-once delivery, so the entry gate is an
//! explicit decision table keyed on `{handle, status, store}`: the
//! idempotency contract lives in one auditable place instead of a chain of
//! nested conditionals.
//!
//! Business failures never propagate past the job boundary: they terminate by
//! writing an ERROR status to the Document. Only metadata-store failures (an
//! infra concern the queue's redelivery covers) surface as errors.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use rand::Rng;
use regex::Regex;
use thiserror::Error;

use crate::services::catalog::{clamp_remote_handle, Document, DocumentStatus, Store};
use crate::services::context::AppContext;
use crate::services::costs::{calc_index_cost, estimate_tokens_from_bytes, resolve_model_rates};
use crate::services::db::MetaStoreError;
use crate::services::ledger::{QueryLog, INDEX_MODEL};
use crate::services::queue::IngestJob;
use crate::services::rag::{RagError, UploadResult};

const POLL_INITIAL: Duration = Duration::from_secs(2);
const POLL_MULTIPLIER: f64 = 1.5;
const POLL_CAP: Duration = Duration::from_secs(20);
const POLL_JITTER_MAX: Duration = Duration::from_millis(1500);
const ERROR_MAX_LEN: usize = 500;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Meta(#[from] MetaStoreError),
}

/// Entry decision for one delivery of an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestGate {
    /// PENDING (or a retried ERROR) owned by nobody: run the job.
    Proceed,
    /// Document missing or soft-deleted: no-op success.
    SkipMissing,
    /// Already finished and no operation pending: no-op success.
    SkipDone,
    /// An operation handle is recorded and another delivery owns or finished
    /// the upload: refresh the heartbeat, never upload again.
    SkipDuplicate,
    /// Another worker already moved PENDING → RUNNING: only one may.
    SkipRunning,
    /// The owning store is missing, soft-deleted, or mismatched: mark ERROR.
    FailStore,
}

pub fn gate(document: Option<&Document>, store: Option<&Store>) -> IngestGate {
    let Some(document) = document else {
        return IngestGate::SkipMissing;
    };
    if document.is_deleted() {
        return IngestGate::SkipMissing;
    }
    let store_valid = store
        .map(|store| !store.is_deleted() && store.id == document.store_id)
        .unwrap_or(false);
    if !store_valid {
        return IngestGate::FailStore;
    }
    let has_handle = document.op_handle.is_some();
    match (has_handle, document.status) {
        (false, DocumentStatus::Done) => IngestGate::SkipDone,
        (true, DocumentStatus::Running) | (true, DocumentStatus::Done) => IngestGate::SkipDuplicate,
        (false, DocumentStatus::Running) => IngestGate::SkipRunning,
        _ => IngestGate::Proceed,
    }
}

/// Terminal disposition of one delivery, surfaced for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestDisposition {
    Skipped(IngestGate),
    Done,
    Failed,
}

/// Scrub filesystem paths out of an error string and bound its length; raw
/// paths must never reach user-visible surfaces.
pub fn sanitize_error(message: &str) -> String {
    static PATH_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATH_PATTERN
        .get_or_init(|| Regex::new(r"/[A-Za-z0-9._-]*/?(tmp|var|app|home)[^\s]*").ok());
    let scrubbed = match pattern {
        Some(pattern) => pattern.replace_all(message, "[path]").into_owned(),
        None => message.to_string(),
    };
    let mut bounded: String = scrubbed.chars().take(ERROR_MAX_LEN).collect();
    if bounded.is_empty() {
        bounded = "Unknown error".to_string();
    }
    bounded
}

enum PollFailure {
    /// Explicit error field in the status payload: the remote side failed
    /// definitively, the uploaded file is an orphan.
    Remote(String),
    /// The poll ceiling elapsed; the operation may still complete remotely,
    /// so the uploaded file is left alone for a later delivery to adopt.
    TimedOut(f64),
}

/// Run one delivery of an ingestion job. Never panics past the job boundary;
/// only metadata-store errors propagate (redelivery covers them).
pub fn run_ingestion(ctx: &AppContext, job: &IngestJob) -> Result<IngestDisposition, IngestError> {
    let result = run_ingestion_inner(ctx, job);
    cleanup_temp_file(&job.local_path);
    result
}

fn run_ingestion_inner(
    ctx: &AppContext,
    job: &IngestJob,
) -> Result<IngestDisposition, IngestError> {
    let document = ctx.catalog.get_document(&job.document_id)?;
    let store = ctx.catalog.get_store(&job.store_id)?;

    match gate(document.as_ref(), store.as_ref()) {
        IngestGate::Proceed => {}
        IngestGate::SkipMissing => {
            tracing::info!(event = "ingest_skip_deleted_doc", document_id = %job.document_id);
            return Ok(IngestDisposition::Skipped(IngestGate::SkipMissing));
        }
        IngestGate::SkipDone => {
            tracing::info!(event = "ingest_already_done", document_id = %job.document_id);
            return Ok(IngestDisposition::Skipped(IngestGate::SkipDone));
        }
        IngestGate::SkipDuplicate => {
            // Another delivery owns or finished this upload; keep the
            // heartbeat fresh without altering status.
            if let Some(mut document) = document {
                document.touch_status();
                ctx.catalog.update_document(&document)?;
            }
            tracing::info!(
                event = "ingest_skip_existing_operation",
                document_id = %job.document_id
            );
            return Ok(IngestDisposition::Skipped(IngestGate::SkipDuplicate));
        }
        IngestGate::SkipRunning => {
            tracing::info!(event = "ingest_skip_already_running", document_id = %job.document_id);
            return Ok(IngestDisposition::Skipped(IngestGate::SkipRunning));
        }
        IngestGate::FailStore => {
            tracing::warn!(
                event = "ingest_store_not_found",
                store_id = %job.store_id,
                document_id = %job.document_id
            );
            if let Some(mut document) = document {
                document.last_error = Some("Store missing or deleted".to_string());
                document.set_status(DocumentStatus::Error);
                ctx.catalog.update_document(&document)?;
            }
            return Ok(IngestDisposition::Skipped(IngestGate::FailStore));
        }
    }

    let (Some(mut document), Some(store)) = (document, store) else {
        // The gate only returns Proceed when both rows exist.
        return Ok(IngestDisposition::Skipped(IngestGate::SkipMissing));
    };

    // Make RUNNING externally visible before any slow remote I/O.
    document.last_error = None;
    document.set_status(DocumentStatus::Running);
    ctx.catalog.update_document(&document)?;

    tracing::info!(
        event = "ingest_upload_start",
        document_id = %document.id,
        store_id = %store.id,
        filename = %document.filename
    );

    // A file uploaded by *this* delivery; the compensation target if the job
    // later fails hard.
    let mut uploaded_file_id: Option<String> = None;

    let op_handle = match document.op_handle.clone() {
        Some(existing) => existing,
        None => {
            let display_name = document
                .display_name
                .clone()
                .unwrap_or_else(|| document.filename.clone());
            let upload = upload_with_retry(ctx, &store, &job.local_path, &display_name);
            match upload {
                Ok(result) => {
                    let op_handle = clamp_remote_handle(&result.op_handle);
                    document.op_handle = Some(op_handle.clone());
                    let file_id = result
                        .file_id
                        .or_else(|| recover_file_id(ctx, &op_handle, &document));
                    match file_id {
                        Some(file_id) => {
                            let file_id = clamp_remote_handle(&file_id);
                            document.remote_file_id = Some(file_id.clone());
                            uploaded_file_id = Some(file_id);
                        }
                        None => {
                            // Degrades a future remote delete to a no-op, not
                            // a failure.
                            tracing::warn!(
                                event = "ingest_file_id_missing",
                                document_id = %document.id,
                                store_id = %store.id
                            );
                        }
                    }
                    ctx.catalog.update_document(&document)?;
                    op_handle
                }
                Err(err) => {
                    tracing::warn!(
                        event = "ingest_upload_failed",
                        document_id = %document.id,
                        store_id = %store.id,
                        error = %err
                    );
                    return fail_document(ctx, document, &err.to_string());
                }
            }
        }
    };

    if op_handle.is_empty() {
        // The upload may still have landed remotely; a retry will not upload
        // again (a handle is recorded), so the orphan must go now.
        compensate_remote(ctx, &document, uploaded_file_id.as_deref());
        return fail_document(ctx, document, "ingestion did not return an operation handle");
    }

    match wait_for_operation(ctx, &op_handle) {
        Ok(recovered_file_id) => {
            if document.remote_file_id.is_none() {
                if let Some(file_id) = recovered_file_id {
                    document.remote_file_id = Some(clamp_remote_handle(&file_id));
                }
            }
            document.last_error = None;
            document.set_status(DocumentStatus::Done);
            ctx.catalog.update_document(&document)?;
            tracing::info!(
                event = "ingest_upload_status",
                document_id = %document.id,
                store_id = %store.id,
                status = "DONE"
            );
            log_index_cost(ctx, &store, &document);
            Ok(IngestDisposition::Done)
        }
        Err(PollFailure::TimedOut(elapsed)) => {
            tracing::info!(
                event = "ingest_op_still_running",
                document_id = %document.id,
                store_id = %store.id,
                elapsed_s = elapsed
            );
            // The operation may yet finish remotely; no compensation here.
            fail_document(ctx, document, &format!("Ingestion timed out after {elapsed:.1}s"))
        }
        Err(PollFailure::Remote(message)) => {
            tracing::warn!(
                event = "ingest_op_failed",
                document_id = %document.id,
                store_id = %store.id,
                op_handle = %op_handle,
                error = %message
            );
            // The remote side failed definitively after a successful upload:
            // delete the orphaned file so no retry references it.
            let target = uploaded_file_id
                .clone()
                .or_else(|| document.remote_file_id.clone());
            compensate_remote(ctx, &document, target.as_deref());
            fail_document(ctx, document, &message)
        }
    }
}

/// Best-effort compensating delete of a remotely uploaded file.
fn compensate_remote(ctx: &AppContext, document: &Document, file_id: Option<&str>) {
    let Some(file_id) = file_id else {
        return;
    };
    match ctx.rag.delete_document(file_id) {
        Ok(()) => tracing::info!(
            event = "ingest_upload_rollback_deleted_remote",
            document_id = %document.id,
            file_id = %file_id
        ),
        Err(err) => tracing::warn!(
            event = "ingest_rollback_delete_failed",
            document_id = %document.id,
            file_id = %file_id,
            error = %err
        ),
    }
}

fn fail_document(
    ctx: &AppContext,
    mut document: Document,
    message: &str,
) -> Result<IngestDisposition, IngestError> {
    document.last_error = Some(sanitize_error(message));
    document.set_status(DocumentStatus::Error);
    ctx.catalog.update_document(&document)?;
    Ok(IngestDisposition::Failed)
}

fn upload_with_retry(
    ctx: &AppContext,
    store: &Store,
    local_path: &str,
    display_name: &str,
) -> Result<UploadResult, RagError> {
    use backon::{BlockingRetryable, ExponentialBuilder};

    let attempts = ctx.settings.gemini.retry_attempts.max(1);
    let call = || {
        ctx.rag
            .upload_file(&store.fs_name, std::path::Path::new(local_path), display_name)
    };
    call.retry(
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(6))
            .with_max_times(attempts - 1),
    )
    .when(RagError::retryable)
    .call()
}

/// The upload response sometimes omits the file id; one extra status poll can
/// usually recover it from the operation metadata.
fn recover_file_id(ctx: &AppContext, op_handle: &str, document: &Document) -> Option<String> {
    match ctx.rag.op_status(op_handle) {
        Ok(status) => status.file_id,
        Err(err) => {
            tracing::warn!(
                event = "ingest_file_id_recovery_failed",
                document_id = %document.id,
                error = %err
            );
            None
        }
    }
}

/// Poll the long-running operation until DONE or ERROR, with jittered
/// exponential backoff and a hard ceiling. Transient poll errors retry with
/// the same backoff; only an explicit error payload or the ceiling ends the
/// loop in failure.
fn wait_for_operation(ctx: &AppContext, op_handle: &str) -> Result<Option<String>, PollFailure> {
    let ceiling = Duration::from_secs(ctx.settings.gemini.ingestion_timeout_s);
    let start = Instant::now();
    let mut wait = POLL_INITIAL;
    loop {
        let elapsed = start.elapsed();
        if elapsed > ceiling {
            return Err(PollFailure::TimedOut(elapsed.as_secs_f64()));
        }

        match ctx.rag.op_status(op_handle) {
            Ok(status) => {
                if let Some(error) = status.error {
                    return Err(PollFailure::Remote(error));
                }
                if status.done {
                    return Ok(status.file_id);
                }
            }
            Err(err) => {
                tracing::warn!(
                    event = "ingest_op_status_retry",
                    op_handle = %op_handle,
                    retry_wait_ms = wait.as_millis() as u64,
                    error = %err
                );
            }
        }

        // Jitter avoids a thundering herd against operations.get.
        std::thread::sleep(wait + jitter());
        wait = next_backoff(wait);
    }
}

fn next_backoff(wait: Duration) -> Duration {
    let scaled = wait.mul_f64(POLL_MULTIPLIER);
    scaled.min(POLL_CAP)
}

fn jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=POLL_JITTER_MAX.as_millis() as u64))
}

/// Telemetry-only: a failed cost row never fails the job.
fn log_index_cost(ctx: &AppContext, store: &Store, document: &Document) {
    let tokens = estimate_tokens_from_bytes(document.size_bytes, document.mime_type.as_deref());
    let rates = resolve_model_rates(
        &ctx.settings.pricing.model_pricing,
        &ctx.settings.chat.default_model,
        ctx.settings.price_overrides,
        ctx.settings.global_prices(),
    );
    let cost = calc_index_cost(rates, tokens);
    if cost.is_zero() {
        return;
    }
    let log = QueryLog::new(
        store.user_id.clone(),
        Some(store.id.clone()),
        tokens,
        None,
        cost,
        INDEX_MODEL,
        None,
    );
    if let Err(err) = ctx.ledger.append(&log) {
        tracing::warn!(
            event = "ingest_index_cost_log_failed",
            document_id = %document.id,
            store_id = %store.id,
            error = %err
        );
    }
}

fn cleanup_temp_file(path: &str) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(event = "ingest_temp_cleanup_failed", path = %sanitize_error(path), error = %err);
        }
    }
}
