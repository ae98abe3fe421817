//! End-to-end exercises of the ingestion state machine against the real
//! metadata store and a scripted remote client.

mod common;

use common::{build_test_app, stage_upload, PollMode, TestApp, UploadMode};
use std::sync::atomic::Ordering;

use quaestor_app::services::{
    run_ingestion, Document, DocumentStatus, IngestDisposition, IngestGate, IngestJob, Store, User,
    INDEX_MODEL,
};

fn seed_store(app: &TestApp) -> (User, Store) {
    let user = app.ctx.catalog.create_user("owner@example.com").expect("user");
    let store = app
        .ctx
        .catalog
        .create_store(&user.id, "Research", "fileSearchStores/research")
        .expect("store");
    (user, store)
}

fn seed_document(app: &TestApp, store: &Store, size: usize) -> (Document, IngestJob) {
    let staged = stage_upload(app, "report.pdf", &vec![b'x'; size]);
    let document = Document::new(
        &store.id,
        "report.pdf",
        Some("Quarterly report".to_string()),
        size as u64,
        Some("application/pdf".to_string()),
    );
    app.ctx.catalog.insert_document(&document).expect("insert");
    let job = IngestJob::new(&store.id, &document.id, staged.to_string_lossy().into_owned());
    (document, job)
}

#[test]
fn successful_upload_to_done() {
    let app = build_test_app(|_| {});
    let (user, store) = seed_store(&app);
    let (document, job) = seed_document(&app, &store, 1000);

    let disposition = run_ingestion(&app.ctx, &job).expect("run");
    assert_eq!(disposition, IngestDisposition::Done);

    let done = app
        .ctx
        .catalog
        .get_document(&document.id)
        .expect("get")
        .expect("present");
    assert_eq!(done.status, DocumentStatus::Done);
    assert!(done.last_error.is_none());
    assert_eq!(done.op_handle.as_deref(), Some("operations/abc"));
    assert_eq!(done.remote_file_id.as_deref(), Some("files/xyz"));

    // The staged temp file is gone.
    assert!(!std::path::Path::new(&job.local_path).exists());

    // An INDEX spend row was written: 1000 bytes / 4 = 250 estimated tokens,
    // and the cost floor keeps the tiny charge non-zero.
    let rows = app.ctx.ledger.list_for_user(&user.id).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].model, INDEX_MODEL);
    assert_eq!(rows[0].prompt_tokens, 250);
    assert!(!rows[0].cost.is_zero());
}

#[test]
fn polling_timeout_marks_error_without_compensation() {
    let app = build_test_app(|settings| {
        settings.gemini.ingestion_timeout_s = 1;
    });
    let (_user, store) = seed_store(&app);
    let (document, job) = seed_document(&app, &store, 100);
    app.rag.set_poll_mode(PollMode::NeverDone);

    let disposition = run_ingestion(&app.ctx, &job).expect("run");
    assert_eq!(disposition, IngestDisposition::Failed);

    let failed = app
        .ctx
        .catalog
        .get_document(&document.id)
        .expect("get")
        .expect("present");
    assert_eq!(failed.status, DocumentStatus::Error);
    let error = failed.last_error.expect("error recorded");
    assert!(error.contains("timed out"), "{error}");

    // The operation may still complete remotely; the uploaded file is left
    // for a later delivery to adopt.
    assert!(app.rag.deleted().is_empty());
    assert!(!std::path::Path::new(&job.local_path).exists());
}

#[test]
fn remote_failure_triggers_compensating_delete() {
    let app = build_test_app(|_| {});
    let (_user, store) = seed_store(&app);
    let (document, job) = seed_document(&app, &store, 100);
    app.rag
        .set_poll_mode(PollMode::RemoteError("backend exploded".to_string()));

    let disposition = run_ingestion(&app.ctx, &job).expect("run");
    assert_eq!(disposition, IngestDisposition::Failed);

    // The file id persisted before the failure is exactly what gets deleted.
    assert_eq!(app.rag.deleted(), vec!["files/xyz".to_string()]);

    let failed = app
        .ctx
        .catalog
        .get_document(&document.id)
        .expect("get")
        .expect("present");
    assert_eq!(failed.status, DocumentStatus::Error);
    assert!(failed.last_error.expect("error").contains("backend exploded"));
}

#[test]
fn redelivery_after_success_never_uploads_twice() {
    let app = build_test_app(|_| {});
    let (_user, store) = seed_store(&app);
    let (document, job) = seed_document(&app, &store, 100);

    let first = run_ingestion(&app.ctx, &job).expect("first run");
    assert_eq!(first, IngestDisposition::Done);
    assert_eq!(app.rag.uploads.load(Ordering::SeqCst), 1);

    let before = app
        .ctx
        .catalog
        .get_document(&document.id)
        .expect("get")
        .expect("present");
    std::thread::sleep(std::time::Duration::from_millis(5));

    // Same job delivered again (at-least-once queue): skip, heartbeat only.
    let second = run_ingestion(&app.ctx, &job).expect("second run");
    assert_eq!(second, IngestDisposition::Skipped(IngestGate::SkipDuplicate));
    assert_eq!(app.rag.uploads.load(Ordering::SeqCst), 1);

    let after = app
        .ctx
        .catalog
        .get_document(&document.id)
        .expect("get")
        .expect("present");
    assert_eq!(after.status, DocumentStatus::Done);
    assert_eq!(after.op_handle, before.op_handle);
    assert!(after.status_changed_at_ms > before.status_changed_at_ms);
}

#[test]
fn missing_store_marks_document_error() {
    let app = build_test_app(|_| {});
    let (_user, store) = seed_store(&app);
    let (document, mut job) = seed_document(&app, &store, 100);
    job.store_id = "no-such-store".to_string();

    let disposition = run_ingestion(&app.ctx, &job).expect("run");
    assert_eq!(disposition, IngestDisposition::Skipped(IngestGate::FailStore));
    assert_eq!(app.rag.uploads.load(Ordering::SeqCst), 0);

    let failed = app
        .ctx
        .catalog
        .get_document(&document.id)
        .expect("get")
        .expect("present");
    assert_eq!(failed.status, DocumentStatus::Error);
    assert_eq!(
        failed.last_error.as_deref(),
        Some("Store missing or deleted")
    );
}

#[test]
fn soft_deleted_document_is_skipped_silently() {
    let app = build_test_app(|_| {});
    let (_user, store) = seed_store(&app);
    let (mut document, job) = seed_document(&app, &store, 100);
    document.deleted_at_ms = Some(1);
    app.ctx.catalog.update_document(&document).expect("update");

    let disposition = run_ingestion(&app.ctx, &job).expect("run");
    assert_eq!(disposition, IngestDisposition::Skipped(IngestGate::SkipMissing));
    assert_eq!(app.rag.uploads.load(Ordering::SeqCst), 0);
    assert!(!std::path::Path::new(&job.local_path).exists());
}

#[test]
fn missing_operation_handle_is_a_hard_failure_with_cleanup() {
    let app = build_test_app(|_| {});
    let (_user, store) = seed_store(&app);
    let (document, job) = seed_document(&app, &store, 100);
    app.rag.set_upload_mode(UploadMode::EmptyHandle);

    let disposition = run_ingestion(&app.ctx, &job).expect("run");
    assert_eq!(disposition, IngestDisposition::Failed);

    let failed = app
        .ctx
        .catalog
        .get_document(&document.id)
        .expect("get")
        .expect("present");
    assert_eq!(failed.status, DocumentStatus::Error);
    assert!(failed
        .last_error
        .expect("error")
        .contains("did not return an operation handle"));
    // The uploaded orphan is cleaned up because retries will not re-upload.
    assert_eq!(app.rag.deleted(), vec!["files/orphan".to_string()]);
}
