//! Stale-document watchdog.
//!
//! Ingestion workers can crash after moving a document to RUNNING; nothing
//! else would ever move it again. The watchdog sweeps RUNNING documents whose
//! status timestamp (falling back to creation time) is older than a TTL and
//! forces them out, clearing the stale operation handle so a future delivery
//! performs a fresh upload instead of believing one is still in flight.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::catalog::{CatalogStore, DocumentStatus};
use crate::services::db::{current_timestamp_ms, MetaStoreError};

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Documents RUNNING longer than this are considered stuck (minutes).
    pub ttl_minutes: i64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { ttl_minutes: 60 }
    }
}

/// What to do with a stuck document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Automatic sweep: surface the failure.
    Fail,
    /// Manual/admin trigger: requeue for a fresh attempt.
    Requeue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchdogReport {
    pub reset: Vec<String>,
}

impl WatchdogReport {
    pub fn is_empty(&self) -> bool {
        self.reset.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error(transparent)]
    Meta(#[from] MetaStoreError),
    #[error("watchdog configuration invalid: {0}")]
    InvalidConfig(String),
}

pub fn sweep_stuck_documents(
    catalog: &CatalogStore,
    config: &WatchdogConfig,
    mode: ResetMode,
) -> Result<WatchdogReport, WatchdogError> {
    sweep_stuck_documents_at(catalog, config, mode, current_timestamp_ms())
}

/// Sweep with an explicit "now" so the TTL boundary is directly testable.
pub fn sweep_stuck_documents_at(
    catalog: &CatalogStore,
    config: &WatchdogConfig,
    mode: ResetMode,
    now_ms: i64,
) -> Result<WatchdogReport, WatchdogError> {
    if config.ttl_minutes <= 0 {
        return Err(WatchdogError::InvalidConfig(
            "ttl_minutes must be positive".to_string(),
        ));
    }

    let cutoff_ms = now_ms - config.ttl_minutes * 60_000;
    let stuck = catalog.list_stale_running(cutoff_ms)?;

    let mut report = WatchdogReport::default();
    for mut document in stuck {
        debug_assert!(document.status == DocumentStatus::Running);
        let status = match mode {
            ResetMode::Fail => DocumentStatus::Error,
            ResetMode::Requeue => DocumentStatus::Pending,
        };
        if mode == ResetMode::Fail {
            document.last_error =
                Some("Ingestion watchdog reset: stuck in RUNNING past TTL".to_string());
        }
        document.set_status(status);
        // Without this a future delivery would skip the upload, believing one
        // is already in flight.
        document.op_handle = None;
        catalog.update_document(&document)?;
        report.reset.push(document.id.clone());
    }

    if !report.is_empty() {
        tracing::info!(
            event = "watchdog_reset_stuck_documents",
            count = report.reset.len(),
            mode = ?mode
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;
    use crate::services::catalog::Document;
    use crate::services::db::MetaDb;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CatalogStore, String) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let db = MetaDb::open(&paths).expect("open env");
        let catalog = CatalogStore::new(db);
        let user = catalog.create_user("a@example.com").expect("user");
        let store = catalog
            .create_store(&user.id, "Store", "fileSearchStores/s1")
            .expect("store");
        (temp, catalog, store.id)
    }

    fn running_document(catalog: &CatalogStore, store_id: &str, changed_at_ms: i64) -> Document {
        let mut document = Document::new(store_id, "a.pdf", None, 10, None);
        document.status = DocumentStatus::Running;
        document.status_changed_at_ms = changed_at_ms;
        document.op_handle = Some("operations/stale".to_string());
        catalog.insert_document(&document).expect("insert");
        document
    }

    #[test]
    fn boundary_is_strict() {
        let (_temp, catalog, store_id) = setup();
        let config = WatchdogConfig { ttl_minutes: 60 };
        let now_ms = 10_000_000_000;
        let ttl_ms = 60 * 60_000;

        // Exactly at the TTL boundary: not reset.
        let at_boundary = running_document(&catalog, &store_id, now_ms - ttl_ms);
        let report =
            sweep_stuck_documents_at(&catalog, &config, ResetMode::Fail, now_ms).expect("sweep");
        assert!(report.is_empty());

        // One second past the boundary: reset.
        let mut stale = catalog
            .get_document(&at_boundary.id)
            .expect("get")
            .expect("present");
        stale.status_changed_at_ms = now_ms - ttl_ms - 1_000;
        catalog.update_document(&stale).expect("update");
        let report =
            sweep_stuck_documents_at(&catalog, &config, ResetMode::Fail, now_ms).expect("sweep");
        assert_eq!(report.reset, vec![stale.id.clone()]);

        let reset = catalog
            .get_document(&stale.id)
            .expect("get")
            .expect("present");
        assert_eq!(reset.status, DocumentStatus::Error);
        assert!(reset.op_handle.is_none());
        assert!(reset.last_error.is_some());
    }

    #[test]
    fn manual_mode_requeues_instead_of_failing() {
        let (_temp, catalog, store_id) = setup();
        let config = WatchdogConfig { ttl_minutes: 60 };
        let now_ms = 10_000_000_000;
        let document = running_document(&catalog, &store_id, now_ms - 61 * 60_000);

        let report = sweep_stuck_documents_at(&catalog, &config, ResetMode::Requeue, now_ms)
            .expect("sweep");
        assert_eq!(report.reset.len(), 1);

        let reset = catalog
            .get_document(&document.id)
            .expect("get")
            .expect("present");
        assert_eq!(reset.status, DocumentStatus::Pending);
        assert!(reset.op_handle.is_none());
    }

    #[test]
    fn fresh_running_documents_are_left_alone() {
        let (_temp, catalog, store_id) = setup();
        let config = WatchdogConfig { ttl_minutes: 60 };
        let now_ms = 10_000_000_000;
        running_document(&catalog, &store_id, now_ms - 10 * 60_000);

        let report =
            sweep_stuck_documents_at(&catalog, &config, ResetMode::Fail, now_ms).expect("sweep");
        assert!(report.is_empty());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let (_temp, catalog, _store_id) = setup();
        let config = WatchdogConfig { ttl_minutes: 0 };
        let err = sweep_stuck_documents_at(&catalog, &config, ResetMode::Fail, 1_000)
            .expect_err("invalid config");
        assert!(matches!(err, WatchdogError::InvalidConfig(_)));
    }
}
