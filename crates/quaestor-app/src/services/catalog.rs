//! Tenants and their data: users, stores, and documents.
//!
//! A `Store` maps 1:1 to a remote File Search namespace through its `fs_name`,
//! which is globally unique and immutable after creation. Documents move
//! through PENDING → RUNNING → {DONE, ERROR}; only the ingestion worker, the
//! watchdog, and admin restore may mutate them, and every status write bumps
//! `status_changed_at_ms` (the sole staleness signal the watchdog reads).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::db::{current_timestamp_ms, decode, encode, MetaDb, MetaStoreError};

/// Stored length cap for remote operation handles and file identifiers.
pub const REMOTE_HANDLE_MAX_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentStatus {
    Pending,
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub api_token: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub id: String,
    pub user_id: String,
    pub display_name: String,
    /// Remote File Search namespace; globally unique, immutable after creation.
    pub fs_name: String,
    pub deleted_at_ms: Option<i64>,
    pub deleted_by: Option<String>,
    pub created_at_ms: i64,
}

impl Store {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at_ms.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub store_id: String,
    pub filename: String,
    pub display_name: Option<String>,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    pub status: DocumentStatus,
    pub status_changed_at_ms: i64,
    /// A non-null handle means an upload was attempted; re-running the job
    /// must not upload again.
    pub op_handle: Option<String>,
    pub remote_file_id: Option<String>,
    pub last_error: Option<String>,
    pub deleted_at_ms: Option<i64>,
    pub deleted_by: Option<String>,
    pub created_at_ms: i64,
}

impl Document {
    pub fn new(
        store_id: impl Into<String>,
        filename: impl Into<String>,
        display_name: Option<String>,
        size_bytes: u64,
        mime_type: Option<String>,
    ) -> Self {
        let now_ms = current_timestamp_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            store_id: store_id.into(),
            filename: filename.into(),
            display_name,
            size_bytes,
            mime_type,
            status: DocumentStatus::Pending,
            status_changed_at_ms: now_ms,
            op_handle: None,
            remote_file_id: None,
            last_error: None,
            deleted_at_ms: None,
            deleted_by: None,
            created_at_ms: now_ms,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at_ms.is_some()
    }

    pub fn set_status(&mut self, status: DocumentStatus) {
        self.status = status;
        self.status_changed_at_ms = current_timestamp_ms();
    }

    /// Bump `status_changed_at_ms` without changing the current status.
    pub fn touch_status(&mut self) {
        self.status_changed_at_ms = current_timestamp_ms();
    }

    /// Timestamp the watchdog judges staleness by.
    pub fn staleness_anchor_ms(&self) -> i64 {
        if self.status_changed_at_ms > 0 {
            self.status_changed_at_ms
        } else {
            self.created_at_ms
        }
    }
}

/// Truncate a remote handle/id for storage, keeping the stored value usable as
/// a resource path prefix.
pub fn clamp_remote_handle(raw: &str) -> String {
    if raw.len() <= REMOTE_HANDLE_MAX_LEN {
        return raw.to_string();
    }
    let mut end = REMOTE_HANDLE_MAX_LEN;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}

#[derive(Debug, Clone)]
pub struct CatalogStore {
    db: MetaDb,
}

impl CatalogStore {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    // -------- Users --------

    pub fn create_user(&self, email: impl Into<String>) -> Result<User, MetaStoreError> {
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.into(),
            api_token: Uuid::new_v4().simple().to_string(),
            created_at_ms: current_timestamp_ms(),
        };
        let mut wtxn = self.db.write_txn()?;
        let encoded = encode(&user)?;
        self.db.users.put(&mut wtxn, &user.id, &encoded)?;
        self.db
            .user_tokens
            .put(&mut wtxn, &user.api_token, &user.id)?;
        wtxn.commit()?;
        Ok(user)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>, MetaStoreError> {
        let rtxn = self.db.read_txn()?;
        match self.db.users.get(&rtxn, user_id)? {
            Some(raw) => Ok(Some(decode(raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_user_by_token(&self, token: &str) -> Result<Option<User>, MetaStoreError> {
        let rtxn = self.db.read_txn()?;
        let Some(user_id) = self.db.user_tokens.get(&rtxn, token)? else {
            return Ok(None);
        };
        match self.db.users.get(&rtxn, user_id)? {
            Some(raw) => Ok(Some(decode(raw)?)),
            None => Ok(None),
        }
    }

    // -------- Stores --------

    /// Create a store row for an already-created remote namespace. The
    /// `fs_name` must be globally unique; a second registration is rejected.
    pub fn create_store(
        &self,
        user_id: &str,
        display_name: &str,
        fs_name: &str,
    ) -> Result<Store, MetaStoreError> {
        let store = Store {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            fs_name: fs_name.to_string(),
            deleted_at_ms: None,
            deleted_by: None,
            created_at_ms: current_timestamp_ms(),
        };
        let mut wtxn = self.db.write_txn()?;
        if self.db.store_names.get(&wtxn, fs_name)?.is_some() {
            return Err(MetaStoreError::Duplicate(fs_name.to_string()));
        }
        let encoded = encode(&store)?;
        self.db.stores.put(&mut wtxn, &store.id, &encoded)?;
        self.db.store_names.put(&mut wtxn, fs_name, &store.id)?;
        wtxn.commit()?;
        Ok(store)
    }

    pub fn get_store(&self, store_id: &str) -> Result<Option<Store>, MetaStoreError> {
        let rtxn = self.db.read_txn()?;
        match self.db.stores.get(&rtxn, store_id)? {
            Some(raw) => Ok(Some(decode(raw)?)),
            None => Ok(None),
        }
    }

    pub fn update_store(&self, store: &Store) -> Result<(), MetaStoreError> {
        let mut wtxn = self.db.write_txn()?;
        if self.db.stores.get(&wtxn, &store.id)?.is_none() {
            return Err(MetaStoreError::NotFound(store.id.clone()));
        }
        let encoded = encode(store)?;
        self.db.stores.put(&mut wtxn, &store.id, &encoded)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn soft_delete_store(
        &self,
        store_id: &str,
        deleted_by: Option<&str>,
    ) -> Result<Store, MetaStoreError> {
        let mut store = self
            .get_store(store_id)?
            .ok_or_else(|| MetaStoreError::NotFound(store_id.to_string()))?;
        store.deleted_at_ms = Some(current_timestamp_ms());
        store.deleted_by = deleted_by.map(str::to_string);
        self.update_store(&store)?;
        Ok(store)
    }

    pub fn restore_store(&self, store_id: &str) -> Result<Store, MetaStoreError> {
        let mut store = self
            .get_store(store_id)?
            .ok_or_else(|| MetaStoreError::NotFound(store_id.to_string()))?;
        store.deleted_at_ms = None;
        store.deleted_by = None;
        self.update_store(&store)?;
        Ok(store)
    }

    /// Tenant containment check: every requested store must exist, belong to
    /// the caller, and not be soft-deleted. Any miss reports only "not found"
    /// so foreign stores remain unobservable.
    pub fn stores_owned_by_user(
        &self,
        store_ids: &[String],
        user_id: &str,
    ) -> Result<Option<Vec<Store>>, MetaStoreError> {
        let mut owned = Vec::with_capacity(store_ids.len());
        for store_id in store_ids {
            match self.get_store(store_id)? {
                Some(store)
                    if store.user_id == user_id && !store.is_deleted() =>
                {
                    owned.push(store);
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(owned))
    }

    // -------- Documents --------

    pub fn insert_document(&self, document: &Document) -> Result<(), MetaStoreError> {
        let mut wtxn = self.db.write_txn()?;
        if self.db.documents.get(&wtxn, &document.id)?.is_some() {
            return Err(MetaStoreError::Duplicate(document.id.clone()));
        }
        let encoded = encode(document)?;
        self.db.documents.put(&mut wtxn, &document.id, &encoded)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_document(&self, document_id: &str) -> Result<Option<Document>, MetaStoreError> {
        let rtxn = self.db.read_txn()?;
        match self.db.documents.get(&rtxn, document_id)? {
            Some(raw) => Ok(Some(decode(raw)?)),
            None => Ok(None),
        }
    }

    pub fn update_document(&self, document: &Document) -> Result<(), MetaStoreError> {
        let mut wtxn = self.db.write_txn()?;
        if self.db.documents.get(&wtxn, &document.id)?.is_none() {
            return Err(MetaStoreError::NotFound(document.id.clone()));
        }
        let encoded = encode(document)?;
        self.db.documents.put(&mut wtxn, &document.id, &encoded)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn restore_document(&self, document_id: &str) -> Result<Document, MetaStoreError> {
        let mut document = self
            .get_document(document_id)?
            .ok_or_else(|| MetaStoreError::NotFound(document_id.to_string()))?;
        document.deleted_at_ms = None;
        document.deleted_by = None;
        self.update_document(&document)?;
        Ok(document)
    }

    pub fn list_documents(&self, store_id: &str) -> Result<Vec<Document>, MetaStoreError> {
        let rtxn = self.db.read_txn()?;
        let mut out = Vec::new();
        for entry in self.db.documents.iter(&rtxn)? {
            let (_, raw) = entry?;
            let document: Document = decode(raw)?;
            if document.store_id == store_id && !document.is_deleted() {
                out.push(document);
            }
        }
        out.sort_by_key(|d| d.created_at_ms);
        Ok(out)
    }

    /// Documents stuck in RUNNING whose staleness anchor is strictly older
    /// than the cutoff, skipping soft-deleted documents and documents whose
    /// store is missing or soft-deleted.
    pub fn list_stale_running(&self, cutoff_ms: i64) -> Result<Vec<Document>, MetaStoreError> {
        let rtxn = self.db.read_txn()?;
        let mut out = Vec::new();
        for entry in self.db.documents.iter(&rtxn)? {
            let (_, raw) = entry?;
            let document: Document = decode(raw)?;
            if document.status != DocumentStatus::Running || document.is_deleted() {
                continue;
            }
            if document.staleness_anchor_ms() >= cutoff_ms {
                continue;
            }
            let store_alive = match self.db.stores.get(&rtxn, &document.store_id)? {
                Some(raw_store) => {
                    let store: Store = decode(raw_store)?;
                    !store.is_deleted()
                }
                None => false,
            };
            if store_alive {
                out.push(document);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;
    use tempfile::TempDir;

    fn catalog() -> (TempDir, CatalogStore) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let db = MetaDb::open(&paths).expect("open env");
        (temp, CatalogStore::new(db))
    }

    #[test]
    fn fs_name_is_unique() {
        let (_temp, catalog) = catalog();
        let user = catalog.create_user("a@example.com").expect("user");
        catalog
            .create_store(&user.id, "Research", "fileSearchStores/abc")
            .expect("first store");
        let err = catalog
            .create_store(&user.id, "Other", "fileSearchStores/abc")
            .expect_err("duplicate fs_name rejected");
        assert!(matches!(err, MetaStoreError::Duplicate(_)));
    }

    #[test]
    fn token_lookup_resolves_user() {
        let (_temp, catalog) = catalog();
        let user = catalog.create_user("a@example.com").expect("user");
        let found = catalog
            .get_user_by_token(&user.api_token)
            .expect("lookup")
            .expect("present");
        assert_eq!(found.id, user.id);
        assert!(catalog.get_user_by_token("bogus").expect("lookup").is_none());
    }

    #[test]
    fn ownership_check_hides_foreign_and_deleted_stores() {
        let (_temp, catalog) = catalog();
        let owner = catalog.create_user("owner@example.com").expect("user");
        let other = catalog.create_user("other@example.com").expect("user");
        let store = catalog
            .create_store(&owner.id, "Mine", "fileSearchStores/mine")
            .expect("store");

        let ids = vec![store.id.clone()];
        assert!(catalog
            .stores_owned_by_user(&ids, &owner.id)
            .expect("check")
            .is_some());
        assert!(catalog
            .stores_owned_by_user(&ids, &other.id)
            .expect("check")
            .is_none());

        catalog
            .soft_delete_store(&store.id, Some(&owner.id))
            .expect("soft delete");
        assert!(catalog
            .stores_owned_by_user(&ids, &owner.id)
            .expect("check")
            .is_none());
    }

    #[test]
    fn set_status_bumps_timestamp() {
        let mut document = Document::new("store", "a.pdf", None, 10, None);
        let before = document.status_changed_at_ms;
        std::thread::sleep(std::time::Duration::from_millis(2));
        document.set_status(DocumentStatus::Running);
        assert!(document.status_changed_at_ms > before);
        assert_eq!(document.status, DocumentStatus::Running);
    }

    #[test]
    fn clamp_remote_handle_bounds_length() {
        let short = clamp_remote_handle("operations/abc");
        assert_eq!(short, "operations/abc");
        let long = clamp_remote_handle(&"x".repeat(600));
        assert_eq!(long.len(), REMOTE_HANDLE_MAX_LEN);
    }

    #[test]
    fn stale_scan_respects_store_state() {
        let (_temp, catalog) = catalog();
        let user = catalog.create_user("a@example.com").expect("user");
        let store = catalog
            .create_store(&user.id, "Mine", "fileSearchStores/mine")
            .expect("store");

        let mut document = Document::new(&store.id, "a.pdf", None, 10, None);
        document.status = DocumentStatus::Running;
        document.status_changed_at_ms = 1_000;
        catalog.insert_document(&document).expect("insert");

        let stale = catalog.list_stale_running(2_000).expect("scan");
        assert_eq!(stale.len(), 1);

        catalog
            .soft_delete_store(&store.id, None)
            .expect("soft delete");
        let stale = catalog.list_stale_running(2_000).expect("scan");
        assert!(stale.is_empty());
    }
}
