//! Append-only spend ledger and monthly budgets.
//!
//! Query-log rows are keyed `{user_id}|{created_at_ms:020}|{suffix}` so
//! month-to-date aggregation is a prefix scan over one user's rows. Rows are
//! never updated after insert. The model field `INDEX` marks indexing spend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::services::costs::CostMicros;
use crate::services::db::{current_timestamp_ms, decode, encode, MetaDb, MetaStoreError};

/// Model tag used for indexing-spend rows.
pub const INDEX_MODEL: &str = "INDEX";

const BUDGET_LOCK_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLog {
    pub id: String,
    pub user_id: String,
    pub store_id: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: Option<u64>,
    pub cost: CostMicros,
    pub model: String,
    pub tags: Option<BTreeMap<String, String>>,
    pub created_at_ms: i64,
}

impl QueryLog {
    pub fn new(
        user_id: impl Into<String>,
        store_id: Option<String>,
        prompt_tokens: u64,
        completion_tokens: Option<u64>,
        cost: CostMicros,
        model: impl Into<String>,
        tags: Option<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            store_id,
            prompt_tokens,
            completion_tokens,
            cost,
            model: model.into(),
            tags,
            created_at_ms: current_timestamp_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub user_id: String,
    pub monthly_limit: CostMicros,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct LedgerStore {
    db: MetaDb,
}

impl LedgerStore {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    pub fn append(&self, log: &QueryLog) -> Result<(), MetaStoreError> {
        debug_assert!(!log.user_id.is_empty());
        let key = format!(
            "{}|{:020}|{}",
            log.user_id,
            log.created_at_ms.max(0),
            &log.id[..8.min(log.id.len())]
        );
        let mut wtxn = self.db.write_txn()?;
        let encoded = encode(log)?;
        self.db.query_log.put(&mut wtxn, &key, &encoded)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Month-to-date spend: the sum of this user's ledger rows from the first
    /// UTC instant of the current calendar month onward.
    pub fn mtd_spend(&self, user_id: &str) -> Result<CostMicros, MetaStoreError> {
        self.spend_since(user_id, current_month_start_ms())
    }

    pub fn spend_since(&self, user_id: &str, since_ms: i64) -> Result<CostMicros, MetaStoreError> {
        let prefix = format!("{user_id}|");
        let rtxn = self.db.read_txn()?;
        let mut total = CostMicros::ZERO;
        for entry in self.db.query_log.prefix_iter(&rtxn, &prefix)? {
            let (_, raw) = entry?;
            let log: QueryLog = decode(raw)?;
            if log.created_at_ms >= since_ms {
                total += log.cost;
            }
        }
        Ok(total)
    }

    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<QueryLog>, MetaStoreError> {
        let prefix = format!("{user_id}|");
        let rtxn = self.db.read_txn()?;
        let mut out = Vec::new();
        for entry in self.db.query_log.prefix_iter(&rtxn, &prefix)? {
            let (_, raw) = entry?;
            out.push(decode(raw)?);
        }
        Ok(out)
    }

    pub fn set_budget(&self, user_id: &str, monthly_limit: CostMicros) -> Result<(), MetaStoreError> {
        let budget = Budget {
            user_id: user_id.to_string(),
            monthly_limit,
            created_at_ms: current_timestamp_ms(),
        };
        let mut wtxn = self.db.write_txn()?;
        let encoded = encode(&budget)?;
        self.db.budgets.put(&mut wtxn, user_id, &encoded)?;
        wtxn.commit()?;
        Ok(())
    }

    /// `None` means no budget row exists, which is treated as unlimited.
    pub fn user_budget(&self, user_id: &str) -> Result<Option<CostMicros>, MetaStoreError> {
        let rtxn = self.db.read_txn()?;
        match self.db.budgets.get(&rtxn, user_id)? {
            Some(raw) => {
                let budget: Budget = decode(raw)?;
                Ok(Some(budget.monthly_limit))
            }
            None => Ok(None),
        }
    }

    /// True iff a budget row exists and month-to-date spend plus the
    /// additional cost strictly exceeds the limit.
    pub fn would_exceed_budget(
        &self,
        user_id: &str,
        add_cost: CostMicros,
    ) -> Result<bool, MetaStoreError> {
        let Some(limit) = self.user_budget(user_id)? else {
            return Ok(false);
        };
        Ok(self.mtd_spend(user_id)? + add_cost > limit)
    }
}

fn current_month_start_ms() -> i64 {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

/// Best-effort per-user lock serializing budget checks between concurrent
/// requests. Failure to acquire within the timeout never aborts the request;
/// the degraded path is reported once per process so production races stay
/// diagnosable instead of silent.
#[derive(Debug, Default)]
pub struct BudgetLocks {
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    degraded_reported: AtomicBool,
}

impl BudgetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, user_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        match tokio::time::timeout(BUDGET_LOCK_TIMEOUT, lock.lock_owned()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                if !self.degraded_reported.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        event = "budget_lock_degraded",
                        user_id,
                        "budget lock acquisition timed out; proceeding unserialized"
                    );
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;
    use tempfile::TempDir;

    fn ledger() -> (TempDir, LedgerStore) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let db = MetaDb::open(&paths).expect("open env");
        (temp, LedgerStore::new(db))
    }

    #[test]
    fn spend_is_scoped_to_user_and_window() {
        let (_temp, ledger) = ledger();
        let mut row = QueryLog::new("user-a", None, 10, Some(5), CostMicros(40), "m", None);
        ledger.append(&row).expect("append");
        row = QueryLog::new("user-a", None, 10, Some(5), CostMicros(60), "m", None);
        ledger.append(&row).expect("append");
        row = QueryLog::new("user-b", None, 10, Some(5), CostMicros(999), "m", None);
        ledger.append(&row).expect("append");

        let spend = ledger.spend_since("user-a", 0).expect("spend");
        assert_eq!(spend, CostMicros(100));

        // Rows before the window start are excluded.
        let future = current_timestamp_ms() + 60_000;
        let spend = ledger.spend_since("user-a", future).expect("spend");
        assert_eq!(spend, CostMicros::ZERO);
    }

    #[test]
    fn missing_budget_row_means_unlimited() {
        let (_temp, ledger) = ledger();
        assert!(!ledger
            .would_exceed_budget("user-a", CostMicros(u64::MAX / 2))
            .expect("check"));
    }

    #[test]
    fn budget_boundary_is_strict() {
        let (_temp, ledger) = ledger();
        ledger
            .set_budget("user-a", CostMicros(1_000_000))
            .expect("set budget");
        let row = QueryLog::new("user-a", None, 1, None, CostMicros(400_000), "m", None);
        ledger.append(&row).expect("append");

        // spend + add == limit is allowed; one µUSD past it is rejected.
        assert!(!ledger
            .would_exceed_budget("user-a", CostMicros(600_000))
            .expect("check"));
        assert!(ledger
            .would_exceed_budget("user-a", CostMicros(600_001))
            .expect("check"));
        // A zero-cost request is never rejected on budget grounds.
        assert!(!ledger
            .would_exceed_budget("user-a", CostMicros::ZERO)
            .expect("check"));
    }

    #[tokio::test]
    async fn budget_lock_times_out_without_failing() {
        let locks = Arc::new(BudgetLocks::new());
        let guard = locks.acquire("user-a").await;
        assert!(guard.is_some());
        // A second acquisition while held degrades to None instead of hanging.
        let second = locks.acquire("user-a").await;
        assert!(second.is_none());
        drop(guard);
        assert!(locks.acquire("user-a").await.is_some());
    }
}
