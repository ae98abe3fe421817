//! Durable ingestion job queue.
//!
//! At-least-once delivery: a job row is removed only after the state machine
//! reaches a terminal outcome (success or business failure). Infra-level
//! crashes leave the row behind for redelivery; the ingestion entry gate makes
//! redelivery safe. Business failures are recorded on the Document row, never
//! on the queue.

use serde::{Deserialize, Serialize};

use crate::services::db::{current_timestamp_ms, decode, encode, MetaDb, MetaStoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJob {
    /// One job per document; the document id doubles as the job key so
    /// duplicate enqueues collapse.
    pub job_id: String,
    pub store_id: String,
    pub document_id: String,
    pub local_path: String,
    pub attempts: u32,
    pub created_at_ms: i64,
}

impl IngestJob {
    pub fn new(
        store_id: impl Into<String>,
        document_id: impl Into<String>,
        local_path: impl Into<String>,
    ) -> Self {
        let document_id = document_id.into();
        Self {
            job_id: document_id.clone(),
            store_id: store_id.into(),
            document_id,
            local_path: local_path.into(),
            attempts: 0,
            created_at_ms: current_timestamp_ms(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestQueue {
    db: MetaDb,
}

impl IngestQueue {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    pub fn enqueue(&self, job: &IngestJob) -> Result<(), MetaStoreError> {
        debug_assert!(!job.job_id.is_empty());
        let mut wtxn = self.db.write_txn()?;
        if self.db.ingest_jobs.get(&wtxn, &job.job_id)?.is_some() {
            return Err(MetaStoreError::Duplicate(job.job_id.clone()));
        }
        let encoded = encode(job)?;
        self.db.ingest_jobs.put(&mut wtxn, &job.job_id, &encoded)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Oldest pending jobs, with the delivery attempt recorded so redeliveries
    /// are visible in logs.
    pub fn claim_pending(&self, limit: usize) -> Result<Vec<IngestJob>, MetaStoreError> {
        debug_assert!(limit > 0);
        let mut claimed = Vec::new();
        let mut wtxn = self.db.write_txn()?;
        {
            let mut jobs = Vec::new();
            for entry in self.db.ingest_jobs.iter(&wtxn)? {
                let (_, raw) = entry?;
                let job: IngestJob = decode(raw)?;
                jobs.push(job);
            }
            jobs.sort_by_key(|job| job.created_at_ms);
            for mut job in jobs.into_iter().take(limit) {
                job.attempts = job.attempts.saturating_add(1);
                let encoded = encode(&job)?;
                self.db.ingest_jobs.put(&mut wtxn, &job.job_id, &encoded)?;
                claimed.push(job);
            }
        }
        wtxn.commit()?;
        Ok(claimed)
    }

    pub fn remove(&self, job_id: &str) -> Result<(), MetaStoreError> {
        let mut wtxn = self.db.write_txn()?;
        self.db.ingest_jobs.delete(&mut wtxn, job_id)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, MetaStoreError> {
        let rtxn = self.db.read_txn()?;
        Ok(self.db.ingest_jobs.len(&rtxn)? as usize)
    }

    pub fn is_empty(&self) -> Result<bool, MetaStoreError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;
    use tempfile::TempDir;

    fn queue() -> (TempDir, IngestQueue) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let db = MetaDb::open(&paths).expect("open env");
        (temp, IngestQueue::new(db))
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let (_temp, queue) = queue();
        let job = IngestJob::new("store", "doc-1", "/tmp/doc-1");
        queue.enqueue(&job).expect("enqueue");
        let err = queue.enqueue(&job).expect_err("duplicate");
        assert!(matches!(err, MetaStoreError::Duplicate(_)));
    }

    #[test]
    fn claim_bumps_attempts_and_remove_clears() {
        let (_temp, queue) = queue();
        queue
            .enqueue(&IngestJob::new("store", "doc-1", "/tmp/doc-1"))
            .expect("enqueue");

        let claimed = queue.claim_pending(10).expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);

        // Not removed yet: an infra crash here would leave it for redelivery.
        let again = queue.claim_pending(10).expect("claim");
        assert_eq!(again[0].attempts, 2);

        queue.remove("doc-1").expect("remove");
        assert!(queue.is_empty().expect("empty"));
    }
}
