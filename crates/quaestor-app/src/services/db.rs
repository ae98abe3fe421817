//! LMDB-backed metadata environment.
//!
//! One environment holds a named database per entity; records are serde
//! structs encoded with bincode. Write transactions are the transactional
//! unit-of-work; LMDB's single-writer property is what stands in for row-level
//! locking here, with the per-user budget lock layered on top in `ledger`.

use std::time::{SystemTime, UNIX_EPOCH};

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::paths::{AppPaths, PathError};

const META_ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB
const MAX_DBS: u32 = 12;

#[derive(Debug, Error)]
pub enum MetaStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("record `{0}` already exists")]
    Duplicate(String),
    #[error("record `{0}` not found")]
    NotFound(String),
}

/// Shared handle over the metadata environment and its databases. Cloning is
/// cheap; `Env` is internally reference-counted and `Database` is `Copy`.
#[derive(Debug, Clone)]
pub struct MetaDb {
    env: Env,
    pub(crate) users: Database<Str, Bytes>,
    pub(crate) user_tokens: Database<Str, Str>,
    pub(crate) stores: Database<Str, Bytes>,
    pub(crate) store_names: Database<Str, Str>,
    pub(crate) documents: Database<Str, Bytes>,
    pub(crate) ingest_jobs: Database<Str, Bytes>,
    pub(crate) query_log: Database<Str, Bytes>,
    pub(crate) budgets: Database<Str, Bytes>,
    pub(crate) chat_sessions: Database<Str, Bytes>,
    pub(crate) chat_messages: Database<Str, Bytes>,
}

impl MetaDb {
    pub fn open(paths: &AppPaths) -> Result<Self, MetaStoreError> {
        let path = paths.lmdb_env_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(MAX_DBS);
        options.map_size(META_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };

        let mut wtxn = env.write_txn()?;
        let users = env.create_database::<Str, Bytes>(&mut wtxn, Some("users"))?;
        let user_tokens = env.create_database::<Str, Str>(&mut wtxn, Some("user_tokens"))?;
        let stores = env.create_database::<Str, Bytes>(&mut wtxn, Some("stores"))?;
        let store_names = env.create_database::<Str, Str>(&mut wtxn, Some("store_names"))?;
        let documents = env.create_database::<Str, Bytes>(&mut wtxn, Some("documents"))?;
        let ingest_jobs = env.create_database::<Str, Bytes>(&mut wtxn, Some("ingest_jobs"))?;
        let query_log = env.create_database::<Str, Bytes>(&mut wtxn, Some("query_log"))?;
        let budgets = env.create_database::<Str, Bytes>(&mut wtxn, Some("budgets"))?;
        let chat_sessions = env.create_database::<Str, Bytes>(&mut wtxn, Some("chat_sessions"))?;
        let chat_messages = env.create_database::<Str, Bytes>(&mut wtxn, Some("chat_messages"))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            users,
            user_tokens,
            stores,
            store_names,
            documents,
            ingest_jobs,
            query_log,
            budgets,
            chat_sessions,
            chat_messages,
        })
    }

    pub(crate) fn read_txn(&self) -> Result<RoTxn<'_>, MetaStoreError> {
        Ok(self.env.read_txn()?)
    }

    pub(crate) fn write_txn(&self) -> Result<RwTxn<'_>, MetaStoreError> {
        Ok(self.env.write_txn()?)
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MetaStoreError> {
    Ok(encode_to_vec(value, config::standard())?)
}

pub(crate) fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, MetaStoreError> {
    let (value, _) = decode_from_slice(raw, config::standard())?;
    Ok(value)
}

pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_databases() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let db = MetaDb::open(&paths).expect("open env");

        let rtxn = db.read_txn().expect("read txn");
        assert_eq!(db.documents.len(&rtxn).expect("len"), 0);
        assert_eq!(db.query_log.len(&rtxn).expect("len"), 0);
    }

    #[test]
    fn roundtrip_codec() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Probe {
            name: String,
            count: u64,
        }
        let probe = Probe {
            name: "probe".to_string(),
            count: 7,
        };
        let raw = encode(&probe).expect("encode");
        let back: Probe = decode(&raw).expect("decode");
        assert_eq!(back, probe);
    }
}
