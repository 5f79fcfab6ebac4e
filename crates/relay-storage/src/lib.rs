#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]

//! Durable storage for the relay reward workflows.
//!
//! One sled database holds:
//! - epoch checkpoints and terminal epoch results ([`EpochStore`]),
//! - the verified-hardware uniqueness ledger and its failure log ([`HardwareStore`]),
//! - task ownership leases ([`TaskOwnership`]).
//!
//! Values are serde JSON. Multi-key updates use sled transactions.

pub mod epoch_store;
pub mod hardware_store;
pub mod ownership;

use std::path::Path;
use std::sync::Arc;

use sled::Tree;
use thiserror::Error;
use tracing::info;

pub use epoch_store::EpochStore;
pub use hardware_store::{
    HardwareFailure, HardwareStore, RecordOutcome, UniquenessConflict, VerifiedHardwareRecord,
};
pub use ownership::{Clock, LeaseRole, SystemClock, TaskLease, TaskOwnership};

pub const SCHEMA_VERSION: &str = "1";
const META_SCHEMA_KEY: &[u8] = b"schema_version";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serde error: {0}")]
    Serde(String),
    #[error("transaction aborted: {0}")]
    Transaction(String),
    #[error("schema mismatch: expected {expected}, found {found:?}")]
    SchemaMismatch {
        expected: String,
        found: Option<String>,
    },
}

pub(crate) fn encode_json<T: serde::Serialize>(v: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(v).map_err(|e| StorageError::Serde(e.to_string()))
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(v: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(v).map_err(|e| StorageError::Serde(e.to_string()))
}

/// All workflow stores over a single database.
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    db: sled::Db,
    meta: Tree,
    pub epochs: EpochStore,
    pub hardware: HardwareStore,
}

impl WorkflowStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    pub fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let meta = db.open_tree("meta")?;
        let storage = Self {
            epochs: EpochStore::from_db(&db)?,
            hardware: HardwareStore::from_db(&db)?,
            meta,
            db,
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Lease handle for `holder_id` over this database.
    pub fn task_ownership(
        &self,
        holder_id: impl Into<String>,
        lease_ms: u64,
    ) -> Result<TaskOwnership, StorageError> {
        TaskOwnership::new(&self.db, holder_id.into(), lease_ms, Arc::new(SystemClock))
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        match self.meta.get(META_SCHEMA_KEY)? {
            Some(val) => {
                let current = String::from_utf8_lossy(&val).to_string();
                if current != SCHEMA_VERSION {
                    return Err(StorageError::SchemaMismatch {
                        expected: SCHEMA_VERSION.to_string(),
                        found: Some(current),
                    });
                }
            }
            None => {
                self.meta.insert(META_SCHEMA_KEY, SCHEMA_VERSION.as_bytes())?;
                info!(schema = SCHEMA_VERSION, "initialized workflow storage schema");
            }
        }
        Ok(())
    }
}
