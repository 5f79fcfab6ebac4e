//! Verified-hardware uniqueness ledger and attestation failure log.
//!
//! A verified record is indexed under three keys (device serial, atec serial,
//! nft id). All three are inserted in one transaction, so two proofs that
//! share any of them can never both be recorded. Failures are appended to a
//! separate, audit-only log and never consume uniqueness.

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Tree;

use crate::{decode_json, encode_json, StorageError};

const VERIFIED_TREE: &str = "verified_hardware";
const FAILURE_TREE: &str = "hardware_failures";
const DEVICE_PREFIX: &str = "device:";
const ATEC_PREFIX: &str = "atec:";
const NFT_PREFIX: &str = "nft:";
const LAST_SEQ_KEY: &[u8] = b"failure:last_seq";
const FAILURE_PREFIX: &[u8] = b"failure:event:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedHardwareRecord {
    pub fingerprint: String,
    pub address: String,
    pub node_id: String,
    pub nft_id: u16,
    pub device_serial: String,
    pub atec_serial: String,
    pub verified_at_ms: u64,
}

impl VerifiedHardwareRecord {
    /// The same relay presenting the same device, secure element and NFT.
    pub fn is_same_proof(
        &self,
        fingerprint: &str,
        device_serial: &str,
        atec_serial: &str,
        nft_id: u16,
    ) -> bool {
        self.fingerprint == fingerprint
            && self.device_serial == device_serial
            && self.atec_serial == atec_serial
            && self.nft_id == nft_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareFailure {
    #[serde(default)]
    pub seq: u64,
    pub fingerprint: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atec_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nft_id: Option<u16>,
    pub reason: String,
    pub at_ms: u64,
}

/// Which uniqueness key is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniquenessConflict {
    DeviceSerial,
    AtecSerial,
    NftId,
}

impl UniquenessConflict {
    pub fn reason(self) -> &'static str {
        match self {
            UniquenessConflict::DeviceSerial => "device_serial_in_use",
            UniquenessConflict::AtecSerial => "atec_serial_in_use",
            UniquenessConflict::NftId => "nft_id_in_use",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    Conflict(UniquenessConflict),
}

#[derive(Debug, Clone)]
pub struct HardwareStore {
    verified: Tree,
    failures: Tree,
}

impl HardwareStore {
    pub fn from_db(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            verified: db.open_tree(VERIFIED_TREE)?,
            failures: db.open_tree(FAILURE_TREE)?,
        })
    }

    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(&db)
    }

    pub fn is_device_serial_used(&self, serial: &str) -> Result<bool, StorageError> {
        Ok(self.verified.contains_key(device_key(serial))?)
    }

    pub fn is_atec_serial_used(&self, serial: &str) -> Result<bool, StorageError> {
        Ok(self.verified.contains_key(atec_key(serial))?)
    }

    pub fn is_nft_id_used(&self, nft_id: u16) -> Result<bool, StorageError> {
        Ok(self.verified.contains_key(nft_key(nft_id))?)
    }

    /// First taken key among device serial, atec serial and nft id.
    pub fn find_conflict(
        &self,
        device_serial: &str,
        atec_serial: &str,
        nft_id: u16,
    ) -> Result<Option<UniquenessConflict>, StorageError> {
        if self.is_device_serial_used(device_serial)? {
            return Ok(Some(UniquenessConflict::DeviceSerial));
        }
        if self.is_atec_serial_used(atec_serial)? {
            return Ok(Some(UniquenessConflict::AtecSerial));
        }
        if self.is_nft_id_used(nft_id)? {
            return Ok(Some(UniquenessConflict::NftId));
        }
        Ok(None)
    }

    pub fn get_by_device_serial(
        &self,
        serial: &str,
    ) -> Result<Option<VerifiedHardwareRecord>, StorageError> {
        let Some(v) = self.verified.get(device_key(serial))? else {
            return Ok(None);
        };
        Ok(Some(decode_json(&v)?))
    }

    /// Inserts the record under all three keys, or none of them.
    pub fn record_verified(
        &self,
        record: &VerifiedHardwareRecord,
    ) -> Result<RecordOutcome, StorageError> {
        let bytes = encode_json(record)?;
        let keys = [
            (device_key(&record.device_serial), UniquenessConflict::DeviceSerial),
            (atec_key(&record.atec_serial), UniquenessConflict::AtecSerial),
            (nft_key(record.nft_id), UniquenessConflict::NftId),
        ];
        let r: Result<(), TransactionError<UniquenessConflict>> =
            self.verified.transaction(|t: &TransactionalTree| {
                for (key, conflict) in &keys {
                    if t.get(key.as_bytes())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(*conflict));
                    }
                }
                for (key, _) in &keys {
                    t.insert(key.as_bytes(), bytes.as_slice())?;
                }
                Ok(())
            });
        match r {
            Ok(()) => Ok(RecordOutcome::Recorded),
            Err(TransactionError::Abort(conflict)) => Ok(RecordOutcome::Conflict(conflict)),
            Err(TransactionError::Storage(e)) => Err(StorageError::Sled(e)),
        }
    }

    /// Appends a failure entry and returns its sequence number.
    pub fn log_failure(&self, entry: HardwareFailure) -> Result<u64, StorageError> {
        let r: Result<u64, TransactionError<String>> =
            self.failures.transaction(|t: &TransactionalTree| {
                let last = t
                    .get(LAST_SEQ_KEY)?
                    .and_then(|v| <[u8; 8]>::try_from(v.as_ref()).ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(0);
                let next = last.saturating_add(1);
                let mut entry = entry.clone();
                entry.seq = next;
                let bytes = serde_json::to_vec(&entry)
                    .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;
                t.insert(LAST_SEQ_KEY, next.to_be_bytes().to_vec())?;
                t.insert(failure_key(next), bytes)?;
                Ok(next)
            });
        r.map_err(|e| match e {
            TransactionError::Abort(s) => StorageError::Serde(s),
            TransactionError::Storage(e) => StorageError::Sled(e),
        })
    }

    /// Most recent failures first.
    pub fn list_failures(&self, limit: usize) -> Result<Vec<HardwareFailure>, StorageError> {
        let mut out = Vec::new();
        for item in self.failures.scan_prefix(FAILURE_PREFIX).rev().take(limit) {
            let (_, v) = item?;
            out.push(decode_json(&v)?);
        }
        Ok(out)
    }
}

fn device_key(serial: &str) -> String {
    format!("{DEVICE_PREFIX}{}", serial.to_ascii_lowercase())
}

fn atec_key(serial: &str) -> String {
    format!("{ATEC_PREFIX}{}", serial.to_ascii_lowercase())
}

fn nft_key(nft_id: u16) -> String {
    format!("{NFT_PREFIX}{nft_id}")
}

fn failure_key(seq: u64) -> Vec<u8> {
    let mut k = FAILURE_PREFIX.to_vec();
    k.extend_from_slice(&seq.to_be_bytes());
    k
}
