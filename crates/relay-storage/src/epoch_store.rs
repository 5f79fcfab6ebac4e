//! Epoch checkpoints and terminal results, keyed by big-endian stamp.

use relay_core::{EpochCheckpoint, EpochResult, Stamp};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Transactional, Tree};

use crate::{decode_json, encode_json, StorageError};

const CHECKPOINT_TREE: &str = "epoch_checkpoints";
const RESULT_TREE: &str = "epoch_results";

#[derive(Debug, Clone)]
pub struct EpochStore {
    checkpoints: Tree,
    results: Tree,
}

impl EpochStore {
    pub fn from_db(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            checkpoints: db.open_tree(CHECKPOINT_TREE)?,
            results: db.open_tree(RESULT_TREE)?,
        })
    }

    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(&db)
    }

    pub fn save_checkpoint(&self, cp: &EpochCheckpoint) -> Result<(), StorageError> {
        self.checkpoints
            .insert(stamp_key(cp.stamp), encode_json(cp)?)?;
        Ok(())
    }

    pub fn load_checkpoint(&self, stamp: Stamp) -> Result<Option<EpochCheckpoint>, StorageError> {
        let Some(v) = self.checkpoints.get(stamp_key(stamp))? else {
            return Ok(None);
        };
        Ok(Some(decode_json(&v)?))
    }

    /// All in-flight checkpoints in stamp order.
    pub fn list_checkpoints(&self) -> Result<Vec<EpochCheckpoint>, StorageError> {
        let mut out = Vec::new();
        for item in self.checkpoints.iter() {
            let (_, v) = item?;
            out.push(decode_json(&v)?);
        }
        Ok(out)
    }

    pub fn load_result(&self, stamp: Stamp) -> Result<Option<EpochResult>, StorageError> {
        let Some(v) = self.results.get(stamp_key(stamp))? else {
            return Ok(None);
        };
        Ok(Some(decode_json(&v)?))
    }

    /// Most recent results first.
    pub fn list_results(&self, limit: usize) -> Result<Vec<EpochResult>, StorageError> {
        let mut out = Vec::new();
        for item in self.results.iter().rev().take(limit) {
            let (_, v) = item?;
            out.push(decode_json(&v)?);
        }
        Ok(out)
    }

    /// Records a terminal result and removes the checkpoint in one transaction.
    pub fn finish(&self, result: &EpochResult) -> Result<(), StorageError> {
        let key = stamp_key(result.stamp);
        let bytes = encode_json(result)?;
        let r: Result<(), TransactionError<String>> = (&self.checkpoints, &self.results)
            .transaction(|(cps, res): &(TransactionalTree, TransactionalTree)| {
                cps.remove(key.as_slice())?;
                res.insert(key.as_slice(), bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<String>>(())
            });
        r.map_err(|e| match e {
            TransactionError::Abort(s) => StorageError::Transaction(s),
            TransactionError::Storage(e) => StorageError::Sled(e),
        })
    }
}

fn stamp_key(stamp: Stamp) -> [u8; 8] {
    stamp.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::Score;

    fn checkpoint(stamp: Stamp) -> EpochCheckpoint {
        let scores = vec![Score {
            address: "0x01".to_string(),
            fingerprint: "AA".to_string(),
            value: 1,
        }];
        EpochCheckpoint::start(stamp, scores, 6, 0).0
    }

    #[test]
    fn checkpoints_list_in_stamp_order() {
        let store = EpochStore::open_temporary().expect("store");
        for stamp in [300u64, 2, 1_000] {
            store.save_checkpoint(&checkpoint(stamp)).expect("save");
        }
        let stamps: Vec<Stamp> = store
            .list_checkpoints()
            .expect("list")
            .into_iter()
            .map(|c| c.stamp)
            .collect();
        assert_eq!(stamps, vec![2, 300, 1_000]);
    }

    #[test]
    fn finish_swaps_checkpoint_for_result() {
        let store = EpochStore::open_temporary().expect("store");
        let cp = checkpoint(7);
        store.save_checkpoint(&cp).expect("save");

        let result = EpochResult::from_checkpoint(&cp, true, None, None, None, 10);
        store.finish(&result).expect("finish");

        assert!(store.load_checkpoint(7).expect("load").is_none());
        assert_eq!(store.load_result(7).expect("load"), Some(result));
        assert_eq!(store.list_results(10).expect("list").len(), 1);
    }
}
