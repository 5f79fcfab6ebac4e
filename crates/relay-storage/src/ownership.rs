//! Task ownership leases.
//!
//! One lease record per task type (e.g. `distribution`) decides which node
//! runs that task. Leases are written by compare-and-swap and expire after
//! `lease_ms` without renewal.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{decode_json, encode_json, StorageError};

const TREE_NAME: &str = "task_leases";

pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        relay_core::now_ms()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskLease {
    pub task: String,
    pub holder_id: String,
    pub acquired_at_ms: u64,
    pub renew_at_ms: u64,
    pub expires_at_ms: u64,
    pub lease_ms: u64,
}

impl TaskLease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseRole {
    Owner,
    Standby,
}

#[derive(Clone)]
pub struct TaskOwnership {
    tree: sled::Tree,
    holder_id: String,
    lease_ms: u64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TaskOwnership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOwnership")
            .field("holder_id", &self.holder_id)
            .field("lease_ms", &self.lease_ms)
            .finish_non_exhaustive()
    }
}

impl TaskOwnership {
    pub fn new(
        db: &sled::Db,
        holder_id: String,
        lease_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            tree: db.open_tree(TREE_NAME)?,
            holder_id,
            lease_ms: lease_ms.max(1),
            clock,
        })
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn read(&self, task: &str) -> Result<Option<TaskLease>, StorageError> {
        let Some(v) = self.tree.get(task.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(decode_json(&v)?))
    }

    /// Live lease for `task`, if any.
    pub fn current_holder(&self, task: &str) -> Result<Option<TaskLease>, StorageError> {
        let now = self.clock.now_ms();
        Ok(self.read(task)?.filter(|l| !l.is_expired(now)))
    }

    /// Takes the lease if it is missing or expired.
    pub fn try_acquire(&self, task: &str) -> Result<LeaseRole, StorageError> {
        let now = self.clock.now_ms();
        let cur = self.tree.get(task.as_bytes())?;
        let cur_lease: Option<TaskLease> = cur.as_ref().map(|v| decode_json(v)).transpose()?;

        match &cur_lease {
            Some(l) if l.holder_id == self.holder_id && !l.is_expired(now) => {
                return Ok(LeaseRole::Owner)
            }
            Some(l) if !l.is_expired(now) => return Ok(LeaseRole::Standby),
            _ => {}
        }

        let new = TaskLease {
            task: task.to_string(),
            holder_id: self.holder_id.clone(),
            acquired_at_ms: now,
            renew_at_ms: now,
            expires_at_ms: now.saturating_add(self.lease_ms),
            lease_ms: self.lease_ms,
        };
        let cas = self.tree.compare_and_swap(
            task.as_bytes(),
            cur.as_ref().map(|v| v.as_ref()),
            Some(encode_json(&new)?),
        )?;
        if cas.is_ok() && self.is_current_holder(task)? {
            Ok(LeaseRole::Owner)
        } else {
            Ok(LeaseRole::Standby)
        }
    }

    /// Extends our lease. `false` means ownership was lost and the caller must step down.
    pub fn renew(&self, task: &str) -> Result<bool, StorageError> {
        let now = self.clock.now_ms();
        let Some(cur_bytes) = self.tree.get(task.as_bytes())? else {
            return Ok(false);
        };
        let cur: TaskLease = decode_json(&cur_bytes)?;
        if cur.holder_id != self.holder_id || cur.is_expired(now) {
            return Ok(false);
        }
        let next = TaskLease {
            renew_at_ms: now,
            expires_at_ms: now.saturating_add(self.lease_ms),
            lease_ms: self.lease_ms,
            ..cur
        };
        let cas = self.tree.compare_and_swap(
            task.as_bytes(),
            Some(cur_bytes.as_ref()),
            Some(encode_json(&next)?),
        )?;
        Ok(cas.is_ok() && self.is_current_holder(task)?)
    }

    /// Drops our lease; a lease held by another node is left untouched.
    pub fn release(&self, task: &str) -> Result<(), StorageError> {
        let Some(cur_bytes) = self.tree.get(task.as_bytes())? else {
            return Ok(());
        };
        let cur: TaskLease = decode_json(&cur_bytes)?;
        if cur.holder_id != self.holder_id {
            return Ok(());
        }
        let _ = self.tree.compare_and_swap(
            task.as_bytes(),
            Some(cur_bytes.as_ref()),
            Option::<sled::IVec>::None,
        )?;
        Ok(())
    }

    fn is_current_holder(&self, task: &str) -> Result<bool, StorageError> {
        let now = self.clock.now_ms();
        Ok(self
            .read(task)?
            .is_some_and(|l| l.holder_id == self.holder_id && !l.is_expired(now)))
    }
}
