//! Contract between the workflow and its external collaborators.
//!
//! The workflow talks to four services, each expressed as an async,
//! transport-agnostic trait:
//! - [`LedgerClient`]: the append-only reward ledger (canonical reads and writes).
//! - [`ReplicaClient`]: the fast, possibly lagging read replica of ledger state.
//! - [`SaleRegistry`]: hardware sale and NFT ownership lookups.
//! - [`DurableStore`]: content-addressed off-ledger storage for summaries.
//!
//! Deterministic in-memory implementations live in [`mock_client`]; HTTP
//! adapters live in `http_client` behind the `ledger-http` feature.
//!
//! ## Constraints
//! - **At-least-once**: writes may be repeated; the ledger converges because
//!   `addScores` and `distribute` are idempotent per stamp.
//! - **Typed failures**: a `Config` error is permanent and never retried.

pub mod mock_client;

#[cfg(feature = "ledger-http")]
pub mod http_client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ClaimableRelay, ContractState, FamilyUpdate, Score, Stamp};

/// Opaque ledger transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerTxId(pub String);

/// One read-replica response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSnapshot {
    pub state: ContractState,
    pub sort_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Tag attached to a durable upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableTag {
    pub name: String,
    pub value: String,
}

impl DurableTag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Reads and writes against the reward ledger.
///
/// `addScores` and `distribute` target the distribution contract; the claim
/// writes target the registry contract. Reads name the contract explicitly.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn read_state(&self, contract_id: &str) -> Result<ContractState, LedgerClientError>;
    async fn add_scores(&self, stamp: Stamp, scores: &[Score])
        -> Result<LedgerTxId, LedgerClientError>;
    async fn distribute(&self, stamp: Stamp) -> Result<LedgerTxId, LedgerClientError>;
    async fn add_claimable_batched(
        &self,
        relays: &[ClaimableRelay],
    ) -> Result<LedgerTxId, LedgerClientError>;
    async fn set_families(&self, updates: &[FamilyUpdate])
        -> Result<LedgerTxId, LedgerClientError>;

    /// Fails with `Config` when writes can never be signed or routed.
    fn ensure_writable(&self) -> Result<(), LedgerClientError> {
        Ok(())
    }
}

#[async_trait]
pub trait ReplicaClient: Send + Sync {
    async fn fetch(&self, contract_id: &str) -> Result<ReplicaSnapshot, ReplicaError>;
}

#[async_trait]
pub trait SaleRegistry: Send + Sync {
    /// NFT id sold with the device, `None` when the serial is unknown.
    async fn expected_nft_id(&self, device_serial: &str) -> Result<Option<u16>, RegistryError>;
    async fn owns_nft(&self, address: &str, nft_id: u16) -> Result<bool, RegistryError>;
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Uploads `payload` and returns its permanent reference.
    async fn upload(
        &self,
        payload: &serde_json::Value,
        tags: &[DurableTag],
    ) -> Result<String, DurableStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerClientError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LedgerClientError {
    /// Configuration errors never succeed on retry.
    pub fn is_config(&self) -> bool {
        matches!(self, LedgerClientError::Config(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LedgerClientError::Config(_) => "config",
            LedgerClientError::Network(_) => "network",
            LedgerClientError::Protocol(_) => "protocol",
            LedgerClientError::Serialization(_) => "serialization",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    #[error("network error: {0}")]
    Network(String),
    #[error("http status {0}")]
    Status(u16),
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurableStoreError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CanonicalizeError {
    #[error("serde error: {0}")]
    Serde(String),
}

/// Deterministic canonical JSON bytes: object keys sorted recursively, compact output.
pub fn canonical_json_bytes<T: Serialize>(v: &T) -> Result<Vec<u8>, CanonicalizeError> {
    let mut value = serde_json::to_value(v).map_err(|e| CanonicalizeError::Serde(e.to_string()))?;
    canonical_json_sort_in_place(&mut value);
    serde_json::to_vec(&value).map_err(|e| CanonicalizeError::Serde(e.to_string()))
}

/// Content address of a JSON payload: hex blake3 of its canonical bytes.
pub fn content_ref<T: Serialize>(v: &T) -> Result<String, CanonicalizeError> {
    let bytes = canonical_json_bytes(v)?;
    Ok(hex::encode(blake3::hash(&bytes).as_bytes()))
}

fn canonical_json_sort_in_place(v: &mut serde_json::Value) {
    match v {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(String, serde_json::Value)> =
                std::mem::take(map).into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            for (_, val) in entries.iter_mut() {
                canonical_json_sort_in_place(val);
            }
            *map = entries.into_iter().collect();
        }
        serde_json::Value::Array(arr) => {
            for x in arr.iter_mut() {
                canonical_json_sort_in_place(x);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_ref_ignores_key_order() {
        let a = json!({"stamp": 1, "totals": {"b": 2, "a": 1}});
        let b = json!({"totals": {"a": 1, "b": 2}, "stamp": 1});
        assert_eq!(content_ref(&a).unwrap(), content_ref(&b).unwrap());
        assert_ne!(
            content_ref(&a).unwrap(),
            content_ref(&json!({"stamp": 2})).unwrap()
        );
    }

    #[test]
    fn only_config_errors_are_permanent() {
        assert!(LedgerClientError::Config("no key".into()).is_config());
        assert!(!LedgerClientError::Network("reset".into()).is_config());
    }
}
