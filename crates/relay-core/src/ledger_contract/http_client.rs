//! HTTP adapters for the ledger, read replica, sale registry and durable store.
//!
//! These adapters **do not** assume default endpoint paths. Every path comes
//! from configuration; `{contract}`, `{serial}` and `{nft_id}` tokens are
//! substituted per call.

use super::{
    DurableStore, DurableStoreError, DurableTag, LedgerClient, LedgerClientError, LedgerTxId,
    RegistryError, ReplicaClient, ReplicaError, ReplicaSnapshot, SaleRegistry,
};
use crate::types::{
    normalize_address, ClaimableRelay, ContractState, FamilyUpdate, Score, Stamp,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn build_client(timeout_ms: Option<u64>) -> Result<Client, String> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)))
        .build()
        .map_err(|e| format!("failed to build http client: {e}"))
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

/// Ledger RPC binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRpcConfig {
    pub base_url: String,
    /// Signs writes; without it every write fails with a configuration error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_key: Option<String>,
    pub distribution_contract: String,
    pub registry_contract: String,
    pub endpoints: LedgerEndpointMap,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Endpoint paths (not full URLs).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerEndpointMap {
    /// GET, supports `{contract}`.
    #[serde(default)]
    pub read_state: Option<String>,
    /// POST, supports `{contract}`.
    #[serde(default)]
    pub interact: Option<String>,
}

impl LedgerRpcConfig {
    pub fn validate(&self) -> Result<(), LedgerClientError> {
        if self.base_url.trim().is_empty() {
            return Err(LedgerClientError::Config("ledger.base_url is empty".to_string()));
        }
        if self.distribution_contract.trim().is_empty() || self.registry_contract.trim().is_empty()
        {
            return Err(LedgerClientError::Config(
                "ledger contract ids must be set".to_string(),
            ));
        }
        if non_empty(self.endpoints.read_state.as_deref()).is_none() {
            return Err(LedgerClientError::Config(
                "missing endpoints.read_state in config".to_string(),
            ));
        }
        if non_empty(self.endpoints.interact.as_deref()).is_none() {
            return Err(LedgerClientError::Config(
                "missing endpoints.interact in config".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Interaction<'a, T: Serialize> {
    function: &'a str,
    #[serde(flatten)]
    input: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InteractionReceipt {
    tx_id: String,
}

#[derive(Debug, Serialize)]
struct AddScoresInput<'a> {
    stamp: String,
    scores: &'a [Score],
}

#[derive(Debug, Serialize)]
struct DistributeInput {
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct AddClaimableInput<'a> {
    relays: &'a [ClaimableRelay],
}

#[derive(Debug, Serialize)]
struct SetFamiliesInput<'a> {
    families: &'a [FamilyUpdate],
}

#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    cfg: LedgerRpcConfig,
    client: Client,
}

impl HttpLedgerClient {
    pub fn new(cfg: LedgerRpcConfig) -> Result<Self, LedgerClientError> {
        cfg.validate()?;
        let client = build_client(cfg.timeout_ms).map_err(LedgerClientError::Config)?;
        Ok(Self { cfg, client })
    }

    fn operator_key(&self) -> Result<&str, LedgerClientError> {
        non_empty(self.cfg.operator_key.as_deref()).ok_or_else(|| {
            LedgerClientError::Config("ledger.operator_key is not configured".to_string())
        })
    }

    fn path(tpl: Option<&str>, name: &str, contract: &str) -> Result<String, LedgerClientError> {
        let tpl = non_empty(tpl)
            .ok_or_else(|| LedgerClientError::Config(format!("missing endpoints.{name} in config")))?;
        Ok(tpl.replace("{contract}", contract))
    }

    async fn interact<T: Serialize + Send + Sync>(
        &self,
        contract: &str,
        function: &str,
        input: T,
    ) -> Result<LedgerTxId, LedgerClientError> {
        let key = self.operator_key()?;
        let path = Self::path(self.cfg.endpoints.interact.as_deref(), "interact", contract)?;
        let body = Interaction { function, input };
        let resp = self
            .client
            .post(join_url(&self.cfg.base_url, &path))
            .header("Authorization", key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerClientError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(LedgerClientError::Protocol(format!("http status {status}")));
        }
        let receipt: InteractionReceipt = resp
            .json()
            .await
            .map_err(|e| LedgerClientError::Serialization(e.to_string()))?;
        Ok(LedgerTxId(receipt.tx_id))
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn read_state(&self, contract_id: &str) -> Result<ContractState, LedgerClientError> {
        let path = Self::path(self.cfg.endpoints.read_state.as_deref(), "read_state", contract_id)?;
        let resp = self
            .client
            .get(join_url(&self.cfg.base_url, &path))
            .send()
            .await
            .map_err(|e| LedgerClientError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(LedgerClientError::Protocol(format!("http status {status}")));
        }
        resp.json()
            .await
            .map_err(|e| LedgerClientError::Serialization(e.to_string()))
    }

    async fn add_scores(
        &self,
        stamp: Stamp,
        scores: &[Score],
    ) -> Result<LedgerTxId, LedgerClientError> {
        let input = AddScoresInput {
            stamp: stamp.to_string(),
            scores,
        };
        self.interact(&self.cfg.distribution_contract, "addScores", input)
            .await
    }

    async fn distribute(&self, stamp: Stamp) -> Result<LedgerTxId, LedgerClientError> {
        let input = DistributeInput {
            timestamp: stamp.to_string(),
        };
        self.interact(&self.cfg.distribution_contract, "distribute", input)
            .await
    }

    async fn add_claimable_batched(
        &self,
        relays: &[ClaimableRelay],
    ) -> Result<LedgerTxId, LedgerClientError> {
        self.interact(
            &self.cfg.registry_contract,
            "addClaimableBatched",
            AddClaimableInput { relays },
        )
        .await
    }

    async fn set_families(
        &self,
        updates: &[FamilyUpdate],
    ) -> Result<LedgerTxId, LedgerClientError> {
        self.interact(
            &self.cfg.registry_contract,
            "setFamilies",
            SetFamiliesInput { families: updates },
        )
        .await
    }

    fn ensure_writable(&self) -> Result<(), LedgerClientError> {
        self.operator_key()?;
        Self::path(self.cfg.endpoints.interact.as_deref(), "interact", "")?;
        Ok(())
    }
}

/// Read replica binding; `state_path` supports `{contract}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub base_url: String,
    pub state_path: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HttpReplicaClient {
    cfg: ReplicaConfig,
    client: Client,
}

impl HttpReplicaClient {
    pub fn new(cfg: ReplicaConfig) -> Result<Self, ReplicaError> {
        let client = build_client(cfg.timeout_ms).map_err(ReplicaError::Network)?;
        Ok(Self { cfg, client })
    }
}

#[async_trait]
impl ReplicaClient for HttpReplicaClient {
    async fn fetch(&self, contract_id: &str) -> Result<ReplicaSnapshot, ReplicaError> {
        let path = self.cfg.state_path.replace("{contract}", contract_id);
        let resp = self
            .client
            .get(join_url(&self.cfg.base_url, &path))
            .send()
            .await
            .map_err(|e| ReplicaError::Network(e.to_string()))?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(ReplicaError::Status(status.as_u16()));
        }
        resp.json()
            .await
            .map_err(|e| ReplicaError::Decode(e.to_string()))
    }
}

/// Sale registry binding.
///
/// `sale_path` supports `{serial}` and answers `{"nftId": n}` (404 when
/// unknown); `owner_path` supports `{nft_id}` and answers `{"owner": "0x.."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleRegistryConfig {
    pub base_url: String,
    pub sale_path: String,
    pub owner_path: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleRecord {
    nft_id: u16,
}

#[derive(Debug, Deserialize)]
struct OwnerRecord {
    owner: String,
}

#[derive(Debug, Clone)]
pub struct HttpSaleRegistry {
    cfg: SaleRegistryConfig,
    client: Client,
}

impl HttpSaleRegistry {
    pub fn new(cfg: SaleRegistryConfig) -> Result<Self, RegistryError> {
        let client = build_client(cfg.timeout_ms).map_err(RegistryError::Network)?;
        Ok(Self { cfg, client })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
    ) -> Result<Option<T>, RegistryError> {
        let resp = self
            .client
            .get(join_url(&self.cfg.base_url, path))
            .send()
            .await
            .map_err(|e| RegistryError::Network(e.to_string()))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RegistryError::Protocol(format!("http status {status}")));
        }
        let parsed = resp
            .json()
            .await
            .map_err(|e| RegistryError::Protocol(e.to_string()))?;
        Ok(Some(parsed))
    }
}

#[async_trait]
impl SaleRegistry for HttpSaleRegistry {
    async fn expected_nft_id(&self, device_serial: &str) -> Result<Option<u16>, RegistryError> {
        let path = self.cfg.sale_path.replace("{serial}", device_serial);
        let record: Option<SaleRecord> = self.get_json(&path).await?;
        Ok(record.map(|r| r.nft_id))
    }

    async fn owns_nft(&self, address: &str, nft_id: u16) -> Result<bool, RegistryError> {
        let path = self.cfg.owner_path.replace("{nft_id}", &nft_id.to_string());
        let record: Option<OwnerRecord> = self.get_json(&path).await?;
        Ok(record.is_some_and(|r| normalize_address(&r.owner) == normalize_address(address)))
    }
}

/// Durable store binding; uploads are POSTed to `upload_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableStoreConfig {
    pub base_url: String,
    pub upload_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct UploadRequest<'a> {
    data: &'a serde_json::Value,
    tags: &'a [DurableTag],
}

#[derive(Debug, Deserialize)]
struct UploadReceipt {
    id: String,
}

#[derive(Debug, Clone)]
pub struct HttpDurableStore {
    cfg: DurableStoreConfig,
    client: Client,
}

impl HttpDurableStore {
    pub fn new(cfg: DurableStoreConfig) -> Result<Self, DurableStoreError> {
        let client = build_client(cfg.timeout_ms).map_err(DurableStoreError::Config)?;
        Ok(Self { cfg, client })
    }

    fn auth(&self, req: RequestBuilder) -> Result<RequestBuilder, DurableStoreError> {
        let key = non_empty(self.cfg.api_key.as_deref()).ok_or_else(|| {
            DurableStoreError::Config("durable.api_key is not configured".to_string())
        })?;
        Ok(req.header("Authorization", key))
    }
}

#[async_trait]
impl DurableStore for HttpDurableStore {
    async fn upload(
        &self,
        payload: &serde_json::Value,
        tags: &[DurableTag],
    ) -> Result<String, DurableStoreError> {
        let req = self
            .client
            .post(join_url(&self.cfg.base_url, &self.cfg.upload_path))
            .json(&UploadRequest { data: payload, tags });
        let resp = self
            .auth(req)?
            .send()
            .await
            .map_err(|e| DurableStoreError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DurableStoreError::Protocol(format!("http status {status}")));
        }
        let receipt: UploadReceipt = resp
            .json()
            .await
            .map_err(|e| DurableStoreError::Protocol(e.to_string()))?;
        Ok(receipt.id)
    }
}
