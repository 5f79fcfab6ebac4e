//! Deterministic in-memory collaborators for tests and offline runs.
//!
//! [`MockLedger`] performs real state transitions (scores are recorded per
//! stamp, `distribute` writes a summary and credits balances) and supports
//! failure injection per method. [`MockReplica`] mirrors a [`MockLedger`] and
//! can be made to lag or fail.

use super::{
    content_ref, DurableStore, DurableStoreError, DurableTag, LedgerClient, LedgerClientError,
    LedgerTxId, RegistryError, ReplicaClient, ReplicaError, ReplicaSnapshot, SaleRegistry,
};
use crate::types::{
    normalize_address, ClaimableRelay, ContractState, DistributionSummary, FamilyUpdate, Score,
    Stamp,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

pub const DEFAULT_DISTRIBUTION_CONTRACT: &str = "mock-distribution";
pub const DEFAULT_REGISTRY_CONTRACT: &str = "mock-registry";
/// Reward units distributed per stamp by the mock ledger.
pub const DEFAULT_REWARD_POOL: u64 = 1_000_000;

/// Number of calls per ledger method, including failed ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockLedgerCalls {
    pub read_state: u64,
    pub add_scores: u64,
    pub distribute: u64,
    pub add_claimable: u64,
    pub set_families: u64,
}

#[derive(Debug, Default)]
struct LedgerInner {
    distribution: ContractState,
    registry: ContractState,
    scores: BTreeMap<Stamp, BTreeMap<String, Score>>,
    version: u64,
    fail_add_scores: HashMap<String, u32>,
    fail_distribute: u32,
    fail_add_claimable: u32,
    fail_set_families: u32,
    fail_reads: u32,
    calls: MockLedgerCalls,
}

impl LedgerInner {
    fn next_tx(&mut self, method: &str) -> LedgerTxId {
        self.version = self.version.saturating_add(1);
        LedgerTxId(format!("mock:{method}:{}", self.version))
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[derive(Debug)]
pub struct MockLedger {
    distribution_id: String,
    registry_id: String,
    has_credentials: bool,
    reward_pool: u64,
    inner: Mutex<LedgerInner>,
}

impl MockLedger {
    pub fn new(distribution_id: impl Into<String>, registry_id: impl Into<String>) -> Self {
        Self {
            distribution_id: distribution_id.into(),
            registry_id: registry_id.into(),
            has_credentials: true,
            reward_pool: DEFAULT_REWARD_POOL,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// A ledger whose writes all fail with a configuration error.
    pub fn without_credentials() -> Self {
        Self {
            has_credentials: false,
            ..Self::default()
        }
    }

    pub fn with_reward_pool(mut self, pool: u64) -> Self {
        self.reward_pool = pool;
        self
    }

    pub fn distribution_id(&self) -> &str {
        &self.distribution_id
    }

    pub fn registry_id(&self) -> &str {
        &self.registry_id
    }

    /// Fails the next `times` `addScores` calls whose batch contains `fingerprint`.
    pub fn fail_add_scores_for(&self, fingerprint: impl Into<String>, times: u32) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.fail_add_scores.insert(fingerprint.into(), times);
    }

    pub fn fail_distribute(&self, times: u32) {
        self.inner.lock().expect("mutex poisoned").fail_distribute = times;
    }

    pub fn fail_add_claimable(&self, times: u32) {
        self.inner.lock().expect("mutex poisoned").fail_add_claimable = times;
    }

    pub fn fail_set_families(&self, times: u32) {
        self.inner.lock().expect("mutex poisoned").fail_set_families = times;
    }

    pub fn fail_reads(&self, times: u32) {
        self.inner.lock().expect("mutex poisoned").fail_reads = times;
    }

    pub fn calls(&self) -> MockLedgerCalls {
        self.inner.lock().expect("mutex poisoned").calls
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().expect("mutex poisoned").version
    }

    /// Scores the ledger has accepted for `stamp`.
    pub fn scores_for(&self, stamp: Stamp) -> Vec<Score> {
        let inner = self.inner.lock().expect("mutex poisoned");
        inner
            .scores
            .get(&stamp)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn seed_claimable(&self, fingerprint: &str, address: &str) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner
            .registry
            .claimable
            .insert(fingerprint.to_string(), normalize_address(address));
        inner.version = inner.version.saturating_add(1);
    }

    pub fn seed_verified(&self, fingerprint: &str, address: &str) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner
            .registry
            .verified
            .insert(fingerprint.to_string(), normalize_address(address));
        inner.version = inner.version.saturating_add(1);
    }

    pub fn seed_family(&self, fingerprint: &str, family: &[&str]) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        let mut members: Vec<String> = family.iter().map(|s| (*s).to_string()).collect();
        members.sort();
        inner.registry.families.insert(fingerprint.to_string(), members);
        inner.version = inner.version.saturating_add(1);
    }

    /// Current canonical state of `contract_id`, without counting a read.
    pub fn snapshot(&self, contract_id: &str) -> Option<ContractState> {
        let inner = self.inner.lock().expect("mutex poisoned");
        if contract_id == self.distribution_id {
            Some(inner.distribution.clone())
        } else if contract_id == self.registry_id {
            Some(inner.registry.clone())
        } else {
            None
        }
    }

    fn require_credentials(&self) -> Result<(), LedgerClientError> {
        if self.has_credentials {
            Ok(())
        } else {
            Err(LedgerClientError::Config(
                "operator credentials are not configured".to_string(),
            ))
        }
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new(DEFAULT_DISTRIBUTION_CONTRACT, DEFAULT_REGISTRY_CONTRACT)
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn read_state(&self, contract_id: &str) -> Result<ContractState, LedgerClientError> {
        {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            inner.calls.read_state += 1;
            if take_failure(&mut inner.fail_reads) {
                return Err(LedgerClientError::Network("injected read failure".to_string()));
            }
        }
        self.snapshot(contract_id)
            .ok_or_else(|| LedgerClientError::Protocol(format!("unknown contract {contract_id}")))
    }

    async fn add_scores(
        &self,
        stamp: Stamp,
        scores: &[Score],
    ) -> Result<LedgerTxId, LedgerClientError> {
        self.require_credentials()?;
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.calls.add_scores += 1;
        let mut injected = false;
        for s in scores {
            if let Some(n) = inner.fail_add_scores.get_mut(&s.fingerprint) {
                injected |= take_failure(n);
            }
        }
        if injected {
            return Err(LedgerClientError::Network("injected addScores failure".to_string()));
        }
        if inner.distribution.previous_distributions.contains_key(&stamp) {
            return Err(LedgerClientError::Protocol(format!(
                "stamp {stamp} is already distributed"
            )));
        }
        let entry = inner.scores.entry(stamp).or_default();
        for s in scores {
            entry.insert(s.fingerprint.clone(), s.clone());
        }
        Ok(inner.next_tx("addScores"))
    }

    async fn distribute(&self, stamp: Stamp) -> Result<LedgerTxId, LedgerClientError> {
        self.require_credentials()?;
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.calls.distribute += 1;
        if take_failure(&mut inner.fail_distribute) {
            return Err(LedgerClientError::Network("injected distribute failure".to_string()));
        }
        if inner.distribution.previous_distributions.contains_key(&stamp) {
            return Ok(inner.next_tx("distribute"));
        }

        let scores: Vec<Score> = inner
            .scores
            .get(&stamp)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        let total_score: u64 = scores.iter().map(|s| s.value).fold(0, u64::saturating_add);
        let mut total_distributed = 0u64;
        if total_score > 0 {
            for s in &scores {
                let share = u128::from(self.reward_pool) * u128::from(s.value)
                    / u128::from(total_score);
                let share = u64::try_from(share).unwrap_or(u64::MAX);
                total_distributed = total_distributed.saturating_add(share);
                let bal = inner
                    .distribution
                    .balances
                    .entry(normalize_address(&s.address))
                    .or_insert(0);
                *bal = bal.saturating_add(share);
            }
        }
        inner.distribution.previous_distributions.insert(
            stamp,
            DistributionSummary {
                stamp,
                total_score,
                total_distributed,
                relay_count: scores.len() as u64,
            },
        );
        Ok(inner.next_tx("distribute"))
    }

    async fn add_claimable_batched(
        &self,
        relays: &[ClaimableRelay],
    ) -> Result<LedgerTxId, LedgerClientError> {
        self.require_credentials()?;
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.calls.add_claimable += 1;
        if take_failure(&mut inner.fail_add_claimable) {
            return Err(LedgerClientError::Network(
                "injected addClaimableBatched failure".to_string(),
            ));
        }
        for r in relays {
            inner
                .registry
                .claimable
                .insert(r.fingerprint.clone(), normalize_address(&r.address));
        }
        Ok(inner.next_tx("addClaimableBatched"))
    }

    async fn set_families(
        &self,
        updates: &[FamilyUpdate],
    ) -> Result<LedgerTxId, LedgerClientError> {
        self.require_credentials()?;
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.calls.set_families += 1;
        if take_failure(&mut inner.fail_set_families) {
            return Err(LedgerClientError::Network("injected setFamilies failure".to_string()));
        }
        for u in updates {
            let current = inner
                .registry
                .families
                .remove(&u.fingerprint)
                .unwrap_or_default();
            let mut next: BTreeSet<String> = current.into_iter().collect();
            for r in &u.remove {
                next.remove(r);
            }
            next.extend(u.add.iter().cloned());
            inner
                .registry
                .families
                .insert(u.fingerprint.clone(), next.into_iter().collect());
        }
        Ok(inner.next_tx("setFamilies"))
    }

    fn ensure_writable(&self) -> Result<(), LedgerClientError> {
        self.require_credentials()
    }
}

#[derive(Debug, Default)]
struct ReplicaInner {
    fetches: u64,
    fail_next: u32,
    down: bool,
    lag_remaining: u32,
    frozen: HashMap<String, ReplicaSnapshot>,
}

/// Read replica that mirrors a [`MockLedger`].
#[derive(Debug)]
pub struct MockReplica {
    ledger: Arc<MockLedger>,
    inner: Mutex<ReplicaInner>,
}

impl MockReplica {
    pub fn new(ledger: Arc<MockLedger>) -> Self {
        Self {
            ledger,
            inner: Mutex::new(ReplicaInner::default()),
        }
    }

    pub fn fetches(&self) -> u64 {
        self.inner.lock().expect("mutex poisoned").fetches
    }

    pub fn fail_next(&self, times: u32) {
        self.inner.lock().expect("mutex poisoned").fail_next = times;
    }

    /// While down, every fetch fails.
    pub fn set_down(&self, down: bool) {
        self.inner.lock().expect("mutex poisoned").down = down;
    }

    /// Serves the current ledger state for the next `fetches` fetches,
    /// ignoring writes made in the meantime.
    pub fn lag_for(&self, fetches: u32) {
        let mut frozen = HashMap::new();
        for id in [self.ledger.distribution_id(), self.ledger.registry_id()] {
            if let Some(state) = self.ledger.snapshot(id) {
                frozen.insert(id.to_string(), self.make_snapshot(state));
            }
        }
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.frozen = frozen;
        inner.lag_remaining = fetches;
    }

    fn make_snapshot(&self, state: ContractState) -> ReplicaSnapshot {
        ReplicaSnapshot {
            state,
            sort_key: format!("{:012}", self.ledger.version()),
            signature: None,
        }
    }
}

#[async_trait]
impl ReplicaClient for MockReplica {
    async fn fetch(&self, contract_id: &str) -> Result<ReplicaSnapshot, ReplicaError> {
        {
            let mut inner = self.inner.lock().expect("mutex poisoned");
            inner.fetches += 1;
            if inner.down || take_failure(&mut inner.fail_next) {
                return Err(ReplicaError::Status(503));
            }
            if inner.lag_remaining > 0 {
                inner.lag_remaining -= 1;
                if let Some(snap) = inner.frozen.get(contract_id) {
                    return Ok(snap.clone());
                }
            }
        }
        let state = self.ledger.snapshot(contract_id).ok_or(ReplicaError::Status(404))?;
        Ok(self.make_snapshot(state))
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    sales: HashMap<String, u16>,
    owners: HashMap<u16, String>,
    down: bool,
}

#[derive(Debug, Default)]
pub struct MockSaleRegistry {
    inner: Mutex<RegistryInner>,
}

impl MockSaleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sale(&self, device_serial: &str, nft_id: u16) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.sales.insert(device_serial.to_ascii_lowercase(), nft_id);
    }

    pub fn set_owner(&self, nft_id: u16, address: &str) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.owners.insert(nft_id, normalize_address(address));
    }

    pub fn set_down(&self, down: bool) {
        self.inner.lock().expect("mutex poisoned").down = down;
    }
}

#[async_trait]
impl SaleRegistry for MockSaleRegistry {
    async fn expected_nft_id(&self, device_serial: &str) -> Result<Option<u16>, RegistryError> {
        let inner = self.inner.lock().expect("mutex poisoned");
        if inner.down {
            return Err(RegistryError::Network("registry unavailable".to_string()));
        }
        Ok(inner.sales.get(&device_serial.to_ascii_lowercase()).copied())
    }

    async fn owns_nft(&self, address: &str, nft_id: u16) -> Result<bool, RegistryError> {
        let inner = self.inner.lock().expect("mutex poisoned");
        if inner.down {
            return Err(RegistryError::Network("registry unavailable".to_string()));
        }
        Ok(inner
            .owners
            .get(&nft_id)
            .is_some_and(|owner| *owner == normalize_address(address)))
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    objects: HashMap<String, (serde_json::Value, Vec<DurableTag>)>,
    uploads: u64,
    fail_next: u32,
}

/// Content-addressed store: the reference is the blake3 of the canonical payload.
#[derive(Debug, Default)]
pub struct MockDurableStore {
    inner: Mutex<StoreInner>,
}

impl MockDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: u32) {
        self.inner.lock().expect("mutex poisoned").fail_next = times;
    }

    pub fn uploads(&self) -> u64 {
        self.inner.lock().expect("mutex poisoned").uploads
    }

    pub fn get(&self, reference: &str) -> Option<serde_json::Value> {
        let inner = self.inner.lock().expect("mutex poisoned");
        inner.objects.get(reference).map(|(v, _)| v.clone())
    }

    pub fn tags(&self, reference: &str) -> Vec<DurableTag> {
        let inner = self.inner.lock().expect("mutex poisoned");
        inner
            .objects
            .get(reference)
            .map(|(_, t)| t.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DurableStore for MockDurableStore {
    async fn upload(
        &self,
        payload: &serde_json::Value,
        tags: &[DurableTag],
    ) -> Result<String, DurableStoreError> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.uploads += 1;
        if take_failure(&mut inner.fail_next) {
            return Err(DurableStoreError::Network("injected upload failure".to_string()));
        }
        let reference =
            content_ref(payload).map_err(|e| DurableStoreError::Protocol(e.to_string()))?;
        inner
            .objects
            .insert(reference.clone(), (payload.clone(), tags.to_vec()));
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(fp: &str, addr: &str, value: u64) -> Score {
        Score {
            address: addr.to_string(),
            fingerprint: fp.to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn distribute_is_idempotent_and_credits_balances() {
        let ledger = MockLedger::default().with_reward_pool(1_000);
        ledger
            .add_scores(5, &[score("AA", "0x01", 1), score("BB", "0x02", 3)])
            .await
            .unwrap();
        ledger.distribute(5).await.unwrap();
        ledger.distribute(5).await.unwrap();

        let st = ledger.snapshot(DEFAULT_DISTRIBUTION_CONTRACT).unwrap();
        let summary = &st.previous_distributions[&5];
        assert_eq!(summary.total_score, 4);
        assert_eq!(summary.relay_count, 2);
        assert_eq!(summary.total_distributed, 1_000);
        assert_eq!(st.balances["0x01"], 250);
        assert_eq!(st.balances["0x02"], 750);
    }

    #[tokio::test]
    async fn injected_failure_is_consumed() {
        let ledger = MockLedger::default();
        ledger.fail_add_scores_for("AA", 1);
        assert!(ledger.add_scores(1, &[score("AA", "0x01", 1)]).await.is_err());
        assert!(ledger.add_scores(1, &[score("AA", "0x01", 1)]).await.is_ok());
        assert_eq!(ledger.calls().add_scores, 2);
    }

    #[tokio::test]
    async fn missing_credentials_fail_writes_with_config() {
        let ledger = MockLedger::without_credentials();
        let err = ledger.distribute(1).await.unwrap_err();
        assert!(err.is_config());
        assert!(ledger.read_state(DEFAULT_REGISTRY_CONTRACT).await.is_ok());
        assert!(ledger.ensure_writable().unwrap_err().is_config());
        assert!(MockLedger::default().ensure_writable().is_ok());
    }

    #[tokio::test]
    async fn set_families_applies_symmetric_difference() {
        let ledger = MockLedger::default();
        ledger.seed_family("AA", &["B1", "B2"]);
        ledger
            .set_families(&[FamilyUpdate {
                fingerprint: "AA".into(),
                add: vec!["B3".into()],
                remove: vec!["B1".into()],
            }])
            .await
            .unwrap();
        let st = ledger.snapshot(DEFAULT_REGISTRY_CONTRACT).unwrap();
        assert_eq!(st.families["AA"], vec!["B2".to_string(), "B3".to_string()]);
    }

    #[tokio::test]
    async fn lagging_replica_serves_frozen_state() {
        let ledger = Arc::new(MockLedger::default());
        let replica = MockReplica::new(ledger.clone());
        replica.lag_for(1);
        ledger.seed_claimable("AA", "0x01");

        let stale = replica.fetch(DEFAULT_REGISTRY_CONTRACT).await.unwrap();
        assert!(stale.state.claimable.is_empty());
        let fresh = replica.fetch(DEFAULT_REGISTRY_CONTRACT).await.unwrap();
        assert!(fresh.state.claimable.contains_key("AA"));
        assert_eq!(replica.fetches(), 2);
    }

    #[tokio::test]
    async fn durable_store_is_content_addressed() {
        let store = MockDurableStore::new();
        let payload = serde_json::json!({"stamp": 1, "totalScore": 4});
        let a = store.upload(&payload, &[]).await.unwrap();
        let b = store.upload(&payload, &[DurableTag::new("Stamp", "1")]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.uploads(), 2);
        assert_eq!(store.get(&a), Some(payload));
    }
}
