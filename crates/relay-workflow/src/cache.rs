//! Read-through cache in front of ledger state.
//!
//! Reads are served from a per-contract snapshot while it is younger than the
//! caller's staleness budget. Otherwise the read replica is asked; on replica
//! failure a stale snapshot is served, and with no snapshot at all the ledger
//! is read directly. Only a failed authoritative read surfaces as
//! [`CacheError::Unavailable`]; it never means "absent".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_core::ledger_contract::{LedgerClient, ReplicaClient, ReplicaSnapshot};
use relay_core::{ContractState, DistributionSummary, Stamp};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::CACHE_READS_TOTAL;

/// Staleness budget for distribution contract reads.
pub const DISTRIBUTION_MAX_AGE: Duration = Duration::from_millis(2_500);
/// Staleness budget for registry contract reads.
pub const REGISTRY_MAX_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("ledger state unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Cache,
    Replica,
    Stale,
    Authoritative,
}

impl ReadSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadSource::Cache => "cache",
            ReadSource::Replica => "replica",
            ReadSource::Stale => "stale",
            ReadSource::Authoritative => "authoritative",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheRead {
    pub state: ContractState,
    pub sort_key: Option<String>,
    pub source: ReadSource,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: ReplicaSnapshot,
    fetched_at: Instant,
}

pub struct ConsistencyCache {
    replica: Arc<dyn ReplicaClient>,
    ledger: Arc<dyn LedgerClient>,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl std::fmt::Debug for ConsistencyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyCache").finish_non_exhaustive()
    }
}

impl ConsistencyCache {
    pub fn new(replica: Arc<dyn ReplicaClient>, ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            replica,
            ledger,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn read(
        &self,
        key: &str,
        max_age: Duration,
        force_refresh: bool,
    ) -> Result<CacheRead, CacheError> {
        let cached = self.entries.read().await.get(key).cloned();

        if !force_refresh {
            if let Some(entry) = &cached {
                if entry.fetched_at.elapsed() < max_age {
                    return Ok(self.served(entry, ReadSource::Cache));
                }
            }
        }

        match self.replica.fetch(key).await {
            Ok(snapshot) => {
                let entry = CacheEntry {
                    snapshot,
                    fetched_at: Instant::now(),
                };
                let read = self.served(&entry, ReadSource::Replica);
                self.entries.write().await.insert(key.to_string(), entry);
                Ok(read)
            }
            Err(e) => {
                warn!(contract = %key, error = %e, "read replica refresh failed");
                if let Some(entry) = &cached {
                    return Ok(self.served(entry, ReadSource::Stale));
                }
                self.authoritative(key).await
            }
        }
    }

    /// Reads `key` until `select` finds its value, force-refreshing up to
    /// `max_polls` times, then falls back to the authoritative state.
    pub async fn read_with_poll<T, F>(
        &self,
        key: &str,
        select: F,
        max_age: Duration,
        poll_interval: Duration,
        max_polls: u32,
    ) -> Result<Option<T>, CacheError>
    where
        F: Fn(&ContractState) -> Option<T> + Send + Sync,
        T: Send,
    {
        let first = self.read(key, max_age, false).await?;
        if let Some(v) = select(&first.state) {
            return Ok(Some(v));
        }
        for poll in 1..=max_polls {
            tokio::time::sleep(poll_interval).await;
            let read = self.read(key, max_age, true).await?;
            if let Some(v) = select(&read.state) {
                debug!(contract = %key, poll, "value appeared after polling");
                return Ok(Some(v));
            }
        }
        let read = self.authoritative(key).await?;
        Ok(select(&read.state))
    }

    /// `previousDistributions[stamp]` of the distribution contract.
    pub async fn read_distribution_summary(
        &self,
        key: &str,
        stamp: Stamp,
        max_age: Duration,
        poll_interval: Duration,
        max_polls: u32,
    ) -> Result<Option<DistributionSummary>, CacheError> {
        self.read_with_poll(
            key,
            |st| st.previous_distributions.get(&stamp).cloned(),
            max_age,
            poll_interval,
            max_polls,
        )
        .await
    }

    async fn authoritative(&self, key: &str) -> Result<CacheRead, CacheError> {
        match self.ledger.read_state(key).await {
            Ok(state) => {
                CACHE_READS_TOTAL
                    .with_label_values(&[ReadSource::Authoritative.as_str()])
                    .inc();
                Ok(CacheRead {
                    state,
                    sort_key: None,
                    source: ReadSource::Authoritative,
                })
            }
            Err(e) => {
                warn!(contract = %key, error = %e, "authoritative ledger read failed");
                Err(CacheError::Unavailable(e.to_string()))
            }
        }
    }

    fn served(&self, entry: &CacheEntry, source: ReadSource) -> CacheRead {
        CACHE_READS_TOTAL.with_label_values(&[source.as_str()]).inc();
        CacheRead {
            state: entry.snapshot.state.clone(),
            sort_key: Some(entry.snapshot.sort_key.clone()),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ledger_contract::mock_client::{
        MockLedger, MockReplica, DEFAULT_DISTRIBUTION_CONTRACT, DEFAULT_REGISTRY_CONTRACT,
    };

    fn setup() -> (Arc<MockLedger>, Arc<MockReplica>, ConsistencyCache) {
        let ledger = Arc::new(MockLedger::default());
        let replica = Arc::new(MockReplica::new(ledger.clone()));
        let cache = ConsistencyCache::new(replica.clone(), ledger.clone());
        (ledger, replica, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_snapshot_skips_fetch_and_stale_one_refreshes() {
        let (_ledger, replica, cache) = setup();
        let max_age = Duration::from_millis(2_500);

        let r = cache.read(DEFAULT_REGISTRY_CONTRACT, max_age, false).await.unwrap();
        assert_eq!(r.source, ReadSource::Replica);
        assert_eq!(replica.fetches(), 1);

        tokio::time::advance(Duration::from_millis(2_499)).await;
        let r = cache.read(DEFAULT_REGISTRY_CONTRACT, max_age, false).await.unwrap();
        assert_eq!(r.source, ReadSource::Cache);
        assert_eq!(replica.fetches(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        let r = cache.read(DEFAULT_REGISTRY_CONTRACT, max_age, false).await.unwrap();
        assert_eq!(r.source, ReadSource::Replica);
        assert_eq!(replica.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replica_failure_serves_stale_then_falls_back_to_ledger() {
        let (ledger, replica, cache) = setup();
        cache
            .read(DEFAULT_REGISTRY_CONTRACT, Duration::ZERO, false)
            .await
            .unwrap();
        replica.set_down(true);
        ledger.seed_claimable("AA", "0x01");

        let r = cache.read(DEFAULT_REGISTRY_CONTRACT, Duration::ZERO, false).await.unwrap();
        assert_eq!(r.source, ReadSource::Stale);
        assert!(r.state.claimable.is_empty());

        let r = cache.read(DEFAULT_DISTRIBUTION_CONTRACT, Duration::ZERO, false).await.unwrap();
        assert_eq!(r.source, ReadSource::Authoritative);
        // the authoritative value is not cached as a snapshot
        let r = cache.read(DEFAULT_DISTRIBUTION_CONTRACT, Duration::from_secs(60), false).await.unwrap();
        assert_eq!(r.source, ReadSource::Authoritative);
    }

    #[tokio::test(start_paused = true)]
    async fn authoritative_failure_is_unavailable_not_absent() {
        let (ledger, replica, cache) = setup();
        replica.set_down(true);
        ledger.fail_reads(1);
        let err = cache
            .read(DEFAULT_REGISTRY_CONTRACT, Duration::ZERO, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_finds_summary_once_replica_catches_up() {
        use relay_core::ledger_contract::LedgerClient;
        use relay_core::Score;

        let (ledger, replica, cache) = setup();
        ledger
            .add_scores(
                9,
                &[Score {
                    address: "0x01".into(),
                    fingerprint: "AA".into(),
                    value: 1,
                }],
            )
            .await
            .unwrap();
        replica.lag_for(2);
        ledger.distribute(9).await.unwrap();

        let summary = cache
            .read_distribution_summary(
                DEFAULT_DISTRIBUTION_CONTRACT,
                9,
                DISTRIBUTION_MAX_AGE,
                Duration::from_secs(1),
                5,
            )
            .await
            .unwrap();
        assert_eq!(summary.map(|s| s.relay_count), Some(1));
        assert_eq!(replica.fetches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_exhaustion_falls_back_and_reports_absent() {
        let (ledger, replica, cache) = setup();
        let found = cache
            .read_distribution_summary(
                DEFAULT_DISTRIBUTION_CONTRACT,
                42,
                DISTRIBUTION_MAX_AGE,
                Duration::from_secs(1),
                2,
            )
            .await
            .unwrap();
        assert_eq!(found, None);
        assert_eq!(replica.fetches(), 3);
        assert_eq!(ledger.calls().read_state, 1);
    }
}
