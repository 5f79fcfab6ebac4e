//! Builds the workflow services from configuration.

use std::sync::Arc;

use relay_core::ledger_contract::mock_client::{
    MockDurableStore, MockLedger, MockReplica, MockSaleRegistry, DEFAULT_DISTRIBUTION_CONTRACT,
    DEFAULT_REGISTRY_CONTRACT,
};
use relay_core::ledger_contract::{DurableStore, LedgerClient, ReplicaClient, SaleRegistry};
use relay_storage::WorkflowStorage;
use relay_workflow::{ClaimGate, ConsistencyCache, DistributionCoordinator, HardwareVerifier};

use crate::config::RelayNodeConfig;

#[derive(Debug, Clone, Copy, clap::ValueEnum, PartialEq, Eq)]
pub enum LedgerMode {
    Mock,
    Http,
}

/// The external services and the contracts the workflows address.
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerClient>,
    pub replica: Arc<dyn ReplicaClient>,
    pub registry: Arc<dyn SaleRegistry>,
    pub durable: Arc<dyn DurableStore>,
    pub distribution_contract: String,
    pub registry_contract: String,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("distribution_contract", &self.distribution_contract)
            .field("registry_contract", &self.registry_contract)
            .finish_non_exhaustive()
    }
}

fn or_default(v: &str, default: &str) -> String {
    if v.trim().is_empty() {
        default.to_string()
    } else {
        v.to_string()
    }
}

impl Collaborators {
    /// Offline in-memory collaborators; state lives only as long as the process.
    ///
    /// The sale registry knows only the sales listed in `registry.mock_sales`;
    /// hardware proofs for any other device are rejected as `device_not_sold`.
    pub fn mock(cfg: &RelayNodeConfig) -> Self {
        let distribution_contract =
            or_default(&cfg.ledger.distribution_contract, DEFAULT_DISTRIBUTION_CONTRACT);
        let registry_contract = or_default(&cfg.ledger.registry_contract, DEFAULT_REGISTRY_CONTRACT);
        let ledger = Arc::new(MockLedger::new(
            distribution_contract.clone(),
            registry_contract.clone(),
        ));
        let registry = Arc::new(MockSaleRegistry::new());
        for sale in &cfg.registry.mock_sales {
            registry.register_sale(&sale.device_serial, sale.nft_id);
            registry.set_owner(sale.nft_id, &sale.owner);
        }
        Self {
            replica: Arc::new(MockReplica::new(ledger.clone())),
            ledger,
            registry,
            durable: Arc::new(MockDurableStore::new()),
            distribution_contract,
            registry_contract,
        }
    }

    #[cfg(feature = "ledger-http")]
    pub fn http(cfg: &RelayNodeConfig) -> Result<Self, String> {
        use relay_core::ledger_contract::http_client::{
            DurableStoreConfig, HttpDurableStore, HttpLedgerClient, HttpReplicaClient,
            HttpSaleRegistry, LedgerEndpointMap, LedgerRpcConfig, ReplicaConfig,
            SaleRegistryConfig,
        };

        cfg.validate_for_mode_http()?;
        let ledger = HttpLedgerClient::new(LedgerRpcConfig {
            base_url: cfg.ledger.base_url.clone(),
            operator_key: cfg.ledger.operator_key.clone(),
            distribution_contract: cfg.ledger.distribution_contract.clone(),
            registry_contract: cfg.ledger.registry_contract.clone(),
            endpoints: LedgerEndpointMap {
                read_state: cfg.ledger.read_state_path.clone(),
                interact: cfg.ledger.interact_path.clone(),
            },
            timeout_ms: cfg.ledger.timeout_ms,
        })
        .map_err(|e| e.to_string())?;
        let replica = HttpReplicaClient::new(ReplicaConfig {
            base_url: cfg.replica.base_url.clone(),
            state_path: cfg.replica.state_path.clone(),
            timeout_ms: cfg.replica.timeout_ms,
        })
        .map_err(|e| e.to_string())?;
        let registry = HttpSaleRegistry::new(SaleRegistryConfig {
            base_url: cfg.registry.base_url.clone(),
            sale_path: cfg.registry.sale_path.clone(),
            owner_path: cfg.registry.owner_path.clone(),
            timeout_ms: cfg.registry.timeout_ms,
        })
        .map_err(|e| e.to_string())?;
        let durable = HttpDurableStore::new(DurableStoreConfig {
            base_url: cfg.durable.base_url.clone(),
            upload_path: cfg.durable.upload_path.clone(),
            api_key: cfg.durable.api_key.clone(),
            timeout_ms: cfg.durable.timeout_ms,
        })
        .map_err(|e| e.to_string())?;

        Ok(Self {
            ledger: Arc::new(ledger),
            replica: Arc::new(replica),
            registry: Arc::new(registry),
            durable: Arc::new(durable),
            distribution_contract: cfg.ledger.distribution_contract.clone(),
            registry_contract: cfg.ledger.registry_contract.clone(),
        })
    }

    #[cfg(not(feature = "ledger-http"))]
    pub fn http(_cfg: &RelayNodeConfig) -> Result<Self, String> {
        Err("--ledger-mode http requires building with --features ledger-http".to_string())
    }

    pub fn for_mode(mode: LedgerMode, cfg: &RelayNodeConfig) -> Result<Self, String> {
        match mode {
            LedgerMode::Mock => Ok(Self::mock(cfg)),
            LedgerMode::Http => Self::http(cfg),
        }
    }
}

/// Workflow services sharing one cache and one storage handle.
pub struct Services {
    pub storage: WorkflowStorage,
    pub coordinator: Arc<DistributionCoordinator>,
    pub claim_gate: Arc<ClaimGate>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

pub fn build_services(
    cfg: &RelayNodeConfig,
    collab: &Collaborators,
    storage: WorkflowStorage,
) -> Services {
    let cache = Arc::new(ConsistencyCache::new(
        collab.replica.clone(),
        collab.ledger.clone(),
    ));
    let coordinator = DistributionCoordinator::new(
        cfg.distribution
            .coordinator_config(&collab.distribution_contract),
        storage.epochs.clone(),
        collab.ledger.clone(),
        cache.clone(),
        collab.durable.clone(),
        cfg.distribution.pacing.build(),
    );
    let claim_gate = ClaimGate::new(
        cfg.claims.claim_gate_config(&collab.registry_contract),
        cache,
        collab.ledger.clone(),
        cfg.claims.pacing.build(),
        HardwareVerifier::new(storage.hardware.clone(), collab.registry.clone()),
    );
    Services {
        storage,
        coordinator: Arc::new(coordinator),
        claim_gate: Arc::new(claim_gate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use relay_core::{ClaimResult, ValidatedRelay};

    #[test]
    fn mock_collaborators_fall_back_to_default_contracts() {
        let cfg = parse_config("[ledger]\nregistry_contract = \"reg-1\"\n").unwrap();
        let collab = Collaborators::mock(&cfg);
        assert_eq!(collab.distribution_contract, DEFAULT_DISTRIBUTION_CONTRACT);
        assert_eq!(collab.registry_contract, "reg-1");
    }

    #[cfg(not(feature = "ledger-http"))]
    #[test]
    fn http_mode_needs_the_feature() {
        let err = Collaborators::for_mode(LedgerMode::Http, &RelayNodeConfig::default()).unwrap_err();
        assert!(err.contains("ledger-http"));
    }

    #[tokio::test]
    async fn services_share_the_mock_registry_contract() {
        let cfg = parse_config(
            r#"
[claims]
pacing = { mode = "fixed", delay_ms = 0 }
"#,
        )
        .unwrap();
        let collab = Collaborators::mock(&cfg);
        let services = build_services(&cfg, &collab, WorkflowStorage::open_temporary().unwrap());
        let relay = ValidatedRelay::plain("A".repeat(40), format!("0x{}", "1".repeat(40)));
        let outcome = services.claim_gate.process(&[relay]).await;
        assert_eq!(outcome.claims[0].result, ClaimResult::Ok);
        assert_eq!(outcome.families[0].result, ClaimResult::AlreadySetFamily);
    }

    #[tokio::test]
    async fn mock_registry_is_seeded_from_config() {
        let cfg = parse_config(
            r#"
[[registry.mock_sales]]
device_serial = "C2EEEF8A42A50073"
nft_id = 3
owner = "0x6D454E61876334EE2CA473E3B4B66777C931886E"
"#,
        )
        .unwrap();
        let collab = Collaborators::mock(&cfg);
        assert_eq!(
            collab.registry.expected_nft_id("c2eeef8a42a50073").await.unwrap(),
            Some(3)
        );
        assert!(collab
            .registry
            .owns_nft("0x6d454e61876334ee2ca473e3b4b66777c931886e", 3)
            .await
            .unwrap());
        assert_eq!(
            Collaborators::mock(&RelayNodeConfig::default())
                .registry
                .expected_nft_id("c2eeef8a42a50073")
                .await
                .unwrap(),
            None
        );
    }
}
