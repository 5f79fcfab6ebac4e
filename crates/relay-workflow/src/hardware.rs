//! Attestation pipeline for relays that carry a hardware proof.
//!
//! Steps run in order and stop at the first failure:
//! 1. serial and NFT uniqueness against the verified-hardware store,
//! 2. sale registry lookup of the expected NFT id,
//! 3. NFT ownership by the claiming address,
//! 4. signature check,
//! 5. atomic record of the proof under all three uniqueness keys.
//!
//! Every failure is appended to the hardware failure log.

use std::sync::Arc;

use relay_core::attestation;
use relay_core::ledger_contract::SaleRegistry;
use relay_core::{now_ms, ValidatedRelay};
use relay_storage::{HardwareFailure, HardwareStore, RecordOutcome, VerifiedHardwareRecord};
use tracing::{info, warn};

use crate::metrics::ATTESTATION_FAILURES_TOTAL;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareOutcome {
    Verified,
    Rejected(String),
}

pub struct HardwareVerifier {
    store: HardwareStore,
    registry: Arc<dyn SaleRegistry>,
}

impl std::fmt::Debug for HardwareVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareVerifier").finish_non_exhaustive()
    }
}

impl HardwareVerifier {
    pub fn new(store: HardwareStore, registry: Arc<dyn SaleRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &HardwareStore {
        &self.store
    }

    pub async fn verify(&self, relay: &ValidatedRelay) -> HardwareOutcome {
        match self.run(relay).await {
            Ok(()) => HardwareOutcome::Verified,
            Err(reason) => {
                self.log_failure(relay, reason);
                HardwareOutcome::Rejected(reason.to_string())
            }
        }
    }

    async fn run(&self, relay: &ValidatedRelay) -> Result<(), &'static str> {
        let Some(hw) = relay.hardware.as_ref() else {
            return Err("missing_hardware_proof");
        };

        // a relay whose claim write failed after recording may present the proof again
        let recorded = match self.store.get_by_device_serial(&hw.device_serial) {
            Ok(prior) => prior.is_some_and(|r| {
                r.is_same_proof(&relay.fingerprint, &hw.device_serial, &hw.atec_serial, hw.nft_id)
            }),
            Err(e) => {
                warn!(fingerprint = %relay.fingerprint, error = %e, "uniqueness lookup failed");
                return Err("storage_error");
            }
        };

        if !recorded {
            match self
                .store
                .find_conflict(&hw.device_serial, &hw.atec_serial, hw.nft_id)
            {
                Ok(None) => {}
                Ok(Some(conflict)) => return Err(conflict.reason()),
                Err(e) => {
                    warn!(fingerprint = %relay.fingerprint, error = %e, "uniqueness lookup failed");
                    return Err("storage_error");
                }
            }
        }

        match self.registry.expected_nft_id(&hw.device_serial).await {
            Ok(Some(expected)) if expected == hw.nft_id => {}
            Ok(Some(_)) => return Err("nft_id_mismatch"),
            Ok(None) => return Err("device_not_sold"),
            Err(e) => {
                warn!(fingerprint = %relay.fingerprint, error = %e, "sale registry lookup failed");
                return Err("registry_unavailable");
            }
        }

        match self.registry.owns_nft(&relay.address, hw.nft_id).await {
            Ok(true) => {}
            Ok(false) => return Err("nft_not_owned"),
            Err(e) => {
                warn!(fingerprint = %relay.fingerprint, error = %e, "ownership lookup failed");
                return Err("registry_unavailable");
            }
        }

        let proof = relay
            .attestation_proof()
            .ok_or("missing_hardware_proof")?;
        attestation::check(&proof).map_err(|r| r.reason())?;

        if recorded {
            info!(fingerprint = %relay.fingerprint, nft_id = hw.nft_id, "hardware already verified");
            return Ok(());
        }

        let record = VerifiedHardwareRecord {
            fingerprint: relay.fingerprint.clone(),
            address: relay.address.clone(),
            node_id: hw.node_id.clone(),
            nft_id: hw.nft_id,
            device_serial: hw.device_serial.clone(),
            atec_serial: hw.atec_serial.clone(),
            verified_at_ms: now_ms(),
        };
        match self.store.record_verified(&record) {
            Ok(RecordOutcome::Recorded) => {
                info!(
                    fingerprint = %relay.fingerprint,
                    nft_id = hw.nft_id,
                    "hardware verified"
                );
                Ok(())
            }
            Ok(RecordOutcome::Conflict(conflict)) => Err(conflict.reason()),
            Err(e) => {
                warn!(fingerprint = %relay.fingerprint, error = %e, "recording verified hardware failed");
                Err("storage_error")
            }
        }
    }

    fn log_failure(&self, relay: &ValidatedRelay, reason: &str) {
        ATTESTATION_FAILURES_TOTAL.with_label_values(&[reason]).inc();
        let hw = relay.hardware.as_ref();
        let entry = HardwareFailure {
            seq: 0,
            fingerprint: relay.fingerprint.clone(),
            address: relay.address.clone(),
            device_serial: hw.map(|h| h.device_serial.clone()),
            atec_serial: hw.map(|h| h.atec_serial.clone()),
            nft_id: hw.map(|h| h.nft_id),
            reason: reason.to_string(),
            at_ms: now_ms(),
        };
        match self.store.log_failure(entry) {
            Ok(seq) => warn!(fingerprint = %relay.fingerprint, reason, seq, "hardware proof rejected"),
            Err(e) => warn!(
                fingerprint = %relay.fingerprint,
                reason,
                error = %e,
                "hardware proof rejected; failure log write failed"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use relay_core::{HardwareProof, ValidatedRelay};

    pub const FINGERPRINT: &str = "89A5EF566C85E88391886220F7439DEDD967EF62";
    pub const ADDRESS: &str = "0x6d454e61876334ee2ca473e3b4b66777c931886e";
    pub const DEVICE_SERIAL: &str = "c2eeef8a42a50073";
    pub const PUBLIC_KEY: &str = "8ac7f77ca08a2402424608694e76cf9a126351cf62b27204c96b0d5d71887634240bf6a034d08c54dd7ea66c46cec9b97bf9861931bd3e69c2eac899551a66cb";
    pub const SIGNATURE: &str = "f9fd49a43376f7dae87c2c95f14553feec317e93967db97bdcf7b5232616d551167555f90173bf6178f7e8a2aa71834932dbcdff26f0ae26b88c00cb0d09f174";

    /// The known-good signed relay (nft id 0).
    pub fn attested_relay() -> ValidatedRelay {
        ValidatedRelay {
            fingerprint: FINGERPRINT.to_string(),
            address: ADDRESS.to_string(),
            family: Vec::new(),
            hardware: Some(HardwareProof {
                node_id: "relay".to_string(),
                nft_id: 0,
                device_serial: DEVICE_SERIAL.to_string(),
                atec_serial: "01237da6e721dcce01".to_string(),
                public_key: PUBLIC_KEY.to_string(),
                signature: SIGNATURE.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use relay_core::ledger_contract::mock_client::MockSaleRegistry;

    fn setup() -> (Arc<MockSaleRegistry>, HardwareVerifier) {
        let registry = Arc::new(MockSaleRegistry::new());
        registry.register_sale(DEVICE_SERIAL, 0);
        registry.set_owner(0, ADDRESS);
        let store = HardwareStore::open_temporary().expect("store");
        (registry.clone(), HardwareVerifier::new(store, registry))
    }

    #[tokio::test]
    async fn valid_proof_is_recorded() {
        let (_registry, verifier) = setup();
        assert_eq!(
            verifier.verify(&attested_relay()).await,
            HardwareOutcome::Verified
        );
        assert!(verifier.store().is_device_serial_used(DEVICE_SERIAL).unwrap());
        assert!(verifier.store().list_failures(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn the_same_relay_can_present_its_proof_again() {
        let (_registry, verifier) = setup();
        assert_eq!(
            verifier.verify(&attested_relay()).await,
            HardwareOutcome::Verified
        );
        assert_eq!(
            verifier.verify(&attested_relay()).await,
            HardwareOutcome::Verified
        );
        assert!(verifier.store().list_failures(10).unwrap().is_empty());
        let record = verifier
            .store()
            .get_by_device_serial(DEVICE_SERIAL)
            .unwrap()
            .unwrap();
        assert_eq!(record.fingerprint, FINGERPRINT);
    }

    #[tokio::test]
    async fn second_use_of_the_device_is_rejected_and_logged() {
        let (_registry, verifier) = setup();
        verifier.verify(&attested_relay()).await;
        let mut again = attested_relay();
        again.fingerprint = "0".repeat(40);
        assert_eq!(
            verifier.verify(&again).await,
            HardwareOutcome::Rejected("device_serial_in_use".to_string())
        );
        let failures = verifier.store().list_failures(10).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reason, "device_serial_in_use");
        assert_eq!(failures[0].nft_id, Some(0));
    }

    #[tokio::test]
    async fn registry_checks_run_before_the_signature() {
        let (registry, verifier) = setup();
        registry.set_owner(0, "0x0000000000000000000000000000000000000001");
        assert_eq!(
            verifier.verify(&attested_relay()).await,
            HardwareOutcome::Rejected("nft_not_owned".to_string())
        );

        registry.register_sale(DEVICE_SERIAL, 5);
        assert_eq!(
            verifier.verify(&attested_relay()).await,
            HardwareOutcome::Rejected("nft_id_mismatch".to_string())
        );

        registry.set_down(true);
        assert_eq!(
            verifier.verify(&attested_relay()).await,
            HardwareOutcome::Rejected("registry_unavailable".to_string())
        );
        assert!(!verifier.store().is_device_serial_used(DEVICE_SERIAL).unwrap());
    }

    #[tokio::test]
    async fn bad_signature_consumes_no_uniqueness() {
        let (_registry, verifier) = setup();
        let mut relay = attested_relay();
        if let Some(hw) = relay.hardware.as_mut() {
            hw.signature.replace_range(0..1, "0");
        }
        assert_eq!(
            verifier.verify(&relay).await,
            HardwareOutcome::Rejected("signature_mismatch".to_string())
        );
        assert!(!verifier.store().is_nft_id_used(0).unwrap());
    }
}
