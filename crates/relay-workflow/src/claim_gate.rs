//! Claim gate: decides which validated relays become claimable and keeps
//! declared families in sync with the registry contract.
//!
//! Nothing here returns an error to the caller. Every relay receives exactly
//! one decision per workflow, in input order.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relay_core::ledger_contract::{LedgerClient, LedgerClientError, LedgerTxId};
use relay_core::{
    is_valid_address, is_valid_fingerprint, plan, ClaimDecision, ClaimResult, ClaimableRelay,
    FamilyUpdate, ValidatedRelay, FAMILY_BATCH_SIZE, MAX_BATCH_SIZE,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cache::{ConsistencyCache, REGISTRY_MAX_AGE};
use crate::hardware::{HardwareOutcome, HardwareVerifier};
use crate::metrics::{CLAIM_DECISIONS_TOTAL, LEDGER_WRITES_TOTAL};
use crate::pacing::Pacer;

/// What happens to the rest of an invocation when one batch write fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    /// The failing batch and every later batch are decided `Failed`.
    #[default]
    AbortRemaining,
    /// Only the failing batch is decided `Failed`; later batches are still written.
    FailBatchOnly,
}

#[derive(Debug, Clone)]
pub struct ClaimGateConfig {
    pub registry_contract: String,
    pub max_age: Duration,
    pub batch_size: usize,
    pub family_batch_size: usize,
    pub failure_policy: BatchFailurePolicy,
}

impl Default for ClaimGateConfig {
    fn default() -> Self {
        Self {
            registry_contract: String::new(),
            max_age: REGISTRY_MAX_AGE,
            batch_size: MAX_BATCH_SIZE,
            family_batch_size: FAMILY_BATCH_SIZE,
            failure_policy: BatchFailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOutcome {
    pub claims: Vec<ClaimDecision>,
    pub families: Vec<ClaimDecision>,
}

pub struct ClaimGate {
    config: ClaimGateConfig,
    cache: Arc<ConsistencyCache>,
    ledger: Arc<dyn LedgerClient>,
    pacer: Arc<dyn Pacer>,
    hardware: HardwareVerifier,
}

impl std::fmt::Debug for ClaimGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ClaimGate {
    pub fn new(
        config: ClaimGateConfig,
        cache: Arc<ConsistencyCache>,
        ledger: Arc<dyn LedgerClient>,
        pacer: Arc<dyn Pacer>,
        hardware: HardwareVerifier,
    ) -> Self {
        Self {
            config,
            cache,
            ledger,
            pacer,
            hardware,
        }
    }

    /// Runs claim evaluation and family reconciliation concurrently.
    pub async fn process(&self, relays: &[ValidatedRelay]) -> ClaimOutcome {
        let (claims, families) = tokio::join!(self.evaluate(relays), self.reconcile_families(relays));
        ClaimOutcome { claims, families }
    }

    pub async fn evaluate(&self, relays: &[ValidatedRelay]) -> Vec<ClaimDecision> {
        let Some(state) = self.registry_state("claims").await else {
            return finish("claims", relays, vec![Some(ClaimResult::Failed); relays.len()]);
        };

        let mut decided: Vec<Option<ClaimResult>> = vec![None; relays.len()];
        let mut eligible: Vec<(usize, ClaimableRelay)> = Vec::new();

        for (idx, relay) in relays.iter().enumerate() {
            if !is_valid_fingerprint(&relay.fingerprint) || !is_valid_address(&relay.address) {
                debug!(fingerprint = %relay.fingerprint, "malformed relay identity");
                decided[idx] = Some(ClaimResult::Failed);
            } else if state.claimable.contains_key(&relay.fingerprint) {
                decided[idx] = Some(ClaimResult::AlreadyRegistered);
            } else if state.verified.contains_key(&relay.fingerprint) {
                decided[idx] = Some(ClaimResult::AlreadyVerified);
            } else if relay.hardware.is_none() {
                eligible.push((idx, claimable(relay, false)));
            } else {
                match self.hardware.verify(relay).await {
                    HardwareOutcome::Verified => eligible.push((idx, claimable(relay, true))),
                    HardwareOutcome::Rejected(_) => {
                        decided[idx] = Some(ClaimResult::HardwareProofFailed)
                    }
                }
            }
        }

        let ledger = self.ledger.clone();
        let written = self
            .write_batches("addClaimableBatched", eligible, self.config.batch_size, move |batch| {
                let ledger = ledger.clone();
                async move { ledger.add_claimable_batched(&batch).await }
            })
            .await;
        for (idx, result) in written {
            decided[idx] = Some(result);
        }

        finish("claims", relays, decided)
    }

    pub async fn reconcile_families(&self, relays: &[ValidatedRelay]) -> Vec<ClaimDecision> {
        let Some(state) = self.registry_state("families").await else {
            return finish("families", relays, vec![Some(ClaimResult::Failed); relays.len()]);
        };

        let mut decided: Vec<Option<ClaimResult>> = vec![None; relays.len()];
        let mut changed: Vec<(usize, FamilyUpdate)> = Vec::new();

        for (idx, relay) in relays.iter().enumerate() {
            if !is_valid_fingerprint(&relay.fingerprint) {
                decided[idx] = Some(ClaimResult::Failed);
                continue;
            }
            let current: BTreeSet<&String> = state
                .families
                .get(&relay.fingerprint)
                .map(|f| f.iter().collect())
                .unwrap_or_default();
            let incoming: BTreeSet<&String> = relay.family.iter().collect();
            let add: Vec<String> = incoming.difference(&current).map(|s| (*s).clone()).collect();
            let remove: Vec<String> = current.difference(&incoming).map(|s| (*s).clone()).collect();
            if add.is_empty() && remove.is_empty() {
                decided[idx] = Some(ClaimResult::AlreadySetFamily);
            } else {
                changed.push((
                    idx,
                    FamilyUpdate {
                        fingerprint: relay.fingerprint.clone(),
                        add,
                        remove,
                    },
                ));
            }
        }

        let ledger = self.ledger.clone();
        let written = self
            .write_batches("setFamilies", changed, self.config.family_batch_size, move |batch| {
                let ledger = ledger.clone();
                async move { ledger.set_families(&batch).await }
            })
            .await;
        for (idx, result) in written {
            decided[idx] = Some(result);
        }

        finish("families", relays, decided)
    }

    async fn registry_state(&self, workflow: &str) -> Option<relay_core::ContractState> {
        if self.config.registry_contract.is_empty() {
            error!(workflow, "registry contract is not configured");
            return None;
        }
        match self
            .cache
            .read(&self.config.registry_contract, self.config.max_age, false)
            .await
        {
            Ok(read) => Some(read.state),
            Err(e) => {
                warn!(workflow, error = %e, "registry state unavailable");
                None
            }
        }
    }

    /// Paced batched writes under the configured failure policy.
    ///
    /// A configuration error always stops the remaining batches.
    async fn write_batches<T, F, Fut>(
        &self,
        method: &'static str,
        items: Vec<(usize, T)>,
        batch_size: usize,
        write: F,
    ) -> Vec<(usize, ClaimResult)>
    where
        T: Clone,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<LedgerTxId, LedgerClientError>>,
    {
        let mut out = Vec::with_capacity(items.len());
        if items.is_empty() {
            return out;
        }
        if let Err(e) = self.ledger.ensure_writable() {
            LEDGER_WRITES_TOTAL.with_label_values(&[method, e.kind()]).inc();
            error!(method, error = %e, "ledger is not configured");
            out.extend(items.iter().map(|(idx, _)| (*idx, ClaimResult::Failed)));
            return out;
        }
        let mut aborted = false;
        for (batch_index, batch) in plan(&items, batch_size).into_iter().enumerate() {
            if aborted {
                out.extend(batch.iter().map(|(idx, _)| (*idx, ClaimResult::Failed)));
                continue;
            }
            self.pacer.pace().await;
            let payload: Vec<T> = batch.iter().map(|(_, item)| item.clone()).collect();
            match write(payload).await {
                Ok(tx) => {
                    LEDGER_WRITES_TOTAL.with_label_values(&[method, "ok"]).inc();
                    info!(method, batch_index, size = batch.len(), tx = %tx.0, "batch written");
                    out.extend(batch.iter().map(|(idx, _)| (*idx, ClaimResult::Ok)));
                }
                Err(e) => {
                    LEDGER_WRITES_TOTAL.with_label_values(&[method, e.kind()]).inc();
                    if e.is_config() {
                        error!(method, batch_index, error = %e, "ledger is not configured");
                    } else {
                        warn!(method, batch_index, error = %e, "batch write failed");
                    }
                    aborted = e.is_config()
                        || self.config.failure_policy == BatchFailurePolicy::AbortRemaining;
                    out.extend(batch.iter().map(|(idx, _)| (*idx, ClaimResult::Failed)));
                }
            }
        }
        out
    }
}

fn claimable(relay: &ValidatedRelay, hardware_verified: bool) -> ClaimableRelay {
    ClaimableRelay {
        fingerprint: relay.fingerprint.clone(),
        address: relay.address.clone(),
        hardware_verified,
    }
}

fn finish(
    workflow: &str,
    relays: &[ValidatedRelay],
    decided: Vec<Option<ClaimResult>>,
) -> Vec<ClaimDecision> {
    relays
        .iter()
        .zip(decided)
        .map(|(relay, result)| {
            let result = result.unwrap_or(ClaimResult::Failed);
            CLAIM_DECISIONS_TOTAL
                .with_label_values(&[workflow, result.as_str()])
                .inc();
            ClaimDecision::new(relay, result)
        })
        .collect()
}
