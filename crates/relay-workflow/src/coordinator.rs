//! Distribution epoch coordinator.
//!
//! Drives one stamp through submit, finalize and persist. Each phase is
//! executed as a job tree on the [`JobBroker`]; the coordinator itself only
//! moves the persisted [`EpochCheckpoint`] between phases and writes it at
//! every transition, so a restarted process resumes where the last one
//! stopped.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use relay_core::ledger_contract::{
    DurableStore, DurableStoreError, DurableTag, LedgerClient, LedgerClientError, LedgerTxId,
};
use relay_core::{
    now_ms, plan, DistributionSummary, EpochCheckpoint, EpochFailure, EpochPhase, EpochResult,
    Score, Stamp, MAX_BATCH_SIZE,
};
use relay_storage::{EpochStore, StorageError};
use tracing::{error, info, warn};

use crate::broker::{
    BrokerError, JobBroker, JobFailure, JobHandler, JobNode, JobOutput, JobPayload,
    DEFAULT_MAX_ATTEMPTS,
};
use crate::cache::{ConsistencyCache, DISTRIBUTION_MAX_AGE};
use crate::metrics::{
    EPOCHS_IN_FLIGHT, EPOCH_OUTCOMES_TOTAL, EPOCH_TRANSITIONS_TOTAL, LEDGER_WRITES_TOTAL,
};
use crate::pacing::Pacer;

const SCORES_QUEUE: &str = "distribution-scores";
const FINALIZE_QUEUE: &str = "distribution-finalize";
const PERSIST_QUEUE: &str = "distribution-persist";

pub const SUMMARY_PROTOCOL_TAG: &str = "relay-rewards";
pub const SUMMARY_ENTITY_TYPE: &str = "distribution/summary";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub distribution_contract: String,
    pub batch_size: usize,
    /// Shared by recovery generations and finalize retries.
    pub max_retries: u32,
    pub persist_retries: u32,
    pub summary_max_age: Duration,
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub job_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            distribution_contract: String::new(),
            batch_size: MAX_BATCH_SIZE,
            max_retries: 6,
            persist_retries: 3,
            summary_max_age: DISTRIBUTION_MAX_AGE,
            poll_interval: Duration::from_secs(1),
            max_polls: 5,
            job_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("epoch {0} is already running")]
    AlreadyRunning(Stamp),
    #[error("unexpected output from {0} job")]
    UnexpectedOutput(&'static str),
    #[error("epoch {0} stopped at a checkpoint boundary")]
    Stopped(Stamp),
}

/// Job handlers for the distribution workflow.
struct DistributionJobs {
    contract: String,
    ledger: Arc<dyn LedgerClient>,
    cache: Arc<ConsistencyCache>,
    durable: Arc<dyn DurableStore>,
    pacer: Arc<dyn Pacer>,
    summary_max_age: Duration,
    poll_interval: Duration,
    max_polls: u32,
}

fn ledger_failure(method: &str, e: &LedgerClientError) -> JobFailure {
    LEDGER_WRITES_TOTAL.with_label_values(&[method, e.kind()]).inc();
    if e.is_config() {
        JobFailure::Configuration {
            reason: e.to_string(),
        }
    } else {
        JobFailure::Transient {
            reason: e.to_string(),
        }
    }
}

impl DistributionJobs {
    /// Paces `write` unless the ledger can never accept it.
    async fn paced<F>(&self, write: F) -> Result<LedgerTxId, LedgerClientError>
    where
        F: Future<Output = Result<LedgerTxId, LedgerClientError>>,
    {
        self.ledger.ensure_writable()?;
        self.pacer.pace().await;
        write.await
    }
}

#[async_trait]
impl JobHandler for DistributionJobs {
    async fn handle(&self, payload: JobPayload, children: Vec<JobOutput>) -> JobOutput {
        match payload {
            JobPayload::AddScores {
                stamp,
                generation,
                batch_index,
                scores,
            } => {
                let fingerprints: Vec<String> =
                    scores.iter().map(|s| s.fingerprint.clone()).collect();
                let failure = match self.paced(self.ledger.add_scores(stamp, &scores)).await {
                    Ok(tx) => {
                        LEDGER_WRITES_TOTAL.with_label_values(&["addScores", "ok"]).inc();
                        info!(stamp, generation, batch_index, size = scores.len(), tx = %tx.0, "scores submitted");
                        None
                    }
                    Err(e) => {
                        warn!(stamp, generation, batch_index, error = %e, "score batch failed");
                        Some(ledger_failure("addScores", &e))
                    }
                };
                JobOutput::AddScores {
                    batch_index,
                    fingerprints,
                    failure,
                }
            }
            JobPayload::CollectScores { stamp, generation } => {
                let mut accepted = Vec::new();
                let mut failed = Vec::new();
                let mut configuration = None;
                for child in children {
                    let JobOutput::AddScores {
                        fingerprints,
                        failure,
                        ..
                    } = child
                    else {
                        error!(stamp, generation, "score collector received a foreign child output");
                        return JobOutput::Rejected {
                            reason: format!("collect_scores for stamp {stamp} got a non-score output"),
                        };
                    };
                    match failure {
                        None => accepted.extend(fingerprints),
                        Some(JobFailure::Configuration { reason }) => {
                            configuration.get_or_insert(reason);
                            failed.extend(fingerprints);
                        }
                        Some(JobFailure::Transient { .. }) => failed.extend(fingerprints),
                    }
                }
                JobOutput::CollectScores {
                    accepted,
                    failed,
                    configuration,
                }
            }
            JobPayload::Distribute { stamp } => {
                let failure = match self.paced(self.ledger.distribute(stamp)).await {
                    Ok(tx) => {
                        LEDGER_WRITES_TOTAL.with_label_values(&["distribute", "ok"]).inc();
                        info!(stamp, tx = %tx.0, "distribution finalized");
                        None
                    }
                    Err(e) => {
                        warn!(stamp, error = %e, "distribute failed");
                        Some(ledger_failure("distribute", &e))
                    }
                };
                JobOutput::Distribute { failure }
            }
            JobPayload::FetchSummary { stamp } => {
                let read = self
                    .cache
                    .read_distribution_summary(
                        &self.contract,
                        stamp,
                        self.summary_max_age,
                        self.poll_interval,
                        self.max_polls,
                    )
                    .await;
                match read {
                    Ok(Some(summary)) => JobOutput::FetchSummary {
                        summary: Some(summary),
                        failure: None,
                    },
                    Ok(None) => JobOutput::FetchSummary {
                        summary: None,
                        failure: Some(JobFailure::Transient {
                            reason: format!("no summary recorded for stamp {stamp}"),
                        }),
                    },
                    Err(e) => JobOutput::FetchSummary {
                        summary: None,
                        failure: Some(JobFailure::Transient {
                            reason: e.to_string(),
                        }),
                    },
                }
            }
            JobPayload::PersistSummary { summary } => {
                let payload = match serde_json::to_value(&summary) {
                    Ok(v) => v,
                    Err(e) => {
                        return JobOutput::PersistSummary {
                            reference: None,
                            failure: Some(JobFailure::Transient {
                                reason: e.to_string(),
                            }),
                        }
                    }
                };
                let tags = [
                    DurableTag::new("Protocol", SUMMARY_PROTOCOL_TAG),
                    DurableTag::new("Entity-Type", SUMMARY_ENTITY_TYPE),
                    DurableTag::new("Content-Type", "application/json"),
                    DurableTag::new("Stamp", summary.stamp.to_string()),
                ];
                match self.durable.upload(&payload, &tags).await {
                    Ok(reference) => JobOutput::PersistSummary {
                        reference: Some(reference),
                        failure: None,
                    },
                    Err(DurableStoreError::Config(reason)) => JobOutput::PersistSummary {
                        reference: None,
                        failure: Some(JobFailure::Configuration { reason }),
                    },
                    Err(e) => JobOutput::PersistSummary {
                        reference: None,
                        failure: Some(JobFailure::Transient {
                            reason: e.to_string(),
                        }),
                    },
                }
            }
        }
    }
}

/// Marks a stamp as driven by this process until dropped.
struct LiveStamp {
    live: Arc<Mutex<HashSet<Stamp>>>,
    stamp: Stamp,
}

impl Drop for LiveStamp {
    fn drop(&mut self) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.stamp);
        EPOCHS_IN_FLIGHT.dec();
    }
}

pub struct DistributionCoordinator {
    config: CoordinatorConfig,
    epochs: EpochStore,
    broker: JobBroker,
    live: Arc<Mutex<HashSet<Stamp>>>,
    stopping: AtomicBool,
}

impl std::fmt::Debug for DistributionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DistributionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        epochs: EpochStore,
        ledger: Arc<dyn LedgerClient>,
        cache: Arc<ConsistencyCache>,
        durable: Arc<dyn DurableStore>,
        pacer: Arc<dyn Pacer>,
    ) -> Self {
        let jobs = DistributionJobs {
            contract: config.distribution_contract.clone(),
            ledger,
            cache,
            durable,
            pacer,
            summary_max_age: config.summary_max_age,
            poll_interval: config.poll_interval,
            max_polls: config.max_polls,
        };
        let broker = JobBroker::new(Arc::new(jobs), config.job_attempts);
        Self {
            config,
            epochs,
            broker,
            live: Arc::new(Mutex::new(HashSet::new())),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn epochs(&self) -> &EpochStore {
        &self.epochs
    }

    /// Running epochs finish their current phase, save the checkpoint and
    /// return [`CoordinatorError::Stopped`]. Phases already in flight are
    /// never cancelled.
    pub fn stop_at_boundary(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn clear_stop(&self) {
        self.stopping.store(false, Ordering::SeqCst);
    }

    /// Runs the epoch for `stamp` to a terminal result.
    ///
    /// A stamp with a stored result returns it unchanged; a stamp with a
    /// checkpoint resumes it and `scores` is ignored.
    pub async fn start_epoch(
        &self,
        stamp: Stamp,
        scores: Vec<Score>,
    ) -> Result<EpochResult, CoordinatorError> {
        if let Some(result) = self.epochs.load_result(stamp)? {
            info!(stamp, outcome = result.outcome(), "epoch already finished");
            return Ok(result);
        }
        let _live = self
            .mark_live(stamp)
            .ok_or(CoordinatorError::AlreadyRunning(stamp))?;

        let cp = match self.epochs.load_checkpoint(stamp)? {
            Some(cp) => {
                info!(stamp, phase = cp.phase.as_str(), generation = cp.generation, "resuming epoch");
                cp
            }
            None => {
                let (cp, duplicates) =
                    EpochCheckpoint::start(stamp, scores, self.config.max_retries, now_ms());
                if !duplicates.is_empty() {
                    warn!(stamp, count = duplicates.len(), ?duplicates, "dropped duplicate scores");
                }
                info!(stamp, total = cp.epoch_total, "starting epoch");
                self.epochs.save_checkpoint(&cp)?;
                cp
            }
        };
        self.drive(cp).await
    }

    /// Drives every persisted checkpoint not already running here.
    pub async fn resume_in_flight(&self) -> Result<Vec<EpochResult>, CoordinatorError> {
        let mut out = Vec::new();
        for cp in self.epochs.list_checkpoints()? {
            let Some(_live) = self.mark_live(cp.stamp) else {
                continue;
            };
            info!(stamp = cp.stamp, phase = cp.phase.as_str(), "resuming in-flight epoch");
            out.push(self.drive(cp).await?);
        }
        Ok(out)
    }

    fn mark_live(&self, stamp: Stamp) -> Option<LiveStamp> {
        let inserted = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stamp);
        if !inserted {
            return None;
        }
        EPOCHS_IN_FLIGHT.inc();
        Some(LiveStamp {
            live: self.live.clone(),
            stamp,
        })
    }

    async fn drive(&self, mut cp: EpochCheckpoint) -> Result<EpochResult, CoordinatorError> {
        let stamp = cp.stamp;
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                info!(stamp, phase = cp.phase.as_str(), "stopping at checkpoint boundary");
                return Err(CoordinatorError::Stopped(stamp));
            }
            match cp.phase.clone() {
                EpochPhase::Submitting => {
                    let pending = cp.pending_scores();
                    if !pending.is_empty() {
                        let out = self.broker.run(self.submit_tree(&cp, pending)).await?;
                        let JobOutput::CollectScores {
                            accepted,
                            failed,
                            configuration,
                        } = out
                        else {
                            return Err(CoordinatorError::UnexpectedOutput("collect_scores"));
                        };
                        cp.absorb(accepted.iter().map(String::as_str));
                        if let Some(reason) = configuration {
                            cp.updated_at_ms = now_ms();
                            self.epochs.save_checkpoint(&cp)?;
                            return Ok(self.configuration_halt(&cp, reason));
                        }
                        if !failed.is_empty() {
                            warn!(stamp, generation = cp.generation, failed = failed.len(), "score batches failed");
                        }
                    }
                    let transition = if cp.recover(now_ms()) {
                        "recover"
                    } else {
                        "finalize"
                    };
                    EPOCH_TRANSITIONS_TOTAL.with_label_values(&[transition]).inc();
                    info!(
                        stamp,
                        generation = cp.generation,
                        processed = cp.processed.len(),
                        pending = cp.pending.len(),
                        retries_remaining = cp.retries_remaining,
                        transition,
                        "generation closed"
                    );
                    self.epochs.save_checkpoint(&cp)?;
                }
                EpochPhase::Finalizing => {
                    let node = JobNode::leaf(
                        format!("distribute-{stamp}"),
                        FINALIZE_QUEUE,
                        JobPayload::Distribute { stamp },
                    );
                    let JobOutput::Distribute { failure } = self.broker.run(node).await? else {
                        return Err(CoordinatorError::UnexpectedOutput("distribute"));
                    };
                    match failure {
                        None => {
                            cp.enter_persist(self.config.persist_retries, now_ms());
                            EPOCH_TRANSITIONS_TOTAL.with_label_values(&["persist"]).inc();
                            self.epochs.save_checkpoint(&cp)?;
                        }
                        Some(JobFailure::Configuration { reason }) => {
                            self.epochs.save_checkpoint(&cp)?;
                            return Ok(self.configuration_halt(&cp, reason));
                        }
                        Some(JobFailure::Transient { reason }) => {
                            if cp.retry_finalize(now_ms()) {
                                warn!(stamp, retries_remaining = cp.retries_remaining, %reason, "retrying finalize");
                                EPOCH_TRANSITIONS_TOTAL
                                    .with_label_values(&["retry_finalize"])
                                    .inc();
                                self.epochs.save_checkpoint(&cp)?;
                            } else {
                                error!(stamp, %reason, "finalize retries exhausted");
                                let result = EpochResult::from_checkpoint(
                                    &cp,
                                    false,
                                    None,
                                    None,
                                    Some(EpochFailure::FinalizeExhausted),
                                    now_ms(),
                                );
                                return self.conclude(result);
                            }
                        }
                    }
                }
                EpochPhase::Persisting {
                    summary,
                    retries_left,
                } => {
                    let (summary, failure) = match summary {
                        Some(s) => (Some(s), None),
                        None => self.fetch_summary(stamp).await?,
                    };
                    let failure = match (&summary, failure) {
                        (Some(s), None) => match self.upload_summary(s.clone()).await? {
                            Ok(reference) => {
                                info!(stamp, %reference, "summary persisted");
                                let result = EpochResult::from_checkpoint(
                                    &cp,
                                    true,
                                    summary.clone(),
                                    Some(reference),
                                    None,
                                    now_ms(),
                                );
                                return self.conclude(result);
                            }
                            Err(f) => f,
                        },
                        (_, Some(f)) => f,
                        (None, None) => JobFailure::Transient {
                            reason: "summary missing".to_string(),
                        },
                    };

                    if let JobFailure::Configuration { reason } = &failure {
                        error!(stamp, %reason, "durable store is not configured");
                        let result = EpochResult::from_checkpoint(
                            &cp,
                            true,
                            None,
                            None,
                            Some(EpochFailure::Configuration {
                                reason: reason.clone(),
                            }),
                            now_ms(),
                        );
                        return self.conclude(result);
                    }
                    if retries_left == 0 {
                        error!(stamp, reason = failure.reason(), "persist retries exhausted");
                        let result = EpochResult::from_checkpoint(
                            &cp,
                            true,
                            None,
                            None,
                            Some(EpochFailure::PersistExhausted),
                            now_ms(),
                        );
                        return self.conclude(result);
                    }
                    warn!(stamp, retries_left, reason = failure.reason(), "retrying persist");
                    cp.phase = EpochPhase::Persisting {
                        summary,
                        retries_left: retries_left - 1,
                    };
                    cp.updated_at_ms = now_ms();
                    EPOCH_TRANSITIONS_TOTAL.with_label_values(&["retry_persist"]).inc();
                    self.epochs.save_checkpoint(&cp)?;
                }
            }
        }
    }

    fn submit_tree(&self, cp: &EpochCheckpoint, pending: Vec<Score>) -> JobNode {
        let (stamp, generation) = (cp.stamp, cp.generation);
        let children = plan(&pending, self.config.batch_size)
            .into_iter()
            .enumerate()
            .map(|(batch_index, scores)| {
                JobNode::leaf(
                    format!("add-scores-{stamp}-g{generation}-b{batch_index}"),
                    SCORES_QUEUE,
                    JobPayload::AddScores {
                        stamp,
                        generation,
                        batch_index,
                        scores,
                    },
                )
            })
            .collect();
        JobNode::leaf(
            format!("collect-scores-{stamp}-g{generation}"),
            SCORES_QUEUE,
            JobPayload::CollectScores { stamp, generation },
        )
        .with_children(children)
    }

    async fn fetch_summary(
        &self,
        stamp: Stamp,
    ) -> Result<(Option<DistributionSummary>, Option<JobFailure>), CoordinatorError> {
        let node = JobNode::leaf(
            format!("fetch-summary-{stamp}"),
            PERSIST_QUEUE,
            JobPayload::FetchSummary { stamp },
        );
        match self.broker.run(node).await? {
            JobOutput::FetchSummary { summary, failure } => Ok((summary, failure)),
            _ => Err(CoordinatorError::UnexpectedOutput("fetch_summary")),
        }
    }

    async fn upload_summary(
        &self,
        summary: DistributionSummary,
    ) -> Result<Result<String, JobFailure>, CoordinatorError> {
        let node = JobNode::leaf(
            format!("persist-summary-{}", summary.stamp),
            PERSIST_QUEUE,
            JobPayload::PersistSummary { summary },
        );
        match self.broker.run(node).await? {
            JobOutput::PersistSummary {
                reference: Some(reference),
                failure: None,
            } => Ok(Ok(reference)),
            JobOutput::PersistSummary { failure, .. } => Ok(Err(failure.unwrap_or(
                JobFailure::Transient {
                    reason: "upload returned no reference".to_string(),
                },
            ))),
            _ => Err(CoordinatorError::UnexpectedOutput("persist_summary")),
        }
    }

    /// Result for a ledger that is not configured. The checkpoint stays in
    /// place so a correctly configured run resumes it.
    fn configuration_halt(&self, cp: &EpochCheckpoint, reason: String) -> EpochResult {
        error!(stamp = cp.stamp, %reason, "ledger is not configured; epoch halted");
        EPOCH_OUTCOMES_TOTAL.with_label_values(&["configuration"]).inc();
        EpochResult::from_checkpoint(
            cp,
            false,
            None,
            None,
            Some(EpochFailure::Configuration { reason }),
            now_ms(),
        )
    }

    fn conclude(&self, result: EpochResult) -> Result<EpochResult, CoordinatorError> {
        self.epochs.finish(&result)?;
        EPOCH_OUTCOMES_TOTAL
            .with_label_values(&[result.outcome()])
            .inc();
        info!(
            stamp = result.stamp,
            outcome = result.outcome(),
            scores = result.scores.len(),
            unprocessed = result.unprocessed.len(),
            "epoch finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::FixedDelayPacer;
    use relay_core::ledger_contract::mock_client::{
        MockDurableStore, MockLedger, MockReplica, DEFAULT_DISTRIBUTION_CONTRACT,
    };

    struct Harness {
        ledger: Arc<MockLedger>,
        durable: Arc<MockDurableStore>,
        epochs: EpochStore,
        coordinator: DistributionCoordinator,
    }

    fn harness(ledger: MockLedger) -> Harness {
        let ledger = Arc::new(ledger);
        let replica = Arc::new(MockReplica::new(ledger.clone()));
        let cache = Arc::new(ConsistencyCache::new(replica, ledger.clone()));
        let durable = Arc::new(MockDurableStore::new());
        let epochs = EpochStore::open_temporary().expect("store");
        let config = CoordinatorConfig {
            distribution_contract: DEFAULT_DISTRIBUTION_CONTRACT.to_string(),
            ..CoordinatorConfig::default()
        };
        let coordinator = DistributionCoordinator::new(
            config,
            epochs.clone(),
            ledger.clone(),
            cache,
            durable.clone(),
            Arc::new(FixedDelayPacer::default()),
        );
        Harness {
            ledger,
            durable,
            epochs,
            coordinator,
        }
    }

    fn scores(n: usize) -> Vec<Score> {
        (0..n)
            .map(|i| Score {
                address: format!("0x{i:040X}"),
                fingerprint: format!("{i:040X}"),
                value: 10,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn clean_epoch_records_summary_and_result() {
        let h = harness(MockLedger::default());
        let result = h.coordinator.start_epoch(7, scores(3)).await.unwrap();

        assert!(result.complete);
        assert_eq!(result.failure, None);
        assert_eq!(result.scores.len(), 3);
        assert_eq!(result.scores[0].address, format!("0x{:040x}", 0));
        let summary = result.summary.clone().unwrap();
        assert_eq!(summary.relay_count, 3);
        let reference = result.summary_ref.clone().unwrap();
        assert!(h.durable.get(&reference).is_some());
        assert!(h.epochs.load_checkpoint(7).unwrap().is_none());
        assert_eq!(h.epochs.load_result(7).unwrap(), Some(result.clone()));

        // finished stamps are returned unchanged
        let again = h.coordinator.start_epoch(7, scores(5)).await.unwrap();
        assert_eq!(again, result);
        assert_eq!(h.ledger.calls().distribute, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_scores_are_dropped_first_wins() {
        let h = harness(MockLedger::default());
        let mut input = scores(2);
        input.push(Score {
            value: 99,
            ..input[0].clone()
        });
        let result = h.coordinator.start_epoch(8, input).await.unwrap();
        assert_eq!(result.scores.len(), 2);
        assert_eq!(result.scores[0].score, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_retries_share_the_budget() {
        let h = harness(MockLedger::default());
        h.ledger.fail_distribute(10);
        let result = h.coordinator.start_epoch(9, scores(2)).await.unwrap();
        assert!(!result.complete);
        assert_eq!(result.failure, Some(EpochFailure::FinalizeExhausted));
        assert_eq!(h.ledger.calls().distribute, 7);
        assert_eq!(h.epochs.load_result(9).unwrap().map(|r| r.complete), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn persist_exhaustion_completes_without_summary() {
        let h = harness(MockLedger::default());
        h.durable.fail_next(10);
        let result = h.coordinator.start_epoch(10, scores(2)).await.unwrap();
        assert!(result.complete);
        assert_eq!(result.summary, None);
        assert_eq!(result.failure, Some(EpochFailure::PersistExhausted));
        assert_eq!(h.durable.uploads(), 4);
    }

    /// Answers score batches with a finalize output; everything else is real.
    struct StrayBatches(DistributionJobs);

    #[async_trait]
    impl JobHandler for StrayBatches {
        async fn handle(&self, payload: JobPayload, children: Vec<JobOutput>) -> JobOutput {
            match payload {
                JobPayload::AddScores { .. } => JobOutput::Distribute { failure: None },
                other => self.0.handle(other, children).await,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_batch_output_fails_the_epoch_and_keeps_the_checkpoint() {
        let ledger = Arc::new(MockLedger::default());
        let cache = Arc::new(ConsistencyCache::new(
            Arc::new(MockReplica::new(ledger.clone())),
            ledger.clone(),
        ));
        let jobs = DistributionJobs {
            contract: DEFAULT_DISTRIBUTION_CONTRACT.to_string(),
            ledger: ledger.clone(),
            cache,
            durable: Arc::new(MockDurableStore::new()),
            pacer: Arc::new(FixedDelayPacer::new(Duration::ZERO)),
            summary_max_age: DISTRIBUTION_MAX_AGE,
            poll_interval: Duration::from_millis(10),
            max_polls: 1,
        };
        let epochs = EpochStore::open_temporary().expect("store");
        let coordinator = DistributionCoordinator {
            config: CoordinatorConfig::default(),
            epochs: epochs.clone(),
            broker: JobBroker::new(Arc::new(StrayBatches(jobs)), 1),
            live: Arc::new(Mutex::new(HashSet::new())),
            stopping: AtomicBool::new(false),
        };

        let err = coordinator.start_epoch(12, scores(2)).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::UnexpectedOutput("collect_scores")));
        let cp = epochs.load_checkpoint(12).unwrap().expect("checkpoint");
        assert_eq!(cp.pending.len(), 2);
        assert!(cp.processed.is_empty());
        assert_eq!(ledger.calls().add_scores, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_start_of_the_same_stamp_is_rejected() {
        let h = harness(MockLedger::default());
        let (a, b) = tokio::join!(
            h.coordinator.start_epoch(11, scores(1)),
            h.coordinator.start_epoch(11, scores(1))
        );
        assert!(a.is_ok());
        assert!(matches!(b, Err(CoordinatorError::AlreadyRunning(11))));
    }
}
