//! Periodic distribution epochs under a storage-backed task lease.
//!
//! Only the lease owner starts epochs. Every tick renews the lease; a failed
//! renew steps down. Stepping down lets the running epoch finish its current
//! phase and save its checkpoint before the lease is released, so the next
//! owner resumes from that checkpoint with no writes of ours still in flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relay_core::Stamp;
use relay_storage::{LeaseRole, TaskOwnership};
use relay_workflow::{CoordinatorError, DistributionCoordinator};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::feed::ScoreFeed;

pub const DISTRIBUTION_TASK: &str = "distribution";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another holder owns the lease.
    Standby,
    /// An epoch (or resume pass) from an earlier tick is still running.
    Busy,
    /// Leadership was just taken; in-flight checkpoints are being resumed.
    Resuming,
    Started { stamp: Stamp },
    /// Leading, but the next epoch is not due or the feed was unavailable.
    Idle,
}

pub struct DistributionScheduler {
    coordinator: Arc<DistributionCoordinator>,
    ownership: TaskOwnership,
    feed: Box<dyn ScoreFeed>,
    interval_ms: u64,
    leading: bool,
    last_stamp: Option<Stamp>,
    running: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DistributionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionScheduler")
            .field("holder", &self.ownership.holder_id())
            .field("interval_ms", &self.interval_ms)
            .field("leading", &self.leading)
            .field("last_stamp", &self.last_stamp)
            .finish_non_exhaustive()
    }
}

impl DistributionScheduler {
    pub fn new(
        coordinator: Arc<DistributionCoordinator>,
        ownership: TaskOwnership,
        feed: Box<dyn ScoreFeed>,
        interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            ownership,
            feed,
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            leading: false,
            last_stamp: None,
            running: None,
        }
    }

    pub fn is_leading(&self) -> bool {
        self.leading
    }

    /// One election and scheduling iteration at wall-clock `now_ms`.
    pub async fn tick(&mut self, now_ms: u64) -> TickOutcome {
        let acquired = match self.hold_lease().await {
            Some(acquired) => acquired,
            None => return TickOutcome::Standby,
        };

        if self.running.as_ref().is_some_and(|h| !h.is_finished()) {
            return TickOutcome::Busy;
        }
        self.running = None;

        if acquired {
            self.coordinator.clear_stop();
            self.last_stamp = self.latest_known_stamp();
            let coordinator = self.coordinator.clone();
            self.running = Some(tokio::spawn(async move {
                match coordinator.resume_in_flight().await {
                    Ok(results) => info!(resumed = results.len(), "in-flight epochs resumed"),
                    Err(CoordinatorError::Stopped(stamp)) => {
                        info!(stamp, "resume pass stopped at a checkpoint")
                    }
                    Err(e) => error!(error = %e, "resuming in-flight epochs failed"),
                }
            }));
            return TickOutcome::Resuming;
        }

        if self
            .last_stamp
            .is_some_and(|last| now_ms < last.saturating_add(self.interval_ms))
        {
            return TickOutcome::Idle;
        }

        let scores = match self.feed.fetch_scores().await {
            Ok(scores) => scores,
            Err(e) => {
                warn!(error = %e, "score feed unavailable; epoch deferred");
                return TickOutcome::Idle;
            }
        };

        let stamp = now_ms;
        self.last_stamp = Some(stamp);
        info!(stamp, scores = scores.len(), "starting scheduled epoch");
        let coordinator = self.coordinator.clone();
        self.running = Some(tokio::spawn(async move {
            match coordinator.start_epoch(stamp, scores).await {
                Ok(result) => info!(stamp, outcome = result.outcome(), "scheduled epoch ended"),
                Err(CoordinatorError::Stopped(_)) => info!(stamp, "scheduled epoch paused at a checkpoint"),
                Err(e) => error!(stamp, error = %e, "scheduled epoch failed"),
            }
        }));
        TickOutcome::Started { stamp }
    }

    /// Waits for the running epoch or resume pass, if any.
    pub async fn wait_idle(&mut self) {
        if let Some(handle) = self.running.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
    }

    /// Ticks until `shutdown` resolves, then releases the lease.
    pub async fn run<S>(mut self, tick_every: Duration, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(tick_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.tick(relay_core::now_ms()).await;
                }
            }
        }
        self.step_down().await;
    }

    /// `Some(true)` on a fresh acquisition, `Some(false)` on renewal, `None` when not owner.
    async fn hold_lease(&mut self) -> Option<bool> {
        if self.leading {
            match self.ownership.renew(DISTRIBUTION_TASK) {
                Ok(true) => Some(false),
                Ok(false) => {
                    warn!(holder = self.ownership.holder_id(), "distribution lease lost");
                    self.step_down().await;
                    None
                }
                Err(e) => {
                    warn!(error = %e, "distribution lease renew failed");
                    self.step_down().await;
                    None
                }
            }
        } else {
            match self.ownership.try_acquire(DISTRIBUTION_TASK) {
                Ok(LeaseRole::Owner) => {
                    info!(holder = self.ownership.holder_id(), "distribution lease acquired");
                    self.leading = true;
                    Some(true)
                }
                Ok(LeaseRole::Standby) => None,
                Err(e) => {
                    warn!(error = %e, "distribution lease acquire failed");
                    None
                }
            }
        }
    }

    /// Stops new work, waits for the running phase to reach its checkpoint,
    /// then releases the lease.
    pub async fn step_down(&mut self) {
        self.coordinator.stop_at_boundary();
        self.wait_idle().await;
        if self.leading {
            if let Err(e) = self.ownership.release(DISTRIBUTION_TASK) {
                warn!(error = %e, "distribution lease release failed");
            }
        }
        self.leading = false;
    }

    fn latest_known_stamp(&self) -> Option<Stamp> {
        let epochs = self.coordinator.epochs();
        let finished = epochs
            .list_results(1)
            .ok()
            .and_then(|r| r.first().map(|r| r.stamp));
        let in_flight = epochs
            .list_checkpoints()
            .ok()
            .and_then(|cps| cps.iter().map(|cp| cp.stamp).max());
        finished.max(in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, RelayNodeConfig};
    use crate::feed::FileScoreFeed;
    use crate::wiring::{build_services, Collaborators};
    use relay_core::ledger_contract::LedgerClient;
    use relay_storage::WorkflowStorage;

    const CONFIG: &str = r#"
[distribution]
poll_interval_ms = 10
pacing = { mode = "fixed", delay_ms = 0 }
"#;

    fn write_feed(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("scores.json");
        let scores: Vec<_> = (0..3)
            .map(|i| {
                serde_json::json!({
                    "address": format!("0x{i:040x}"),
                    "fingerprint": format!("{i:040X}"),
                    "value": 10 + i,
                })
            })
            .collect();
        std::fs::write(&path, serde_json::to_vec(&scores).unwrap()).unwrap();
        path
    }

    fn scheduler(storage: &WorkflowStorage, holder: &str, feed: &std::path::Path) -> DistributionScheduler {
        let cfg = parse_config(CONFIG).unwrap();
        scheduler_over(&cfg, &Collaborators::mock(&cfg), storage, holder, feed)
    }

    fn scheduler_over(
        cfg: &RelayNodeConfig,
        collab: &Collaborators,
        storage: &WorkflowStorage,
        holder: &str,
        feed: &std::path::Path,
    ) -> DistributionScheduler {
        let services = build_services(cfg, collab, storage.clone());
        DistributionScheduler::new(
            services.coordinator,
            storage.task_ownership(holder, 60_000).unwrap(),
            Box::new(FileScoreFeed::new(feed)),
            Duration::from_secs(3_600),
        )
    }

    #[tokio::test]
    async fn owner_runs_one_epoch_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let feed = write_feed(dir.path());
        let storage = WorkflowStorage::open_temporary().unwrap();
        let mut s = scheduler(&storage, "node-a", &feed);

        assert_eq!(s.tick(1_000).await, TickOutcome::Resuming);
        s.wait_idle().await;
        assert_eq!(s.tick(1_000).await, TickOutcome::Started { stamp: 1_000 });
        s.wait_idle().await;
        assert_eq!(s.tick(2_000).await, TickOutcome::Idle);

        let result = storage.epochs.load_result(1_000).unwrap().unwrap();
        assert!(result.complete);
        assert_eq!(result.scores.len(), 3);
        assert!(result.summary_ref.is_some());

        assert_eq!(
            s.tick(1_000 + 3_600_000).await,
            TickOutcome::Started {
                stamp: 1_000 + 3_600_000
            }
        );
        s.wait_idle().await;
    }

    #[tokio::test]
    async fn second_holder_stays_on_standby() {
        let dir = tempfile::tempdir().unwrap();
        let feed = write_feed(dir.path());
        let storage = WorkflowStorage::open_temporary().unwrap();
        let mut a = scheduler(&storage, "node-a", &feed);
        let mut b = scheduler(&storage, "node-b", &feed);

        assert_eq!(a.tick(1_000).await, TickOutcome::Resuming);
        assert_eq!(b.tick(1_000).await, TickOutcome::Standby);
        assert!(a.is_leading());
        assert!(!b.is_leading());
        a.wait_idle().await;

        a.step_down().await;
        assert_eq!(b.tick(1_000).await, TickOutcome::Resuming);
        b.wait_idle().await;
    }

    #[tokio::test]
    async fn new_owner_spaces_epochs_from_stored_results() {
        let dir = tempfile::tempdir().unwrap();
        let feed = write_feed(dir.path());
        let storage = WorkflowStorage::open_temporary().unwrap();
        let mut a = scheduler(&storage, "node-a", &feed);
        a.tick(1_000).await;
        a.wait_idle().await;
        a.tick(1_000).await;
        a.wait_idle().await;
        a.step_down().await;

        let mut b = scheduler(&storage, "node-b", &feed);
        assert_eq!(b.tick(5_000).await, TickOutcome::Resuming);
        b.wait_idle().await;
        assert_eq!(b.tick(5_000).await, TickOutcome::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stepping_down_lets_the_running_phase_finish() {
        let dir = tempfile::tempdir().unwrap();
        let feed = write_feed(dir.path());
        let storage = WorkflowStorage::open_temporary().unwrap();
        let cfg = parse_config(
            r#"
[distribution]
poll_interval_ms = 10
pacing = { mode = "fixed", delay_ms = 1000 }
"#,
        )
        .unwrap();
        let collab = Collaborators::mock(&cfg);
        let mut a = scheduler_over(&cfg, &collab, &storage, "node-a", &feed);
        let mut b = scheduler_over(&cfg, &collab, &storage, "node-b", &feed);

        assert_eq!(a.tick(1_000).await, TickOutcome::Resuming);
        a.wait_idle().await;
        assert_eq!(a.tick(1_000).await, TickOutcome::Started { stamp: 1_000 });
        // the score batch is waiting on its pacing delay
        tokio::time::sleep(Duration::from_millis(100)).await;
        a.step_down().await;
        assert!(!a.is_leading());

        // the submitted batch was recorded before the lease was released
        let cp = storage.epochs.load_checkpoint(1_000).unwrap().expect("checkpoint");
        assert_eq!(cp.processed.len(), 3);
        assert_eq!(cp.phase.as_str(), "finalizing");
        assert!(storage.epochs.load_result(1_000).unwrap().is_none());

        assert_eq!(b.tick(2_000).await, TickOutcome::Resuming);
        b.wait_idle().await;
        let result = storage.epochs.load_result(1_000).unwrap().expect("result");
        assert!(result.complete);
        assert_eq!(result.scores.len(), 3);
        let state = collab
            .ledger
            .read_state(&collab.distribution_contract)
            .await
            .unwrap();
        assert!(state.previous_distributions.contains_key(&1_000));
    }
}
